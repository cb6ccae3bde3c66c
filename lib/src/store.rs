//! On-disk image store.
//!
//! The store keeps two things under its root: a `blobs/` directory of raw
//! downloads addressed by digest hex (the fetch cache), and an `images/`
//! directory where each image gets a directory of layer archive pairs plus a
//! `config.json` describing layer order and runtime fields.

use std::path::{Path, PathBuf};

use color_eyre::eyre::{Context, Result};
use tracing::debug;

use crate::{
    archive::{Archive, INDEX_EXT},
    error::ConfigError,
    Digest, ImageConfig, Reference, Version,
};

/// The file describing an image's layers and runtime configuration.
pub const CONFIG_FILENAME: &str = "config.json";

/// An on-disk store of blobs and assembled images.
#[derive(Debug, Clone)]
pub struct ImageStore {
    root: PathBuf,
}

impl ImageStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join("blobs")).context("create blobs directory")?;
        std::fs::create_dir_all(root.join("images")).context("create images directory")?;
        Ok(Self { root })
    }

    /// Open the store at the default cache location.
    pub fn open_default() -> Result<Self> {
        Self::open(crate::cache_dir()?)
    }

    /// Path a blob with the given digest is cached at.
    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.root.join("blobs").join(digest.as_hex())
    }

    /// Whether the blob is already cached.
    pub fn has_blob(&self, digest: &Digest) -> bool {
        self.blob_path(digest).is_file()
    }

    /// Directory an image's layers and config are assembled into.
    ///
    /// References are flattened into a single path component; digests address
    /// by hex so repeated pulls of pinned references share a directory.
    pub fn image_dir(&self, reference: &Reference) -> PathBuf {
        let name = match &reference.version {
            Version::Digest(digest) => digest.as_hex(),
            Version::Tag(tag) => format!(
                "{}_{}_{tag}",
                reference.host.replace(['/', ':'], "_"),
                reference.repository.replace('/', "_"),
            ),
        };
        self.root.join("images").join(name)
    }

    /// Write the image config into its directory.
    pub async fn write_config(&self, dir: &Path, config: &ImageConfig) -> Result<()> {
        let rendered = serde_json::to_string_pretty(config).context("serialize config")?;
        tokio::fs::write(dir.join(CONFIG_FILENAME), rendered)
            .await
            .context("write config")
    }

    /// Load a previously assembled image from its directory.
    pub fn load(&self, dir: impl Into<PathBuf>) -> Result<Image, ConfigError> {
        let dir = dir.into();
        let path = dir.join(CONFIG_FILENAME);
        let raw = std::fs::read(&path).map_err(|_| ConfigError::MissingConfig(path.clone()))?;
        let config: ImageConfig = serde_json::from_slice(&raw)
            .map_err(|e| ConfigError::InvalidReference(format!("parse {}: {e}", path.display())))?;
        debug!(dir = %dir.display(), layers = config.layers.len(), "image loaded");
        Ok(Image { dir, config })
    }
}

/// An assembled image: a directory of layer archives plus its config.
#[derive(Debug, Clone)]
pub struct Image {
    pub dir: PathBuf,
    pub config: ImageConfig,
}

impl Image {
    /// Open the layer archives in application order, base first.
    pub fn open_layers(&self) -> Result<Vec<Archive>> {
        self.config
            .layers
            .iter()
            .map(|digest| {
                let index = self.dir.join(format!("{}.{INDEX_EXT}", digest.as_hex()));
                Archive::open(&index)
                    .with_context(|| format!("open layer archive {}", index.display()))
            })
            .collect()
    }

    /// Assemble the image's virtual root filesystem.
    pub fn filesystem(&self) -> Result<crate::layerfs::LayerFs> {
        let layers = self.open_layers()?;
        Ok(crate::layerfs::LayerFs::new(
            layers,
            self.config.workdir.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::str::FromStr;

    #[test]
    fn image_dir_distinguishes_tags() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ImageStore::open(dir.path()).expect("open");

        let a = store.image_dir(&Reference::from_str("alpine:3.19").expect("ref"));
        let b = store.image_dir(&Reference::from_str("alpine:3.20").expect("ref"));
        assert_ne!(a, b);
    }

    #[test]
    fn image_dir_shares_pinned_digests() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ImageStore::open(dir.path()).expect("open");
        let digest = Digest::of_bytes(b"layer");

        let a = store.image_dir(
            &Reference::builder()
                .host("docker.io")
                .repository("library/alpine")
                .digest(digest.clone())
                .build(),
        );
        let b = store.image_dir(
            &Reference::builder()
                .host("ghcr.io")
                .repository("mirror/alpine")
                .digest(digest)
                .build(),
        );
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn config_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ImageStore::open(dir.path()).expect("open");

        let image_dir = dir.path().join("images/test");
        tokio::fs::create_dir_all(&image_dir).await.expect("mkdir");

        let config = ImageConfig::builder()
            .cmd(vec!["/bin/sh".to_string()])
            .workdir("/app")
            .build();
        store.write_config(&image_dir, &config).await.expect("write");

        let image = store.load(&image_dir).expect("load");
        assert_eq!(image.config.cmd, vec!["/bin/sh"]);
        assert_eq!(image.config.workdir, "/app");
    }

    #[test]
    fn missing_config_is_typed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ImageStore::open(dir.path()).expect("open");
        assert!(matches!(
            store.load(dir.path().join("images/absent")),
            Err(ConfigError::MissingConfig(_))
        ));
    }
}
