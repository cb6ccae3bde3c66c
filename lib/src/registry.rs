//! Interacts with remote OCI registries.
//!
//! Implements the subset of the Distribution v2 HTTP API the puller needs:
//! manifest and index GETs with the usual Accept list, bearer-token auth
//! driven by `WWW-Authenticate` challenges, and blob downloads verified
//! against their digest. Downloaded layer tarballs are converted into
//! archive pairs with whiteout names translated to deleted entries.

use std::{collections::BTreeMap, path::PathBuf, str::FromStr};

use base64::Engine;
use derive_more::Debug;
use futures_lite::StreamExt;
use serde::Deserialize;
use sha2::{Digest as _, Sha256};
use tap::Pipe;
use tokio::io::AsyncWriteExt;
use tokio_tar::EntryType;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use crate::{
    archive::{ArchiveWriter, EntryMeta, INDEX_EXT},
    error::RegistryError,
    store::{Image, ImageStore},
    transform::Compression,
    Architecture, Digest, ImageConfig, Reference, UserSpec, Version,
};

/// Docker schema 2 manifest.
pub const MEDIA_TYPE_MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// Docker schema 2 manifest list.
pub const MEDIA_TYPE_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";

/// OCI image manifest.
pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";

/// OCI image index.
pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";

/// Authentication method for a registry.
#[derive(Debug, Clone, Default)]
pub enum Authentication {
    /// No authentication
    #[default]
    None,

    /// Basic authentication, folded into token requests.
    Basic {
        username: String,
        #[debug(skip)]
        password: String,
    },
}

impl Authentication {
    /// Create an instance for basic authentication.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Basic {
            username: username.into(),
            password: password.into(),
        }
    }
}

/// A descriptor referencing a blob by digest.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Descriptor {
    media_type: Option<String>,
    digest: Digest,
    #[serde(default)]
    #[allow(dead_code)]
    size: i64,
}

/// Platform fields of an index entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IndexPlatform {
    architecture: String,
    os: String,
}

/// One manifest reference inside an index.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IndexManifest {
    digest: Digest,
    platform: Option<IndexPlatform>,
}

#[derive(Debug, Deserialize)]
struct ManifestIndex {
    manifests: Vec<IndexManifest>,
}

#[derive(Debug, Deserialize)]
struct ManifestV2 {
    config: Descriptor,
    layers: Vec<Descriptor>,
}

/// Legacy schema 1 manifest; only the layer digests are usable.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManifestV1 {
    fs_layers: Vec<V1Layer>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct V1Layer {
    blob_sum: Digest,
}

/// The runtime portion of an image config blob.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ConfigBlobRuntime {
    #[serde(default)]
    env: Option<Vec<String>>,
    #[serde(default)]
    cmd: Option<Vec<String>>,
    #[serde(default)]
    entrypoint: Option<Vec<String>>,
    #[serde(default)]
    working_dir: Option<String>,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    labels: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Default, Deserialize)]
struct ConfigBlob {
    #[serde(default)]
    architecture: Option<String>,
    #[serde(default)]
    config: Option<ConfigBlobRuntime>,
}

/// A client for one registry pull session.
///
/// Bearer tokens are cached per client; a 401 on any request triggers at most
/// one reauthentication before the error is surfaced.
#[derive(Debug)]
pub struct Client {
    http: reqwest::Client,
    auth: Authentication,
    store: ImageStore,
    token: Option<String>,
}

impl Client {
    pub fn new(store: ImageStore, auth: Authentication) -> Result<Self, RegistryError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("skiff/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            auth,
            store,
            token: None,
        })
    }

    /// Pull the image for the given architecture, assembling its layer
    /// archives and config into the store. Returns the assembled image.
    #[tracing::instrument(skip(self))]
    pub async fn pull_for_arch(
        &mut self,
        reference: &Reference,
        arch: Architecture,
    ) -> Result<Image, RegistryError> {
        let (manifest, digests) = self.resolve_manifest(reference, arch).await?;

        let image_dir = self.store.image_dir(reference);
        tokio::fs::create_dir_all(&image_dir).await?;

        let mut config = match &manifest.config {
            Some(descriptor) => {
                let blob = self.fetch_blob(reference, &descriptor.digest).await?;
                let raw = tokio::fs::read(&blob).await?;
                let parsed: ConfigBlob = serde_json::from_slice(&raw)
                    .map_err(|e| RegistryError::MalformedManifest(format!("config blob: {e}")))?;
                image_config_from_blob(parsed)
            }
            None => ImageConfig::default(),
        };
        config.layers = digests.clone();
        if config.architecture.is_none() {
            config.architecture = Some(arch);
        }

        for layer in &manifest.layers {
            let index_path = image_dir.join(format!("{}.{INDEX_EXT}", layer.digest.as_hex()));
            if index_path.is_file() {
                debug!(digest = %layer.digest, "layer archive cached");
                continue;
            }
            let blob = self.fetch_blob(reference, &layer.digest).await?;
            ingest_layer(&blob, layer.compression, &image_dir, &layer.digest).await?;
            info!(digest = %layer.digest, "layer converted");
        }

        self.store
            .write_config(&image_dir, &config)
            .await
            .map_err(|e| RegistryError::Io(std::io::Error::other(e.to_string())))?;

        Ok(Image {
            dir: image_dir,
            config,
        })
    }

    /// Fetch the manifest for `reference`, following an index to the
    /// platform-matched entry and synthesizing v2 shape from legacy v1.
    async fn resolve_manifest(
        &mut self,
        reference: &Reference,
        arch: Architecture,
    ) -> Result<(ResolvedManifest, Vec<Digest>), RegistryError> {
        let version = match &reference.version {
            Version::Tag(tag) => tag.clone(),
            Version::Digest(digest) => digest.to_string(),
        };
        let (body, content_type) = self.fetch_manifest_raw(reference, &version).await?;

        // An index points at per-platform manifests; select ours and recurse
        // one level down by digest.
        let (body, content_type) = if is_index(&content_type) {
            let index: ManifestIndex = serde_json::from_slice(&body)
                .map_err(|e| RegistryError::MalformedManifest(format!("index: {e}")))?;
            let selected = index
                .manifests
                .iter()
                .find(|m| {
                    m.platform.as_ref().is_some_and(|p| {
                        p.os == "linux" && p.architecture == arch.as_ref()
                    })
                })
                .ok_or_else(|| RegistryError::NoMatchingManifest {
                    reference: reference.to_string(),
                    architecture: arch.to_string(),
                })?;
            debug!(digest = %selected.digest, "selected manifest from index");
            self.fetch_manifest_raw(reference, &selected.digest.to_string())
                .await?
        } else {
            (body, content_type)
        };

        if content_type.starts_with("application/vnd.docker.distribution.manifest.v1") {
            let v1: ManifestV1 = serde_json::from_slice(&body)
                .map_err(|e| RegistryError::MalformedManifest(format!("v1 manifest: {e}")))?;
            // v1 lists layers newest-first; reverse into application order.
            let layers = v1
                .fs_layers
                .into_iter()
                .rev()
                .map(|l| LayerRef {
                    digest: l.blob_sum,
                    compression: Compression::Gzip,
                })
                .collect::<Vec<_>>();
            let digests = layers.iter().map(|l| l.digest.clone()).collect();
            warn!("legacy v1 manifest: no config blob available");
            return Ok((
                ResolvedManifest {
                    config: None,
                    layers,
                },
                digests,
            ));
        }

        let manifest: ManifestV2 = serde_json::from_slice(&body)
            .map_err(|e| RegistryError::MalformedManifest(format!("manifest: {e}")))?;
        let layers = manifest
            .layers
            .iter()
            .map(|descriptor| LayerRef {
                digest: descriptor.digest.clone(),
                compression: compression_for(descriptor.media_type.as_deref()),
            })
            .collect::<Vec<_>>();
        let digests = layers.iter().map(|l| l.digest.clone()).collect();
        Ok((
            ResolvedManifest {
                config: Some(manifest.config),
                layers,
            },
            digests,
        ))
    }

    async fn fetch_manifest_raw(
        &mut self,
        reference: &Reference,
        version: &str,
    ) -> Result<(Vec<u8>, String), RegistryError> {
        let url = format!(
            "{}/v2/{}/manifests/{version}",
            registry_base(&reference.host),
            reference.repository,
        );
        let accept = [
            MEDIA_TYPE_MANIFEST_V2,
            MEDIA_TYPE_MANIFEST_LIST,
            MEDIA_TYPE_OCI_MANIFEST,
            MEDIA_TYPE_OCI_INDEX,
        ]
        .join(", ");

        let response = self.get_with_auth(&url, &reference.repository, Some(&accept)).await?;
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(MEDIA_TYPE_MANIFEST_V2)
            .to_string();
        let body = response.bytes().await?.to_vec();
        Ok((body, content_type))
    }

    /// Fetch a blob into the store's cache, verifying its digest.
    /// A cached blob short-circuits the download.
    #[tracing::instrument(skip(self, reference))]
    async fn fetch_blob(
        &mut self,
        reference: &Reference,
        digest: &Digest,
    ) -> Result<PathBuf, RegistryError> {
        let dest = self.store.blob_path(digest);
        if dest.is_file() {
            debug!(digest = %digest, "blob cached");
            return Ok(dest);
        }

        let url = format!(
            "{}/v2/{}/blobs/{digest}",
            registry_base(&reference.host),
            reference.repository,
        );
        let response = self.get_with_auth(&url, &reference.repository, None).await?;

        let staging = dest.with_extension("partial");
        let mut file = tokio::fs::File::create(&staging).await?;
        let mut hasher = Sha256::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        file.sync_all().await?;

        let actual = Digest::from_hash(hasher.finalize().to_vec());
        if digest.algorithm == Digest::SHA256 && actual != *digest {
            tokio::fs::remove_file(&staging).await.ok();
            return Err(RegistryError::DigestMismatch {
                expected: digest.to_string(),
                actual: actual.to_string(),
            });
        }

        tokio::fs::rename(&staging, &dest).await?;
        Ok(dest)
    }

    /// GET with the cached bearer token, satisfying one `WWW-Authenticate`
    /// challenge per request before surfacing the 401.
    async fn get_with_auth(
        &mut self,
        url: &str,
        repository: &str,
        accept: Option<&str>,
    ) -> Result<reqwest::Response, RegistryError> {
        for attempt in 0..2 {
            let mut request = self.http.get(url);
            if let Some(accept) = accept {
                request = request.header(reqwest::header::ACCEPT, accept);
            }
            if let Some(token) = &self.token {
                request = request.bearer_auth(token);
            }

            let response = request.send().await?;
            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }
            if status.as_u16() == 401 && attempt == 0 {
                let challenge = response
                    .headers()
                    .get(reqwest::header::WWW_AUTHENTICATE)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
                    .ok_or_else(|| {
                        RegistryError::TokenFetch("401 without WWW-Authenticate".into())
                    })?;
                self.authenticate(&challenge, repository).await?;
                continue;
            }
            return Err(RegistryError::Http {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        unreachable!("authentication loop always returns")
    }

    /// Satisfy a bearer challenge by fetching a token from the advertised
    /// realm, folding in basic credentials when configured.
    async fn authenticate(
        &mut self,
        challenge: &str,
        repository: &str,
    ) -> Result<(), RegistryError> {
        let params = parse_challenge(challenge)
            .ok_or_else(|| RegistryError::TokenFetch(format!("unsupported challenge: {challenge}")))?;
        let realm = params
            .get("realm")
            .ok_or_else(|| RegistryError::TokenFetch("challenge missing realm".into()))?;

        let scope = params
            .get("scope")
            .cloned()
            .unwrap_or_else(|| format!("repository:{repository}:pull"));

        let mut request = self.http.get(realm.as_str()).query(&[("scope", scope.as_str())]);
        if let Some(service) = params.get("service") {
            request = request.query(&[("service", service.as_str())]);
        }
        if let Authentication::Basic { username, password } = &self.auth {
            let encoded = base64::engine::general_purpose::STANDARD
                .encode(format!("{username}:{password}"));
            request = request.header(reqwest::header::AUTHORIZATION, format!("Basic {encoded}"));
        }

        #[derive(Deserialize)]
        struct TokenResponse {
            #[serde(default)]
            token: Option<String>,
            #[serde(default)]
            access_token: Option<String>,
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(RegistryError::TokenFetch(format!(
                "{realm} returned {}",
                response.status()
            )));
        }
        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| RegistryError::TokenFetch(format!("decode token response: {e}")))?;
        self.token = body
            .token
            .or(body.access_token)
            .pipe(|t| t.filter(|t| !t.is_empty()))
            .ok_or_else(|| RegistryError::TokenFetch("token response carried no token".into()))?
            .pipe(Some);
        debug!("bearer token acquired");
        Ok(())
    }
}

#[derive(Debug)]
struct ResolvedManifest {
    config: Option<Descriptor>,
    layers: Vec<LayerRef>,
}

#[derive(Debug)]
struct LayerRef {
    digest: Digest,
    compression: Compression,
}

/// Convert a downloaded layer blob into an archive pair in `dir`.
///
/// Whiteout names are translated as they stream past: `.wh..wh..opq` becomes
/// a deleted entry on its parent directory, `.wh.<name>` a deleted entry on
/// the sibling `<name>`. Also used by the build pipeline to archive layers
/// snapshotted from the build VM.
#[tracing::instrument(skip_all, fields(digest = %digest))]
pub async fn ingest_layer(
    blob: &std::path::Path,
    compression: Compression,
    dir: &std::path::Path,
    digest: &Digest,
) -> Result<(), RegistryError> {
    let file = tokio::fs::File::open(blob).await?;
    let stream = compression.decode(ReaderStream::new(file));
    let reader = tokio_util::io::StreamReader::new(stream);
    let mut tar = tokio_tar::Archive::new(reader);

    let mut writer = ArchiveWriter::create(dir).await?;
    let mut entries = tar.entries()?;
    while let Some(entry) = entries.next().await {
        let mut entry = entry?;
        let header = entry.header();
        let kind = header.entry_type();

        let path = entry.path()?.to_string_lossy().to_string();
        let path = path
            .trim_start_matches("./")
            .trim_end_matches('/')
            .to_string();
        if path.is_empty() || path == "." {
            continue;
        }

        let meta = EntryMeta {
            mode: header.mode().unwrap_or(0o644),
            uid: header.uid().unwrap_or(0) as u32,
            gid: header.gid().unwrap_or(0) as u32,
            mtime: header.mtime().unwrap_or(0) as i64,
        };

        if let Some(whiteout) = translate_whiteout(&path) {
            writer.push_whiteout(whiteout);
            continue;
        }

        match kind {
            EntryType::Regular | EntryType::Continuous => {
                writer.push_file(path, meta, &mut entry).await?;
            }
            EntryType::Directory => writer.push_dir(path, meta),
            EntryType::Symlink => {
                let target = entry
                    .link_name()?
                    .map(|t| t.to_string_lossy().to_string())
                    .unwrap_or_default();
                writer.push_symlink(path, target, meta);
            }
            EntryType::Link => {
                let target = entry
                    .link_name()?
                    .map(|t| t.to_string_lossy().to_string())
                    .unwrap_or_default();
                writer.push_hardlink(path, target, meta);
            }
            other => {
                warn!(?other, %path, "skip: unsupported tar entry type");
            }
        }
    }

    writer.finish(digest).await?;
    Ok(())
}

/// Translate AUFS whiteout names into the path they delete.
/// Returns `None` for ordinary entries.
fn translate_whiteout(path: &str) -> Option<String> {
    const OPAQUE: &str = ".wh..wh..opq";
    const PREFIX: &str = ".wh.";

    let (parent, name) = match path.rsplit_once('/') {
        Some((parent, name)) => (Some(parent), name),
        None => (None, path),
    };

    if name == OPAQUE {
        // Opaque markers delete the directory that contains them.
        return Some(parent.unwrap_or("").to_string());
    }
    let deleted = name.strip_prefix(PREFIX)?;
    Some(match parent {
        Some(parent) => format!("{parent}/{deleted}"),
        None => deleted.to_string(),
    })
}

/// Base URL for a registry host. Docker Hub's API lives on a different host
/// than its reference name; localhost registries speak plain HTTP.
fn registry_base(host: &str) -> String {
    match host {
        "docker.io" | "index.docker.io" => "https://registry-1.docker.io".to_string(),
        h if h.starts_with("localhost") || h.starts_with("127.0.0.1") => format!("http://{h}"),
        h => format!("https://{h}"),
    }
}

fn is_index(content_type: &str) -> bool {
    content_type.starts_with(MEDIA_TYPE_MANIFEST_LIST) || content_type.starts_with(MEDIA_TYPE_OCI_INDEX)
}

/// Select blob compression from a layer media type.
fn compression_for(media_type: Option<&str>) -> Compression {
    match media_type {
        Some(mt) if mt.ends_with("+zstd") => Compression::Zstd,
        Some(mt) if mt.ends_with("+gzip") || mt.ends_with(".tar.gzip") => Compression::Gzip,
        _ => Compression::None,
    }
}

/// Parse a `Bearer k="v", k2="v2"` challenge into its parameters.
fn parse_challenge(challenge: &str) -> Option<BTreeMap<String, String>> {
    let rest = challenge.strip_prefix("Bearer ")?;
    let mut params = BTreeMap::new();
    for part in rest.split(',') {
        let (key, value) = part.trim().split_once('=')?;
        params.insert(key.to_string(), value.trim_matches('"').to_string());
    }
    Some(params)
}

fn image_config_from_blob(blob: ConfigBlob) -> ImageConfig {
    let runtime = blob.config.unwrap_or_default();
    ImageConfig {
        layers: Vec::new(),
        env: runtime.env.unwrap_or_default(),
        cmd: runtime.cmd.unwrap_or_default(),
        entrypoint: runtime.entrypoint.unwrap_or_default(),
        workdir: runtime
            .working_dir
            .filter(|w| !w.is_empty())
            .unwrap_or_else(|| "/".to_string()),
        user: runtime
            .user
            .as_deref()
            .filter(|u| !u.is_empty())
            .map(UserSpec::parse)
            .unwrap_or_default(),
        labels: runtime.labels.unwrap_or_default(),
        architecture: blob
            .architecture
            .and_then(|a| Architecture::from_str(&a).ok()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use simple_test_case::test_case;

    #[test_case("etc/.wh.motd", Some("etc/motd"); "sibling")]
    #[test_case(".wh.root-file", Some("root-file"); "at_root")]
    #[test_case("var/cache/.wh..wh..opq", Some("var/cache"); "opaque")]
    #[test_case("etc/motd", None; "plain")]
    #[test_case("etc/whale", None; "not_a_prefix")]
    #[test]
    fn whiteout_translation(path: &str, expected: Option<&str>) {
        pretty_assertions::assert_eq!(translate_whiteout(path), expected.map(str::to_string));
    }

    #[test_case(Some("application/vnd.oci.image.layer.v1.tar+gzip"), Compression::Gzip; "oci_gzip")]
    #[test_case(Some("application/vnd.docker.image.rootfs.diff.tar.gzip"), Compression::Gzip; "docker_gzip")]
    #[test_case(Some("application/vnd.oci.image.layer.v1.tar+zstd"), Compression::Zstd; "oci_zstd")]
    #[test_case(Some("application/vnd.oci.image.layer.v1.tar"), Compression::None; "plain_tar")]
    #[test_case(None, Compression::None; "unspecified")]
    #[test]
    fn compression_selection(media_type: Option<&str>, expected: Compression) {
        pretty_assertions::assert_eq!(compression_for(media_type), expected);
    }

    #[test]
    fn challenge_parsing() {
        let params = parse_challenge(
            r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/alpine:pull""#,
        )
        .expect("parse challenge");
        assert_eq!(params["realm"], "https://auth.docker.io/token");
        assert_eq!(params["service"], "registry.docker.io");
        assert_eq!(params["scope"], "repository:library/alpine:pull");
    }

    #[test]
    fn challenge_requires_bearer() {
        assert!(parse_challenge(r#"Basic realm="registry""#).is_none());
    }

    #[test]
    fn docker_hub_base_is_rewritten() {
        assert_eq!(registry_base("docker.io"), "https://registry-1.docker.io");
        assert_eq!(registry_base("ghcr.io"), "https://ghcr.io");
        assert_eq!(registry_base("localhost:5000"), "http://localhost:5000");
    }

    #[test]
    fn config_blob_maps_to_image_config() {
        let blob: ConfigBlob = serde_json::from_str(
            r#"{
                "architecture": "amd64",
                "config": {
                    "Env": ["PATH=/usr/bin"],
                    "Cmd": ["/bin/sh"],
                    "WorkingDir": "",
                    "User": "1000:1000",
                    "Labels": {"maintainer": "someone"}
                }
            }"#,
        )
        .expect("parse blob");

        let config = image_config_from_blob(blob);
        assert_eq!(config.env, vec!["PATH=/usr/bin"]);
        assert_eq!(config.cmd, vec!["/bin/sh"]);
        assert_eq!(config.workdir, "/");
        assert_eq!(config.user.uid, Some(1000));
        assert_eq!(config.architecture, Some(Architecture::Amd64));
    }
}
