#![deny(clippy::uninlined_format_args)]
#![deny(clippy::unwrap_used)]
#![warn(rust_2018_idioms)]

use std::{collections::BTreeMap, path::PathBuf, str::FromStr};

use bon::Builder;
use color_eyre::eyre::{bail, ensure, eyre, Context, Result};
use derive_more::derive::Display;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tap::Pipe;
use tracing::warn;

pub mod archive;
pub mod dockerfile;
pub mod error;
pub mod layerfs;
pub mod net;
pub mod registry;
pub mod store;
pub mod transform;
pub mod virtiofs;
pub mod vm;

/// Users can set this environment variable to relocate the on-disk cache.
/// If not set, the cache lives under the home directory.
pub const CACHE_VAR: &str = "SKIFF_CACHE";

/// The default registry host.
pub const DEFAULT_REGISTRY: &str = "docker.io";

/// The default namespace prefixed to single-token image names.
pub const DEFAULT_NAMESPACE: &str = "library";

/// Root of the on-disk cache: `$SKIFF_CACHE`, falling back to `~/.skiff`.
pub fn cache_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(CACHE_VAR) {
        return Ok(PathBuf::from(dir));
    }
    homedir()
        .context("get home directory")?
        .join(".skiff")
        .pipe(Ok)
}

/// Get the current home directory for the current user.
fn homedir() -> Result<PathBuf, std::env::VarError> {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .map(PathBuf::from)
}

/// A content-addressable digest in the format `algorithm:hash`.
///
/// The `FromStr` implementation parses the format used in OCI containers,
/// which is `algorithm:hex`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Digest {
    /// The hashing algorithm used (e.g. "sha256")
    pub algorithm: String,

    /// The raw hash bytes
    pub hash: Vec<u8>,
}

impl Digest {
    /// The SHA256 algorithm
    pub const SHA256: &'static str = "sha256";

    /// Returns the hash as a hex string
    pub fn as_hex(&self) -> String {
        hex::encode(&self.hash)
    }

    /// Parse the provided string as a SHA256 hex digest.
    pub fn from_sha256(s: &str) -> Result<Self> {
        Ok(Self {
            algorithm: Self::SHA256.to_string(),
            hash: hex::decode(s).map_err(|e| eyre!("invalid hex string: {e}"))?,
        })
    }

    /// Create a new instance assuming it is sha256 encoded.
    pub fn from_hash(hash: impl Into<Vec<u8>>) -> Self {
        Self {
            algorithm: Self::SHA256.to_string(),
            hash: hash.into(),
        }
    }

    /// Digest of the given bytes, computed with sha256.
    pub fn of_bytes(bytes: impl AsRef<[u8]>) -> Self {
        use sha2::{Digest as _, Sha256};
        Self::from_hash(Sha256::digest(bytes.as_ref()).to_vec())
    }
}

impl FromStr for Digest {
    type Err = color_eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (algorithm, hex) = s
            .split_once(':')
            .ok_or_else(|| eyre!("invalid digest format, expected 'algorithm:hex': {s}"))?;
        ensure!(!algorithm.is_empty(), "algorithm cannot be empty: {s}");
        ensure!(!hex.is_empty(), "hex cannot be empty: {s}");
        Ok(Self {
            algorithm: algorithm.to_string(),
            hash: hex::decode(hex).map_err(|e| eyre!("invalid hex string: {e}"))?,
        })
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.as_hex())
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_string().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        FromStr::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Version identifier for a container image: a named tag or a digest.
#[derive(Debug, Clone, PartialEq, Eq, Display, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum Version {
    /// A named tag (e.g. "latest", "3.19")
    Tag(String),

    /// A digest (e.g. "sha256:123abc...")
    Digest(Digest),
}

impl Version {
    /// Returns the tag for "latest".
    pub fn latest() -> Self {
        Self::Tag(String::from("latest"))
    }

    /// Create a tagged instance.
    pub fn tag(tag: &str) -> Self {
        Self::Tag(tag.to_string())
    }

    /// Create a digest instance.
    pub fn digest(digest: Digest) -> Self {
        Self::Digest(digest)
    }
}

/// A container image reference provided by a user.
///
/// Parsing applies the Docker conventions: a bare `name` expands to
/// `docker.io/library/name`, and a missing version defaults to `latest`.
///
/// ```
/// # use std::str::FromStr;
/// let reference = skiff_lib::Reference::from_str("alpine:3.19").expect("parse");
/// assert_eq!(reference.to_string(), "docker.io/library/alpine:3.19");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Builder, Serialize)]
pub struct Reference {
    /// Registry host (e.g. "docker.io", "ghcr.io")
    #[builder(into)]
    pub host: String,

    /// Repository within the registry (e.g. "library/ubuntu")
    #[builder(into)]
    pub repository: String,

    /// Version identifier, either a tag or digest
    #[builder(into, default = Version::latest())]
    pub version: Version,
}

impl<S: reference_builder::State> ReferenceBuilder<S> {
    /// Set the reference to a tag version.
    pub fn tag(self, tag: &str) -> ReferenceBuilder<reference_builder::SetVersion<S>>
    where
        S::Version: reference_builder::IsUnset,
    {
        self.version(Version::tag(tag))
    }

    /// Set the reference to a digest version.
    pub fn digest(
        self,
        digest: impl Into<Digest>,
    ) -> ReferenceBuilder<reference_builder::SetVersion<S>>
    where
        S::Version: reference_builder::IsUnset,
    {
        self.version(Version::Digest(digest.into()))
    }
}

impl FromStr for Reference {
    type Err = color_eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Splits a trailing version off a repository path.
        // The `@digest` form wins over `:tag` since digests contain a colon.
        fn parse_version(path: &str) -> Result<(String, Version)> {
            if let Some((path, digest)) = path.split_once('@') {
                let digest = Digest::from_str(digest).context("parse digest")?;
                Ok((path.to_string(), Version::Digest(digest)))
            } else if let Some((head, tag)) = path.rsplit_once(':') {
                // A colon inside a host segment (`localhost:5000/img`) is not a tag.
                if tag.contains('/') {
                    Ok((path.to_string(), Version::latest()))
                } else {
                    Ok((head.to_string(), Version::Tag(tag.to_string())))
                }
            } else {
                Ok((path.to_string(), Version::latest()))
            }
        }

        let (path, version) = parse_version(s)?;
        let parts = path.split('/').collect::<Vec<_>>();
        let (host, repository) = match parts.as_slice() {
            // `docker pull ubuntu` means `docker.io/library/ubuntu`.
            [name] if !name.is_empty() => {
                let expanded = format!("{DEFAULT_NAMESPACE}/{name}");
                warn!("expanding '{name}' to '{DEFAULT_REGISTRY}/{expanded}'");
                (DEFAULT_REGISTRY.to_string(), expanded)
            }

            // Two segments are ambiguous: `library/ubuntu` vs `ghcr.io/img`.
            // A dot, colon, or `localhost` in the first segment marks it as a host.
            [first, name]
                if first.contains('.') || first.contains(':') || *first == "localhost" =>
            {
                (first.to_string(), name.to_string())
            }
            [namespace, name] => {
                warn!("expanding '{namespace}/{name}' to '{DEFAULT_REGISTRY}/{namespace}/{name}'");
                (DEFAULT_REGISTRY.to_string(), format!("{namespace}/{name}"))
            }

            [host, repository @ ..] => (host.to_string(), repository.join("/")),
            _ => bail!("empty reference"),
        };

        ensure!(!host.is_empty(), "host cannot be empty: {s}");
        ensure!(!repository.is_empty(), "repository cannot be empty: {s}");
        ensure!(
            !repository.split('/').any(str::is_empty),
            "repository cannot contain empty segments: {s}"
        );

        Ok(Reference {
            host,
            repository,
            version,
        })
    }
}

impl std::fmt::Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.host, self.repository)?;
        match &self.version {
            Version::Tag(tag) => write!(f, ":{tag}"),
            Version::Digest(digest) => write!(f, "@{digest}"),
        }
    }
}

/// CPU architectures the guest kernel can run.
///
/// Values correspond with GOARCH, as used by the OCI image spec's
/// platform definitions.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::AsRefStr,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Architecture {
    Amd64,
    Arm64,
}

impl Architecture {
    /// The architecture of the host this process runs on.
    pub fn host() -> Result<Self, crate::error::ConfigError> {
        match std::env::consts::ARCH {
            "x86_64" => Ok(Self::Amd64),
            "aarch64" => Ok(Self::Arm64),
            other => Err(crate::error::ConfigError::UnsupportedArchitecture(
                other.to_string(),
            )),
        }
    }
}

impl std::fmt::Display for Architecture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_ref())
    }
}

/// The user an image asks commands to run as.
///
/// Numeric forms populate `uid`/`gid`; anything else is carried verbatim for
/// the guest to resolve against its own `/etc/passwd`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSpec {
    /// The user string exactly as the image or Dockerfile gave it.
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub gid: Option<u32>,
}

impl UserSpec {
    /// Parse a `user[:group]` string, extracting numeric ids where present.
    pub fn parse(s: &str) -> Self {
        let (user, group) = s.split_once(':').unwrap_or((s, ""));
        Self {
            name: s.to_string(),
            uid: user.parse().ok(),
            gid: group.parse().ok(),
        }
    }
}

/// Runtime configuration for an image, assembled by the fetcher or a build.
///
/// This is the `config.json` written alongside the layer archives, and the
/// source of the guest launch parameters.
#[derive(Debug, Clone, Default, Builder, Serialize, Deserialize)]
pub struct ImageConfig {
    /// Layer digests in application order, base first.
    #[builder(into, default)]
    pub layers: Vec<Digest>,

    /// Environment variables as `KEY=value` pairs.
    #[builder(into, default)]
    #[serde(default)]
    pub env: Vec<String>,

    /// The entrypoint argv prefix, if any.
    #[builder(into, default)]
    #[serde(default)]
    pub entrypoint: Vec<String>,

    /// The default command argv.
    #[builder(into, default)]
    #[serde(default)]
    pub cmd: Vec<String>,

    /// The working directory commands start in.
    #[builder(into, default = String::from("/"))]
    #[serde(default)]
    pub workdir: String,

    /// The user commands run as.
    #[builder(default)]
    #[serde(default)]
    pub user: UserSpec,

    /// Image labels.
    #[builder(default)]
    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    /// The architecture the image was built for.
    #[serde(default)]
    pub architecture: Option<Architecture>,
}

impl ImageConfig {
    /// The argv the guest init payload should execute: entrypoint followed by
    /// cmd, with an explicit override replacing cmd entirely.
    pub fn command(
        &self,
        command_override: &[String],
    ) -> Result<Vec<String>, crate::error::ConfigError> {
        let tail: &[String] = if command_override.is_empty() {
            &self.cmd
        } else {
            command_override
        };
        let argv = self
            .entrypoint
            .iter()
            .chain(tail)
            .cloned()
            .collect::<Vec<_>>();
        if argv.is_empty() {
            return Err(crate::error::ConfigError::EmptyCommand);
        }
        Ok(argv)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn userspec_numeric() {
        let user = UserSpec::parse("1000:1000");
        assert_eq!(user.uid, Some(1000));
        assert_eq!(user.gid, Some(1000));
    }

    #[test]
    fn userspec_named_passes_through() {
        let user = UserSpec::parse("nobody");
        assert_eq!(user.name, "nobody");
        assert_eq!(user.uid, None);
        assert_eq!(user.gid, None);
    }

    #[test]
    fn command_override_replaces_cmd() {
        let config = ImageConfig::builder()
            .entrypoint(vec!["/bin/sh".to_string(), "-c".to_string()])
            .cmd(vec!["echo default".to_string()])
            .architecture(Architecture::Amd64)
            .build();

        let argv = config
            .command(&["echo override".to_string()])
            .expect("command");
        assert_eq!(argv, vec!["/bin/sh", "-c", "echo override"]);

        let argv = config.command(&[]).expect("command");
        assert_eq!(argv, vec!["/bin/sh", "-c", "echo default"]);
    }

    #[test]
    fn empty_command_is_rejected() {
        let config = ImageConfig::builder().build();
        assert!(matches!(
            config.command(&[]),
            Err(crate::error::ConfigError::EmptyCommand)
        ));
    }
}
