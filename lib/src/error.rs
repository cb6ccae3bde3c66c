//! Error types raised by the library.
//!
//! Each subsystem has its own enum so callers can match on the failure class;
//! the CLI wraps these in `color-eyre` reports at the boundary.

use std::path::PathBuf;

/// Errors raised while reading or writing layer archives.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    /// The index file contains a record that cannot be decoded.
    #[error("archive corrupt: {0}")]
    Corrupt(String),

    /// An entry's content window extends past the end of the contents file.
    #[error("archive corrupt: content window {offset}+{length} exceeds contents size {size}")]
    WindowOutOfRange { offset: u64, length: u64, size: u64 },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors raised while talking to an OCI registry.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The registry answered with a status we don't handle.
    #[error("registry returned {status} for {url}")]
    Http { status: u16, url: String },

    /// A manifest index contained no manifest for the requested architecture.
    #[error("no manifest for architecture {architecture} in {reference}")]
    NoMatchingManifest {
        reference: String,
        architecture: String,
    },

    /// The `WWW-Authenticate` challenge could not be satisfied.
    #[error("token fetch failed: {0}")]
    TokenFetch(String),

    /// Downloaded bytes did not hash to the expected digest.
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    /// The manifest body could not be decoded.
    #[error("malformed manifest: {0}")]
    MalformedManifest(String),

    #[error(transparent)]
    Transport(#[from] reqwest::Error),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors raised by the layered filesystem.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum FsError {
    #[error("no such file or directory: {0}")]
    NotFound(String),

    /// Symlink resolution exceeded the traversal bound.
    #[error("too many levels of symbolic links: {0}")]
    Loop(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("is a directory: {0}")]
    IsADirectory(String),

    /// The guest presented a handle the backend never allocated or already
    /// released.
    #[error("stale handle: {0}")]
    StaleHandle(u64),

    /// Path escapes the filesystem root or contains an invalid component.
    #[error("invalid path: {0}")]
    InvalidPath(String),
}

/// Errors raised while parsing or planning a Dockerfile build.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum DockerfileError {
    #[error("dockerfile exceeds {limit} bytes")]
    TooLarge { limit: usize },

    #[error("line {line} exceeds {limit} bytes")]
    LineTooLong { line: usize, limit: usize },

    #[error("dockerfile exceeds {limit} instructions")]
    TooManyInstructions { limit: usize },

    #[error("more than {limit} variables defined")]
    TooManyVariables { limit: usize },

    /// Variable expansion recursed past the depth cap.
    #[error("variable expansion too deep expanding {name:?}")]
    ExpansionTooDeep { name: String },

    #[error("line {line}: unknown instruction {instruction:?}")]
    UnknownInstruction { line: usize, instruction: String },

    #[error("line {line}: {instruction} is not supported: {detail}")]
    Unsupported {
        line: usize,
        instruction: String,
        detail: String,
    },

    #[error("line {line}: malformed {instruction}: {detail}")]
    Malformed {
        line: usize,
        instruction: String,
        detail: String,
    },

    /// A COPY/ADD source escapes the build context root.
    #[error("line {line}: path {path:?} escapes the build context")]
    PathEscape { line: usize, path: String },

    #[error("line {line}: heredoc delimiter {delimiter:?} never closed")]
    UnterminatedHeredoc { line: usize, delimiter: String },

    #[error("missing FROM instruction")]
    MissingFrom,
}

/// Errors raised by the network stack's socket-style APIs.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum NetError {
    /// The endpoint, listener or stack was closed.
    #[error("connection closed")]
    Closed,

    /// A read or write deadline expired.
    #[error("operation timed out")]
    Timeout,

    /// No listener exists on the destination port.
    #[error("connection refused: no listener on port {0}")]
    Unreachable(u16),

    /// Another endpoint already owns the local port.
    #[error("port {0} already bound")]
    PortInUse(u16),

    /// The peer reset the connection.
    #[error("connection reset by peer")]
    Reset,

    #[error("malformed packet: {0}")]
    Malformed(&'static str),
}

impl NetError {
    /// Distinguishes deadline expiry from EOF and other failures.
    pub fn is_timeout(&self) -> bool {
        matches!(self, NetError::Timeout)
    }
}

/// Errors raised while assembling a launch configuration.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("unsupported architecture: {0}")]
    UnsupportedArchitecture(String),

    #[error("image specifies no command and none was given")]
    EmptyCommand,

    #[error("invalid image reference: {0}")]
    InvalidReference(String),

    #[error("image config missing from {0}")]
    MissingConfig(PathBuf),
}
