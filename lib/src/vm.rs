//! Messages exchanged with the init payload inside the guest.
//!
//! The hypervisor integration ships a [`LaunchSpec`] over its message channel
//! once the VM is up, and reads back an [`ExitStatus`] when the payload's
//! command finishes. Both sides serialize with serde so the transport can
//! pick its own framing.

use serde::{Deserialize, Serialize};

use crate::{error::ConfigError, Architecture, ImageConfig};

/// Cross-architecture emulation requested for the guest command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Emulation {
    /// Architecture the image was built for.
    pub target: Architecture,

    /// Path of the userspace emulator binary inside the guest.
    pub interpreter: String,
}

/// Everything the init payload needs to start the image's command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchSpec {
    /// The command argv; never empty.
    pub argv: Vec<String>,

    /// Environment as `KEY=value` pairs.
    pub env: Vec<String>,

    /// Directory the command starts in.
    pub workdir: String,

    /// Numeric uid when known; the payload resolves [`user`](Self::user)
    /// against the guest's /etc/passwd otherwise.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub gid: Option<u32>,

    /// The user string verbatim from the image or Dockerfile.
    pub user: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub emulation: Option<Emulation>,
}

impl LaunchSpec {
    /// Assemble the spec from an image config and an optional command
    /// override (replacing `cmd`, keeping `entrypoint`).
    pub fn from_config(
        config: &ImageConfig,
        command_override: &[String],
        emulation: Option<Emulation>,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            argv: config.command(command_override)?,
            env: config.env.clone(),
            workdir: config.workdir.clone(),
            uid: config.user.uid,
            gid: config.user.gid,
            user: config.user.name.clone(),
            emulation,
        })
    }
}

/// Why the payload stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// The command exited on its own.
    Exited,
    /// The command died to a signal; the exit code carries 128+signal.
    Signaled,
    /// The payload could not start the command at all.
    StartFailure,
}

/// The payload's report when the guest command finishes.
///
/// The exit code propagates verbatim to the invoking process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitStatus {
    pub code: i32,
    pub reason: TerminationReason,
}
