//! Execution layer for the rootfs builder.
//!
//! Everything that touches host state lives behind the `HostOps` trait: running external
//! tools, mounting pseudo filesystems, and changing the process root. `HostSystem` is the
//! real implementation, `MockHost` the recording test double. `ChrootSandbox` drives the
//! mount/chroot state machine of one target directory on top of either.

pub mod exec;
pub mod host;
pub mod mock;
pub mod prereq;
pub mod sandbox;

pub use exec::{shell_quote, ToolCommand, ToolOutput};
pub use host::{HostOps, HostSystem, MountSpec, SavedRoot};
pub use mock::MockHost;
pub use prereq::{check_build_prereqs, format_missing, MissingPrereq};
pub use sandbox::{
    release_stale_mounts, sandboxes_active, ActiveSandbox, ChrootSandbox, SandboxConfig,
    SandboxState, UNMOUNT_ORDER,
};

use elbe_fs::FsError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Fs(#[from] FsError),
    #[error("failed to mount {}: {reason}", target.display())]
    Mount { target: PathBuf, reason: String },
    #[error("failed to unmount {}: {reason}", target.display())]
    Unmount { target: PathBuf, reason: String },
    #[error("sandbox is {actual}, operation requires {expected}")]
    SandboxState {
        expected: SandboxState,
        actual: SandboxState,
    },
    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("'{command}' exited with {}: {stderr}", status.map_or_else(|| "signal".to_owned(), |c| format!("status {c}")))]
    ExternalTool {
        command: String,
        status: Option<i32>,
        stderr: String,
    },
    #[error("failed to change root to {}: {source}", root.display())]
    Chroot {
        root: PathBuf,
        source: std::io::Error,
    },
    #[error("interpreter '{0}' not found on the host")]
    InterpreterNotFound(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn external_tool_error_names_command_and_status() {
        let e = RuntimeError::ExternalTool {
            command: "mksquashfs /t /o/rfs.squashfs".to_owned(),
            status: Some(1),
            stderr: "no space left".to_owned(),
        };
        let msg = e.to_string();
        assert!(msg.contains("mksquashfs"));
        assert!(msg.contains("status 1"));
        assert!(msg.contains("no space left"));
    }

    #[test]
    fn sandbox_state_error_names_both_states() {
        let e = RuntimeError::SandboxState {
            expected: SandboxState::Mounted,
            actual: SandboxState::InChroot,
        };
        assert_eq!(
            e.to_string(),
            "sandbox is in-chroot, operation requires mounted"
        );
    }
}
