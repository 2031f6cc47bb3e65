//! Build orchestration for the rootfs builder.
//!
//! This crate ties the schema, filesystem, and runtime layers together: `FileSelector`
//! copies the selected part of an installed source tree into a fresh target,
//! `TargetAssembler` finalizes package selections inside the chroot sandbox and writes
//! target metadata (fstab, version files, license reports), and `ImagePackager` turns the
//! finished tree into archives and disk images. `Engine` runs those phases in order under
//! an exclusive target lock, honoring interrupts only between phases.

pub mod concurrency;
pub mod engine;
pub mod extract;
pub mod hdimg;
pub mod licenses;
pub mod packager;
pub mod packers;
pub mod selections;
pub mod target;

pub use concurrency::{install_signal_handler, interrupt_flag, TargetLock};
pub use engine::{BuildOptions, BuildResult, Engine};
pub use extract::{expand_closure, manifest_paths, ExtractReport, FileSelector};
pub use hdimg::{CommandImageBuilder, DiskImageBuilder};
pub use licenses::{collect_licenses, LicenseEntry, LicenseReport};
pub use packager::{Artifact, ArtifactKind, ImagePackager, PackagingFailure, PackagingReport};
pub use packers::pack_file;
pub use target::TargetAssembler;

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("build descriptor error: {0}")]
    Schema(#[from] elbe_schema::SchemaError),
    #[error("package cache error: {0}")]
    Cache(#[from] elbe_schema::CacheError),
    #[error("filesystem error: {0}")]
    Fs(#[from] elbe_fs::FsError),
    #[error("sandbox error: {0}")]
    Runtime(#[from] elbe_runtime::RuntimeError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("{kind} packaging of '{name}' failed: {reason}")]
    Packaging {
        kind: ArtifactKind,
        name: String,
        reason: String,
    },
    #[error("diet selection needs the package cache of the source tree")]
    NoPackageCache,
    #[error("build interrupted")]
    Interrupted,
    #[error("target {} is locked by another build", .0.display())]
    Lock(PathBuf),
}

impl CoreError {
    /// Whether the error comes from the sandbox lifecycle (mounts, chroot, state).
    pub fn is_sandbox_error(&self) -> bool {
        use elbe_runtime::RuntimeError as R;
        matches!(
            self,
            Self::Runtime(
                R::Mount { .. } | R::Unmount { .. } | R::SandboxState { .. } | R::Chroot { .. }
            ) | Self::Fs(elbe_fs::FsError::ActiveMounts { .. })
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use elbe_runtime::{RuntimeError, SandboxState};

    #[test]
    fn sandbox_errors_are_classified() {
        let e = CoreError::from(RuntimeError::SandboxState {
            expected: SandboxState::Mounted,
            actual: SandboxState::InChroot,
        });
        assert!(e.is_sandbox_error());
        assert!(!CoreError::Interrupted.is_sandbox_error());
        let leftover = CoreError::from(elbe_fs::FsError::ActiveMounts {
            root: PathBuf::from("/srv/target"),
            mounts: vec![PathBuf::from("/srv/target/dev")],
        });
        assert!(leftover.is_sandbox_error());
    }

    #[test]
    fn packaging_error_names_kind_and_file() {
        let e = CoreError::Packaging {
            kind: ArtifactKind::Squashfs,
            name: "rfs.squashfs".to_owned(),
            reason: "mksquashfs exited with status 1".to_owned(),
        };
        let msg = e.to_string();
        assert!(msg.starts_with("squashfs packaging of 'rfs.squashfs'"));
    }
}
