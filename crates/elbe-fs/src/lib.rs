//! Filesystem layer for the rootfs builder.
//!
//! `ScopedFs` is a capability-scoped view over one directory tree: every operation
//! resolves its relative path through [`ScopedFs::resolve`], which refuses to leave the
//! root. `WalkFiles` is the lazy depth-first walker over such a view, `layout` names the
//! well-known paths inside a target tree, and `dpkg` reads the package database of an
//! installed tree (file manifests, installed packages, dependency closure). `mounts` reads
//! the kernel mount table.

pub mod dpkg;
pub mod layout;
pub mod mounts;
pub mod scoped;
pub mod walk;

pub use dpkg::{DpkgCache, DpkgDatabase};
pub use scoped::ScopedFs;
pub use walk::WalkFiles;

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("filesystem I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("path '{path}' escapes filesystem root {}", root.display())]
    PathEscape { root: PathBuf, path: String },
    #[error("refusing to clean the host root filesystem")]
    CleanHostRoot,
    #[error("refusing to clean {}: {} mounts still active below it", root.display(), mounts.len())]
    ActiveMounts { root: PathBuf, mounts: Vec<PathBuf> },
    #[error("walk error: {0}")]
    Walk(#[from] walkdir::Error),
}
