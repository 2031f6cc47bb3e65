//! Build descriptor, fstab entries, and package manifest types for the rootfs builder.
//!
//! This crate defines the schema layer: TOML build descriptor parsing (`ProjectConfig`),
//! validated once before any filesystem is touched, the `FstabEntry` rendering used for
//! `etc/fstab`, the `PackageManifest` and `SelectionMode` types consumed by file
//! selection, the `PackageCache` capability trait, and the `PackerKind` names used to
//! post-process produced artifacts.

pub mod fstab;
pub mod package;
pub mod packer;
pub mod project;

pub use fstab::{render_fstab, FstabEntry};
pub use package::{CacheError, PackageCache, PackageManifest, SelectionMode};
pub use packer::PackerKind;
pub use project::{
    parse_project_file, parse_project_str, ArchiveSection, DiskImageSection, LicenseSection,
    PackageSection, ProjectConfig, ProjectSection, SandboxSection, SchemaError, TarSection,
    TargetSection,
};
