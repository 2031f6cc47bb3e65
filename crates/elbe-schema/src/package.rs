use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("package database I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("package not installed: {0}")]
    NotInstalled(String),
    #[error("malformed package database entry near line {line}: {reason}")]
    Malformed { line: usize, reason: String },
}

/// Installed package as recorded by the package database. Read-only to the builder.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct PackageManifest {
    pub name: String,
    pub version: String,
    pub architecture: String,
    /// Paths owned by the package, relative to the filesystem root.
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub conffiles: Vec<String>,
}

impl PackageManifest {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            ..Self::default()
        }
    }
}

/// How much of the installed source tree ends up in the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionMode {
    /// Copy the source tree verbatim.
    Full,
    /// Only files owned by the listed packages.
    Tighten,
    /// Listed packages plus their hard-dependency closure.
    Diet,
}

impl std::fmt::Display for SelectionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full => write!(f, "full"),
            Self::Tighten => write!(f, "tighten"),
            Self::Diet => write!(f, "diet"),
        }
    }
}

/// Read access to the package database of an installed tree.
///
/// The builder never resolves dependencies itself: `dependencies_of` must return the
/// complete transitive set of hard dependencies of `name`, excluding `name`.
pub trait PackageCache {
    fn installed_packages(&self) -> Result<Vec<PackageManifest>, CacheError>;

    fn dependencies_of(&self, name: &str) -> Result<Vec<PackageManifest>, CacheError>;
}
