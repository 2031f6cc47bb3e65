use crate::fstab::FstabEntry;
use crate::package::SelectionMode;
use crate::packer::PackerKind;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("failed to read build descriptor: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse build descriptor: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("failed to serialize build descriptor: {0}")]
    SerializeToml(#[from] toml::ser::Error),
    #[error("{0} must not be empty")]
    EmptyField(&'static str),
    #[error("target.tighten and target.diet are mutually exclusive")]
    ConflictingModes,
    #[error("target.packages must not be empty when tighten, diet or setsel is enabled")]
    EmptyPackageList,
    #[error("invalid {format} artifact name '{name}': must be a plain file name")]
    InvalidArtifactName { format: &'static str, name: String },
    #[error("fstab mountpoint '{0}' must be absolute")]
    RelativeMountpoint(String),
}

/// Build descriptor, resolved once at build start.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ProjectConfig {
    pub project: ProjectSection,
    #[serde(default)]
    pub target: TargetSection,
    #[serde(default)]
    pub sandbox: SandboxSection,
    #[serde(default)]
    pub licenses: LicenseSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ProjectSection {
    pub name: String,
    pub version: String,
    /// Debian architecture of the target, e.g. `armhf`.
    pub arch: String,
    /// User-mode emulator injected into the target when cross-building.
    #[serde(default)]
    pub interpreter: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TargetSection {
    #[serde(default)]
    pub tighten: bool,
    #[serde(default)]
    pub diet: bool,
    #[serde(default)]
    pub setsel: bool,
    #[serde(default)]
    pub packages: Vec<String>,
    #[serde(default)]
    pub fstab: Vec<FstabEntry>,
    #[serde(default)]
    pub package: PackageSection,
    #[serde(default)]
    pub images: Option<DiskImageSection>,
}

/// Archive formats requested for the finished target.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PackageSection {
    #[serde(default)]
    pub tar: Option<TarSection>,
    #[serde(default)]
    pub cpio: Option<ArchiveSection>,
    #[serde(default)]
    pub squashfs: Option<ArchiveSection>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TarSection {
    pub name: String,
    /// Extra arguments passed to tar before the source directory.
    #[serde(default)]
    pub options: Option<String>,
    #[serde(default)]
    pub packer: PackerKind,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ArchiveSection {
    pub name: String,
    #[serde(default)]
    pub packer: PackerKind,
}

/// External partitioned disk image builder.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DiskImageSection {
    /// Program and leading arguments; the builder prints one image file name per line.
    pub builder: Vec<String>,
    #[serde(default = "default_grub_version")]
    pub grub_version: u32,
    #[serde(default)]
    pub grub_fw_type: Option<String>,
    #[serde(default)]
    pub packer: PackerKind,
}

fn default_grub_version() -> u32 {
    202
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SandboxSection {
    /// Searched for the interpreter before `/usr/bin`.
    #[serde(default = "default_interpreter_dir")]
    pub interpreter_dir: PathBuf,
    #[serde(default = "default_resolv_conf")]
    pub resolv_conf: PathBuf,
    #[serde(default = "default_apt_conf")]
    pub apt_conf: PathBuf,
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            interpreter_dir: default_interpreter_dir(),
            resolv_conf: default_resolv_conf(),
            apt_conf: default_apt_conf(),
        }
    }
}

fn default_interpreter_dir() -> PathBuf {
    PathBuf::from("/usr/share/elbe/qemu-elbe")
}

fn default_resolv_conf() -> PathBuf {
    PathBuf::from("/etc/resolv.conf")
}

fn default_apt_conf() -> PathBuf {
    PathBuf::from("/etc/apt/apt.conf")
}

/// Where to write license reports, relative to the build directory.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct LicenseSection {
    #[serde(default)]
    pub text: Option<PathBuf>,
    #[serde(default)]
    pub structured: Option<PathBuf>,
}

impl ProjectConfig {
    pub fn selection_mode(&self) -> SelectionMode {
        if self.target.diet {
            SelectionMode::Diet
        } else if self.target.tighten {
            SelectionMode::Tighten
        } else {
            SelectionMode::Full
        }
    }

    pub fn validate(&self) -> Result<(), SchemaError> {
        if self.project.name.trim().is_empty() {
            return Err(SchemaError::EmptyField("project.name"));
        }
        if self.project.version.trim().is_empty() {
            return Err(SchemaError::EmptyField("project.version"));
        }
        if self.project.arch.trim().is_empty() {
            return Err(SchemaError::EmptyField("project.arch"));
        }
        if self.target.tighten && self.target.diet {
            return Err(SchemaError::ConflictingModes);
        }
        let needs_packages = self.target.tighten || self.target.diet || self.target.setsel;
        if needs_packages && self.target.packages.is_empty() {
            return Err(SchemaError::EmptyPackageList);
        }
        for entry in &self.target.fstab {
            if !entry.mountpoint.starts_with('/') {
                return Err(SchemaError::RelativeMountpoint(entry.mountpoint.clone()));
            }
        }

        let pkg = &self.target.package;
        if let Some(tar) = &pkg.tar {
            validate_artifact_name("tar", &tar.name)?;
        }
        if let Some(cpio) = &pkg.cpio {
            validate_artifact_name("cpio", &cpio.name)?;
        }
        if let Some(sfs) = &pkg.squashfs {
            validate_artifact_name("squashfs", &sfs.name)?;
        }
        if let Some(images) = &self.target.images {
            if images.builder.is_empty() || images.builder[0].trim().is_empty() {
                return Err(SchemaError::EmptyField("target.images.builder"));
            }
        }
        Ok(())
    }

    /// Serialized copy stored inside the target for later inspection.
    pub fn to_toml(&self) -> Result<String, SchemaError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

fn validate_artifact_name(format: &'static str, name: &str) -> Result<(), SchemaError> {
    let plain = !name.is_empty() && name != "." && name != ".." && !name.contains('/');
    if plain {
        Ok(())
    } else {
        Err(SchemaError::InvalidArtifactName {
            format,
            name: name.to_owned(),
        })
    }
}

pub fn parse_project_str(input: &str) -> Result<ProjectConfig, SchemaError> {
    let config: ProjectConfig = toml::from_str(input)?;
    config.validate()?;
    Ok(config)
}

pub fn parse_project_file(path: impl AsRef<Path>) -> Result<ProjectConfig, SchemaError> {
    let content = fs::read_to_string(path)?;
    parse_project_str(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[project]
name = "demo"
version = "1.0"
arch = "armhf"
"#;

    #[test]
    fn parses_full_descriptor() {
        let input = r#"
[project]
name = "gateway"
version = "2.3"
arch = "arm64"
interpreter = "qemu-aarch64-static"

[target]
diet = true
setsel = true
packages = ["busybox", "dropbear"]

[[target.fstab]]
source = "LABEL=rfs"
mountpoint = "/"
fs_type = "ext4"
pass = 1

[[target.fstab]]
source = "LABEL=boot"
mountpoint = "/boot"
fs_type = "vfat"
no_fstab = true

[target.package.tar]
name = "rootfs.tar.gz"
options = "--exclude=./var/cache/apt"

[target.package.cpio]
name = "rootfs.cpio"
packer = "gzip"

[target.package.squashfs]
name = "rootfs.squashfs"

[target.images]
builder = ["elbe-hdimg", "--quiet"]
grub_fw_type = "efi"
packer = "targz"

[sandbox]
interpreter_dir = "/opt/qemu"

[licenses]
text = "licence.txt"
structured = "licence.json"
"#;
        let config = parse_project_str(input).expect("should parse");
        assert_eq!(config.project.interpreter.as_deref(), Some("qemu-aarch64-static"));
        assert_eq!(config.selection_mode(), SelectionMode::Diet);
        assert_eq!(config.target.fstab.len(), 2);
        assert_eq!(config.target.fstab[0].options, "defaults");
        assert!(config.target.fstab[1].no_fstab);
        assert_eq!(
            config.target.package.cpio.as_ref().unwrap().packer,
            PackerKind::Gzip
        );
        let images = config.target.images.as_ref().unwrap();
        assert_eq!(images.grub_version, 202);
        assert_eq!(images.packer, PackerKind::TarGz);
        assert_eq!(config.sandbox.interpreter_dir, PathBuf::from("/opt/qemu"));
        assert_eq!(config.sandbox.resolv_conf, PathBuf::from("/etc/resolv.conf"));
    }

    #[test]
    fn minimal_descriptor_is_full_mode() {
        let config = parse_project_str(MINIMAL).unwrap();
        assert_eq!(config.selection_mode(), SelectionMode::Full);
        assert!(config.target.package.tar.is_none());
        assert!(config.target.images.is_none());
    }

    #[test]
    fn rejects_tighten_and_diet_together() {
        let input = format!("{MINIMAL}\n[target]\ntighten = true\ndiet = true\npackages = [\"a\"]\n");
        assert!(matches!(
            parse_project_str(&input),
            Err(SchemaError::ConflictingModes)
        ));
    }

    #[test]
    fn rejects_tighten_without_packages() {
        let input = format!("{MINIMAL}\n[target]\ntighten = true\n");
        assert!(matches!(
            parse_project_str(&input),
            Err(SchemaError::EmptyPackageList)
        ));
    }

    #[test]
    fn rejects_artifact_name_with_path() {
        let input = format!("{MINIMAL}\n[target.package.tar]\nname = \"../escape.tgz\"\n");
        assert!(matches!(
            parse_project_str(&input),
            Err(SchemaError::InvalidArtifactName { format: "tar", .. })
        ));
    }

    #[test]
    fn rejects_relative_mountpoint() {
        let input = format!(
            "{MINIMAL}\n[[target.fstab]]\nsource = \"LABEL=x\"\nmountpoint = \"data\"\nfs_type = \"ext4\"\n"
        );
        assert!(matches!(
            parse_project_str(&input),
            Err(SchemaError::RelativeMountpoint(_))
        ));
    }

    #[test]
    fn rejects_unknown_fields() {
        let input = format!("{MINIMAL}\n[target]\nfrobnicate = true\n");
        assert!(parse_project_str(&input).is_err());
    }

    #[test]
    fn rejects_empty_name() {
        let input = "[project]\nname = \"\"\nversion = \"1\"\narch = \"amd64\"\n";
        assert!(matches!(
            parse_project_str(input),
            Err(SchemaError::EmptyField("project.name"))
        ));
    }

    #[test]
    fn toml_copy_parses_back() {
        let config = parse_project_str(MINIMAL).unwrap();
        let text = config.to_toml().unwrap();
        let again = parse_project_str(&text).unwrap();
        assert_eq!(config, again);
    }

    #[test]
    fn parses_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("project.toml");
        std::fs::write(&path, MINIMAL).unwrap();
        let config = parse_project_file(&path).unwrap();
        assert_eq!(config.project.name, "demo");
    }
}
