use crate::packager::ArtifactKind;
use crate::CoreError;
use elbe_fs::ScopedFs;
use elbe_runtime::{HostOps, ToolCommand};
use elbe_schema::DiskImageSection;
use std::path::Path;
use tracing::{debug, warn};

/// Produces partitioned disk images from a finished target.
pub trait DiskImageBuilder {
    /// Build images into `builddir` and return their file names.
    fn build_images(
        &self,
        target: &ScopedFs,
        builddir: &Path,
        section: &DiskImageSection,
    ) -> Result<Vec<String>, CoreError>;
}

/// Runs the configured builder command.
///
/// The command is invoked as
/// `<builder...> --target <dir> --output <builddir> --grub-version <n> [--grub-fw-type <t>]`
/// and must print one produced image file name per line on stdout.
pub struct CommandImageBuilder<'h> {
    host: &'h dyn HostOps,
}

impl<'h> CommandImageBuilder<'h> {
    pub fn new(host: &'h dyn HostOps) -> Self {
        Self { host }
    }

    pub fn command(
        target: &ScopedFs,
        builddir: &Path,
        section: &DiskImageSection,
    ) -> Option<ToolCommand> {
        let (program, leading) = section.builder.split_first()?;
        let mut cmd = ToolCommand::new(program.as_str())
            .args(leading.iter().map(String::as_str))
            .arg("--target")
            .arg(target.root().to_string_lossy())
            .arg("--output")
            .arg(builddir.to_string_lossy())
            .arg("--grub-version")
            .arg(section.grub_version.to_string());
        if let Some(fw) = &section.grub_fw_type {
            cmd = cmd.arg("--grub-fw-type").arg(fw.as_str());
        }
        Some(cmd)
    }
}

impl DiskImageBuilder for CommandImageBuilder<'_> {
    fn build_images(
        &self,
        target: &ScopedFs,
        builddir: &Path,
        section: &DiskImageSection,
    ) -> Result<Vec<String>, CoreError> {
        let fail = |reason: String| CoreError::Packaging {
            kind: ArtifactKind::DiskImage,
            name: section.builder.join(" "),
            reason,
        };
        let cmd = Self::command(target, builddir, section)
            .ok_or_else(|| fail("no image builder configured".to_owned()))?;
        let output = self
            .host
            .run_checked(&cmd)
            .map_err(|e| fail(e.to_string()))?;

        let mut images = Vec::new();
        for line in output.stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if line.contains('/') || line == "." || line == ".." {
                warn!("image builder reported '{line}', which is not a plain file name; ignoring");
                continue;
            }
            debug!("image builder produced {line}");
            images.push(line.to_owned());
        }
        Ok(images)
    }
}
