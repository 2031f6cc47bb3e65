use crate::packager::ArtifactKind;
use crate::CoreError;
use elbe_runtime::{HostOps, ToolCommand};
use elbe_schema::PackerKind;
use std::path::Path;
use tracing::{debug, warn};

fn packer_command(kind: PackerKind, builddir: &Path, name: &str) -> Option<ToolCommand> {
    let raw = builddir.join(name).to_string_lossy().into_owned();
    let archive = format!("{raw}{}", kind.suffix());
    let tar = |compress: &str| {
        ToolCommand::new("tar")
            .args(["--create", "--verbose", "--sparse", compress])
            .args(["--file", archive.as_str()])
            .arg("--directory")
            .arg(builddir.to_string_lossy())
            .arg(name)
    };
    match kind {
        PackerKind::None => None,
        PackerKind::Gzip => Some(ToolCommand::new("gzip").arg("-f").arg(raw)),
        PackerKind::Zstd => Some(ToolCommand::new("zstd").arg("-T0").arg(raw)),
        PackerKind::Tar | PackerKind::TarXz | PackerKind::TarGz => Some(tar("--auto-compress")),
        PackerKind::TarZstd => Some(tar("--use-compress-program=zstd -T0")),
    }
}

/// Post-process `<builddir>/<name>` and return the packed name.
///
/// Tar packers remove the raw file once the archive exists. On failure the raw file
/// must be considered gone.
pub fn pack_file(
    kind: PackerKind,
    builddir: &Path,
    name: &str,
    artifact: ArtifactKind,
    host: &dyn HostOps,
) -> Result<String, CoreError> {
    let Some(cmd) = packer_command(kind, builddir, name) else {
        return Ok(name.to_owned());
    };
    let fail = |reason: String| CoreError::Packaging {
        kind: artifact,
        name: name.to_owned(),
        reason,
    };

    host.run_checked(&cmd).map_err(|e| fail(e.to_string()))?;
    if matches!(
        kind,
        PackerKind::Tar | PackerKind::TarXz | PackerKind::TarGz | PackerKind::TarZstd
    ) {
        match std::fs::remove_file(builddir.join(name)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!("packed {name} but could not remove the raw file: {e}");
            }
        }
    }
    let packed = format!("{name}{}", kind.suffix());
    debug!("packed {name} with {kind} into {packed}");
    Ok(packed)
}
