use crate::hdimg::{CommandImageBuilder, DiskImageBuilder};
use crate::packers::pack_file;
use crate::CoreError;
use elbe_fs::ScopedFs;
use elbe_runtime::{shell_quote, HostOps, ToolCommand};
use elbe_schema::{PackerKind, TargetSection};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    DiskImage,
    Tar,
    Cpio,
    Squashfs,
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DiskImage => f.write_str("disk image"),
            Self::Tar => f.write_str("tar"),
            Self::Cpio => f.write_str("cpio"),
            Self::Squashfs => f.write_str("squashfs"),
        }
    }
}

/// A produced file, relative to the build directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Artifact {
    pub name: String,
    pub kind: ArtifactKind,
    pub packer: PackerKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackagingFailure {
    pub kind: ArtifactKind,
    pub name: String,
    pub reason: String,
}

/// Outcome of every packaging attempt. Failed attempts never appear in `artifacts`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PackagingReport {
    pub artifacts: Vec<Artifact>,
    pub failures: Vec<PackagingFailure>,
}

impl PackagingReport {
    pub fn names(&self) -> Vec<&str> {
        self.artifacts.iter().map(|a| a.name.as_str()).collect()
    }

    fn record(
        &mut self,
        kind: ArtifactKind,
        name: &str,
        packer: PackerKind,
        result: Result<(), CoreError>,
    ) {
        match result {
            Ok(()) => self.artifacts.push(Artifact {
                name: name.to_owned(),
                kind,
                packer,
            }),
            Err(e) => self.fail(kind, name, &e),
        }
    }

    fn fail(&mut self, kind: ArtifactKind, name: &str, e: &CoreError) {
        error!("{kind} packaging of {name} failed: {e}");
        let reason = match e {
            CoreError::Packaging { reason, .. } => reason.clone(),
            other => other.to_string(),
        };
        self.failures.push(PackagingFailure {
            kind,
            name: name.to_owned(),
            reason,
        });
    }
}

/// Turns a finished target into its output artifacts.
///
/// Every format is attempted independently; a failure is recorded in the report and
/// never stops the remaining formats.
pub struct ImagePackager<'a> {
    target: &'a ScopedFs,
    builddir: PathBuf,
    config: &'a TargetSection,
    host: &'a dyn HostOps,
    image_builder: Box<dyn DiskImageBuilder + 'a>,
}

impl<'a> ImagePackager<'a> {
    pub fn new(
        target: &'a ScopedFs,
        builddir: impl Into<PathBuf>,
        config: &'a TargetSection,
        host: &'a dyn HostOps,
    ) -> Self {
        Self {
            target,
            builddir: builddir.into(),
            config,
            host,
            image_builder: Box::new(CommandImageBuilder::new(host)),
        }
    }

    #[must_use]
    pub fn with_image_builder(mut self, builder: Box<dyn DiskImageBuilder + 'a>) -> Self {
        self.image_builder = builder;
        self
    }

    fn dest(&self, name: &str) -> String {
        self.builddir.join(name).to_string_lossy().into_owned()
    }

    /// Disk images first, then tar, cpio and squashfs, each as configured.
    pub fn part_target(&self, report: &mut PackagingReport) {
        if let Some(section) = &self.config.images {
            match self
                .image_builder
                .build_images(self.target, &self.builddir, section)
            {
                Ok(images) => {
                    for name in images {
                        report.record(ArtifactKind::DiskImage, &name, section.packer, Ok(()));
                    }
                }
                Err(e) => report.fail(ArtifactKind::DiskImage, &section.builder.join(" "), &e),
            }
        }

        let pkg = &self.config.package;
        if let Some(tar) = &pkg.tar {
            let result = self.make_tar(&tar.name, tar.options.as_deref());
            report.record(ArtifactKind::Tar, &tar.name, tar.packer, result);
        }
        if let Some(cpio) = &pkg.cpio {
            let result = self.make_cpio(&cpio.name);
            report.record(ArtifactKind::Cpio, &cpio.name, cpio.packer, result);
        }
        if let Some(sfs) = &pkg.squashfs {
            let result = self.make_squashfs(&sfs.name);
            report.record(ArtifactKind::Squashfs, &sfs.name, sfs.packer, result);
        }
    }

    fn attempt(&self, kind: ArtifactKind, name: &str, cmd: &ToolCommand) -> Result<(), CoreError> {
        info!("creating {kind} {name}");
        self.host
            .run_checked(cmd)
            .map(drop)
            .map_err(|e| CoreError::Packaging {
                kind,
                name: name.to_owned(),
                reason: e.to_string(),
            })
    }

    /// `tar cfz <dest>/<name> -C <target> <options> .`
    fn make_tar(&self, name: &str, options: Option<&str>) -> Result<(), CoreError> {
        let cmd = ToolCommand::new("tar")
            .arg("cfz")
            .arg(self.dest(name))
            .arg("-C")
            .arg(self.target.root().to_string_lossy())
            .args(options.unwrap_or_default().split_whitespace())
            .arg(".");
        self.attempt(ArtifactKind::Tar, name, &cmd)
    }

    /// `find . -print | cpio -ov -H newc > <dest>/<name>`, run inside the target.
    fn make_cpio(&self, name: &str) -> Result<(), CoreError> {
        let script = format!(
            "find . -print | cpio -ov -H newc > {}",
            shell_quote(&self.dest(name))
        );
        let cmd = ToolCommand::shell(script).current_dir(self.target.root());
        self.attempt(ArtifactKind::Cpio, name, &cmd)
    }

    /// `mksquashfs <target> <dest>/<name> -noappend -no-progress`
    fn make_squashfs(&self, name: &str) -> Result<(), CoreError> {
        let cmd = ToolCommand::new("mksquashfs")
            .arg(self.target.root().to_string_lossy())
            .arg(self.dest(name))
            .args(["-noappend", "-no-progress"]);
        self.attempt(ArtifactKind::Squashfs, name, &cmd)
    }

    /// Apply each artifact's packer. The packed name replaces the raw one in place;
    /// an artifact whose packer fails is dropped.
    pub fn pack_images(&self, report: &mut PackagingReport) {
        let artifacts = std::mem::take(&mut report.artifacts);
        for mut artifact in artifacts {
            match pack_file(
                artifact.packer,
                &self.builddir,
                &artifact.name,
                artifact.kind,
                self.host,
            ) {
                Ok(packed) => {
                    artifact.name = packed;
                    report.artifacts.push(artifact);
                }
                Err(e) => report.fail(artifact.kind, &artifact.name, &e),
            }
        }
    }

    pub fn run(&self) -> PackagingReport {
        let mut report = PackagingReport::default();
        self.part_target(&mut report);
        self.pack_images(&mut report);
        info!(
            "packaging finished: {} artifacts, {} failures",
            report.artifacts.len(),
            report.failures.len()
        );
        report
    }
}
