use crate::licenses::{collect_licenses, LicenseReport};
use crate::{selections, CoreError};
use elbe_fs::layout::{DESCRIPTOR_COPY, ELBE_VERSION, FSTAB, UPDATED_VERSION};
use elbe_fs::ScopedFs;
use elbe_runtime::HostOps;
use elbe_schema::{render_fstab, ProjectConfig};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// Finalizes an extracted target: package selections and the metadata files every
/// image carries.
pub struct TargetAssembler<'a> {
    fs: ScopedFs,
    config: &'a ProjectConfig,
    host: &'a dyn HostOps,
}

impl<'a> TargetAssembler<'a> {
    pub fn new(fs: ScopedFs, config: &'a ProjectConfig, host: &'a dyn HostOps) -> Self {
        Self { fs, config, host }
    }

    pub fn fs(&self) -> &ScopedFs {
        &self.fs
    }

    /// Purge everything not listed in `target.packages`. A no-op unless `setsel` is set.
    pub fn apply_selections(&self) -> Result<(), CoreError> {
        if !self.config.target.setsel {
            return Ok(());
        }
        selections::apply(&self.fs, self.config, self.host)
    }

    /// Write `etc/fstab` in descriptor order, without the `no_fstab` entries.
    pub fn write_fstab(&self) -> Result<(), CoreError> {
        self.fs.ensure_dir("etc")?;
        let content = render_fstab(&self.config.target.fstab);
        self.fs.write_file(FSTAB, 0o644, content)?;
        debug!("wrote {FSTAB}");
        Ok(())
    }

    /// Version stamps plus a read-only copy of the descriptor.
    pub fn dump_version(&self) -> Result<(), CoreError> {
        self.fs.ensure_dir("etc")?;
        let project = &self.config.project;
        let stamp = format!(
            "{} {}\nthis RFS was generated by elbe {}\n{}\n",
            project.name,
            project.version,
            env!("CARGO_PKG_VERSION"),
            chrono::Local::now().format("%c"),
        );
        self.fs.write_file(ELBE_VERSION, 0o644, stamp)?;
        self.fs
            .write_file(UPDATED_VERSION, 0o644, project.version.as_str())?;

        // An earlier build leaves the copy read-only.
        self.fs.remove_file(DESCRIPTOR_COPY)?;
        self.fs
            .write_file(DESCRIPTOR_COPY, 0o400, self.config.to_toml()?)?;
        info!("stamped {} {}", project.name, project.version);
        Ok(())
    }

    /// Collect license texts and write the requested reports to host paths.
    pub fn write_licenses(
        &self,
        text_out: Option<&Path>,
        structured_out: Option<&Path>,
    ) -> Result<LicenseReport, CoreError> {
        let report = collect_licenses(&self.fs)?;
        if let Some(path) = text_out {
            create_parent(path)?;
            fs::write(path, report.render_text())?;
            info!("license text written to {}", path.display());
        }
        if let Some(path) = structured_out {
            create_parent(path)?;
            fs::write(path, report.to_json()?)?;
            info!("license manifest written to {}", path.display());
        }
        Ok(report)
    }
}

fn create_parent(path: &Path) -> Result<(), CoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}
