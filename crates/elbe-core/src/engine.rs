use crate::concurrency::{interrupt_flag, TargetLock};
use crate::extract::{ExtractReport, FileSelector};
use crate::licenses::LicenseReport;
use crate::packager::{ImagePackager, PackagingReport};
use crate::target::TargetAssembler;
use crate::CoreError;
use elbe_fs::{DpkgCache, ScopedFs};
use elbe_runtime::{release_stale_mounts, HostOps};
use elbe_schema::{PackageCache, ProjectConfig, SelectionMode};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Installed tree the target is carved out of.
    pub source: PathBuf,
    pub target: PathBuf,
    /// Where artifacts and license reports land.
    pub builddir: PathBuf,
    /// Remove an existing target before extracting.
    pub clean_target: bool,
}

#[derive(Debug, Clone)]
pub struct BuildResult {
    pub extract: ExtractReport,
    pub packaging: PackagingReport,
    /// `None` when no license report was requested.
    pub licenses: Option<LicenseReport>,
}

/// Runs a build from extraction to packaging.
///
/// Phases run strictly in order under an exclusive lock on the target. An interrupt
/// request is only honored between phases, never while a sandbox is mounted.
pub struct Engine<'h> {
    config: ProjectConfig,
    host: &'h dyn HostOps,
    interrupt: &'static AtomicBool,
}

impl<'h> Engine<'h> {
    pub fn new(config: ProjectConfig, host: &'h dyn HostOps) -> Self {
        Self {
            config,
            host,
            interrupt: interrupt_flag(),
        }
    }

    /// Poll `flag` instead of the process-wide Ctrl-C flag.
    #[must_use]
    pub fn with_interrupt_flag(mut self, flag: &'static AtomicBool) -> Self {
        self.interrupt = flag;
        self
    }

    pub fn config(&self) -> &ProjectConfig {
        &self.config
    }

    fn checkpoint(&self, phase: &str) -> Result<(), CoreError> {
        if self.interrupt.load(Ordering::SeqCst) {
            warn!("interrupted after {phase}");
            return Err(CoreError::Interrupted);
        }
        Ok(())
    }

    /// Copy the selected part of the source into the target, nothing else.
    pub fn extract_only(&self, opts: &BuildOptions) -> Result<ExtractReport, CoreError> {
        self.config.validate()?;
        let _lock = TargetLock::try_acquire(&opts.target)?;
        let target = self.prepare_target(opts)?;
        self.extract(opts, &target)
    }

    /// Create the target, first releasing mounts a crashed build may have left on it.
    fn prepare_target(&self, opts: &BuildOptions) -> Result<ScopedFs, CoreError> {
        if opts.clean_target && opts.target.exists() {
            let released = release_stale_mounts(&opts.target, self.host);
            if released > 0 {
                warn!("released {released} stale mounts on {}", opts.target.display());
            }
        }
        Ok(ScopedFs::create(&opts.target, opts.clean_target)?)
    }

    fn extract(&self, opts: &BuildOptions, target: &ScopedFs) -> Result<ExtractReport, CoreError> {
        let source = ScopedFs::new(&opts.source);
        let mode = self.config.selection_mode();
        let arch = self.config.project.arch.as_str();
        let cache = match mode {
            SelectionMode::Diet => Some(DpkgCache::load(source.clone(), arch)?),
            SelectionMode::Full | SelectionMode::Tighten => None,
        };
        FileSelector::new(&source, arch, self.host).extract(
            target,
            mode,
            &self.config.target.packages,
            cache.as_ref().map(|c| c as &dyn PackageCache),
        )
    }

    pub fn build(&self, opts: &BuildOptions) -> Result<BuildResult, CoreError> {
        self.config.validate()?;
        let _lock = TargetLock::try_acquire(&opts.target)?;
        info!(
            "building {} {} for {}",
            self.config.project.name, self.config.project.version, self.config.project.arch
        );

        let target = self.prepare_target(opts)?;
        let extract = self.extract(opts, &target)?;
        self.checkpoint("extraction")?;

        let assembler = TargetAssembler::new(target.clone(), &self.config, self.host);
        assembler.apply_selections()?;
        assembler.write_fstab()?;
        assembler.dump_version()?;

        let licenses = &self.config.licenses;
        let licenses = if licenses.text.is_some() || licenses.structured.is_some() {
            let text = licenses.text.as_ref().map(|p| opts.builddir.join(p));
            let structured = licenses.structured.as_ref().map(|p| opts.builddir.join(p));
            let report = assembler.write_licenses(text.as_deref(), structured.as_deref())?;
            if report.unreadable() > 0 {
                warn!("{} license files could not be read", report.unreadable());
            }
            Some(report)
        } else {
            None
        };
        self.checkpoint("target assembly")?;

        std::fs::create_dir_all(&opts.builddir)?;
        let packaging =
            ImagePackager::new(&target, &opts.builddir, &self.config.target, self.host).run();
        for failure in &packaging.failures {
            warn!(
                "{} {} was not produced: {}",
                failure.kind, failure.name, failure.reason
            );
        }
        info!("build finished: {}", packaging.names().join(", "));

        Ok(BuildResult {
            extract,
            packaging,
            licenses,
        })
    }
}
