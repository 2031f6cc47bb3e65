use crate::exec::{ToolCommand, ToolOutput};
use crate::host::{HostOps, MountSpec, SavedRoot, LOCALE_VARS};
use crate::RuntimeError;
use elbe_fs::layout::{
    interpreter_path, saved_original, APT_CONF, POLICY_RC_D, POLICY_RC_D_SCRIPT, PSEUDO_FS_DIRS,
    RESOLV_CONF,
};
use elbe_fs::ScopedFs;
use elbe_schema::SandboxSection;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, error, info, warn};

/// Mounted in this order.
pub const SANDBOX_MOUNTS: [MountSpec; 4] = [
    MountSpec {
        source: "none",
        target: "proc",
        fs_type: Some("proc"),
    },
    MountSpec {
        source: "none",
        target: "sys",
        fs_type: Some("sysfs"),
    },
    MountSpec {
        source: "/dev",
        target: "dev",
        fs_type: None,
    },
    MountSpec {
        source: "/dev/pts",
        target: "dev/pts",
        fs_type: None,
    },
];

/// Unmounted in this order; nested mounts come first.
pub const UNMOUNT_ORDER: [&str; 5] = ["proc/sys/fs/binfmt_misc", "dev/pts", "dev", "sys", "proc"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    Unmounted,
    Mounted,
    InChroot,
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unmounted => f.write_str("unmounted"),
            Self::Mounted => f.write_str("mounted"),
            Self::InChroot => f.write_str("in-chroot"),
        }
    }
}

static ACTIVE_SANDBOXES: AtomicUsize = AtomicUsize::new(0);

/// Held by every sandbox from `open` until teardown.
///
/// While any guard is alive the process may have mounts or swapped files in a
/// target, so signal handling must not exit without running teardown first.
#[derive(Debug)]
pub struct ActiveSandbox(());

impl ActiveSandbox {
    pub fn enter() -> Self {
        ACTIVE_SANDBOXES.fetch_add(1, Ordering::SeqCst);
        Self(())
    }
}

impl Drop for ActiveSandbox {
    fn drop(&mut self) {
        ACTIVE_SANDBOXES.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Whether any sandbox in this process has yet to be torn down.
pub fn sandboxes_active() -> bool {
    ACTIVE_SANDBOXES.load(Ordering::SeqCst) > 0
}

/// Release mounts a previous sandbox left on `root`, deepest first. Best effort:
/// failures are logged and the count of released mounts is returned.
pub fn release_stale_mounts(root: &Path, host: &dyn HostOps) -> usize {
    let mut released = 0;
    for rel in UNMOUNT_ORDER {
        let target = root.join(rel);
        if !host.is_mount_point(&target) {
            continue;
        }
        match host.unmount(&target) {
            Ok(()) => {
                warn!("released stale mount {}", target.display());
                released += 1;
            }
            Err(e) => error!("stale mount {} could not be released: {e}", target.display()),
        }
    }
    released
}

/// Host resources the sandbox injects into its target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxConfig {
    /// User-mode emulator to inject; `None` for native builds.
    pub interpreter: Option<String>,
    /// Searched in order for the interpreter.
    pub interpreter_dirs: Vec<PathBuf>,
    pub resolv_conf: PathBuf,
    pub apt_conf: PathBuf,
}

impl SandboxConfig {
    pub fn from_section(section: &SandboxSection, interpreter: Option<String>) -> Self {
        Self {
            interpreter,
            interpreter_dirs: vec![section.interpreter_dir.clone(), PathBuf::from("/usr/bin")],
            resolv_conf: section.resolv_conf.clone(),
            apt_conf: section.apt_conf.clone(),
        }
    }

    fn find_interpreter(&self, name: &str) -> Option<PathBuf> {
        self.interpreter_dirs
            .iter()
            .map(|dir| dir.join(name))
            .find(|candidate| candidate.exists())
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self::from_section(&SandboxSection::default(), None)
    }
}

/// What scoped setup actually changed, so teardown undoes exactly that.
///
/// A swapped file is recorded as soon as the target's original has been parked, before
/// the host copy is attempted.
#[derive(Debug, Default)]
struct Injected {
    interpreter: Option<String>,
    resolv_conf: bool,
    apt_conf: bool,
    policy_rc_d: bool,
}

/// Mount/chroot state machine over one target directory.
///
/// ```text
/// Unmounted --mount()--> Mounted --enter_sandbox()--> InChroot
/// InChroot --leave_sandbox()--> Mounted --unmount()--> Unmounted
/// ```
///
/// [`ChrootSandbox::open`] performs the scoped setup (interpreter, host `resolv.conf` and
/// apt configuration, `policy-rc.d`). Teardown runs on [`ChrootSandbox::close`] or on drop,
/// whichever comes first: it leaves the chroot, unmounts, and reverts the setup.
/// A target of `/` never mounts or changes root.
pub struct ChrootSandbox<'h> {
    fs: ScopedFs,
    host: &'h dyn HostOps,
    config: SandboxConfig,
    state: SandboxState,
    saved_root: Option<SavedRoot>,
    injected: Injected,
    active: Option<ActiveSandbox>,
    closed: bool,
}

impl<'h> ChrootSandbox<'h> {
    pub fn open(
        fs: ScopedFs,
        config: SandboxConfig,
        host: &'h dyn HostOps,
    ) -> Result<Self, RuntimeError> {
        let mut sandbox = Self {
            fs,
            host,
            config,
            state: SandboxState::Unmounted,
            saved_root: None,
            injected: Injected::default(),
            active: Some(ActiveSandbox::enter()),
            closed: false,
        };
        if let Err(e) = sandbox.setup() {
            error!("sandbox setup for {} failed: {e}", sandbox.root().display());
            sandbox.teardown();
            return Err(e);
        }
        info!("sandbox opened on {}", sandbox.root().display());
        Ok(sandbox)
    }

    pub fn state(&self) -> SandboxState {
        self.state
    }

    pub fn fs(&self) -> &ScopedFs {
        &self.fs
    }

    pub fn root(&self) -> &Path {
        self.fs.root()
    }

    fn setup(&mut self) -> Result<(), RuntimeError> {
        if let Some(name) = self.config.interpreter.clone() {
            let source = self
                .config
                .find_interpreter(&name)
                .ok_or_else(|| RuntimeError::InterpreterNotFound(name.clone()))?;
            self.fs.ensure_dir("usr/bin")?;
            let dest = interpreter_path(&name);
            self.injected.interpreter = Some(name);
            self.fs.copy_from_host(&source, &dest)?;
            debug!("injected interpreter {} from {}", dest, source.display());
        }

        swap_in(
            &self.fs,
            &self.config.resolv_conf,
            RESOLV_CONF,
            &mut self.injected.resolv_conf,
        )?;
        swap_in(
            &self.fs,
            &self.config.apt_conf,
            APT_CONF,
            &mut self.injected.apt_conf,
        )?;

        self.fs.ensure_dir("usr/sbin")?;
        self.fs.write_file(POLICY_RC_D, 0o755, POLICY_RC_D_SCRIPT)?;
        self.injected.policy_rc_d = true;
        Ok(())
    }

    fn restore_original(&self, rel: &str) -> Result<(), RuntimeError> {
        self.fs.remove_file(rel)?;
        let orig = saved_original(rel);
        if self.fs.exists(&orig)? {
            self.fs.rename(&orig, rel)?;
        }
        Ok(())
    }

    fn expect_state(&self, expected: SandboxState) -> Result<(), RuntimeError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(RuntimeError::SandboxState {
                expected,
                actual: self.state,
            })
        }
    }

    /// Mount the pseudo filesystems. On failure everything already mounted is released.
    pub fn mount(&mut self) -> Result<(), RuntimeError> {
        self.expect_state(SandboxState::Unmounted)?;
        for dir in PSEUDO_FS_DIRS {
            self.fs.ensure_dir(dir)?;
        }
        if self.fs.is_host_root() {
            self.state = SandboxState::Mounted;
            return Ok(());
        }

        for spec in &SANDBOX_MOUNTS {
            let target = self.fs.resolve(spec.target)?;
            if let Err(e) = self.host.mount(spec, &target) {
                error!("mount of {} failed: {e}", target.display());
                if let Err(cleanup) = self.release_mounts() {
                    warn!("cleanup after failed mount incomplete: {cleanup}");
                }
                return Err(e);
            }
            debug!("mounted {} on {}", spec.source, target.display());
        }
        self.state = SandboxState::Mounted;
        Ok(())
    }

    /// Unmount whatever is actually mounted. Idempotent; refused while inside the chroot.
    pub fn unmount(&mut self) -> Result<(), RuntimeError> {
        if self.state == SandboxState::InChroot {
            return Err(RuntimeError::SandboxState {
                expected: SandboxState::Mounted,
                actual: SandboxState::InChroot,
            });
        }
        if self.fs.is_host_root() {
            self.state = SandboxState::Unmounted;
            return Ok(());
        }
        self.release_mounts()?;
        self.state = SandboxState::Unmounted;
        Ok(())
    }

    /// Attempt every unmount, returning the first failure.
    fn release_mounts(&self) -> Result<(), RuntimeError> {
        let mut first_err = None;
        for rel in UNMOUNT_ORDER {
            let target = self.fs.resolve(rel)?;
            if !self.host.is_mount_point(&target) {
                continue;
            }
            match self.host.unmount(&target) {
                Ok(()) => debug!("unmounted {}", target.display()),
                Err(e) => {
                    error!("unmount of {} failed: {e}", target.display());
                    first_err.get_or_insert(e);
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    pub fn enter_sandbox(&mut self) -> Result<(), RuntimeError> {
        self.expect_state(SandboxState::Mounted)?;
        let saved = self.host.change_root(self.fs.root())?;
        self.saved_root = Some(saved);
        self.state = SandboxState::InChroot;
        info!("entered sandbox {}", self.root().display());
        Ok(())
    }

    pub fn leave_sandbox(&mut self) -> Result<(), RuntimeError> {
        self.expect_state(SandboxState::InChroot)?;
        if let Some(saved) = self.saved_root.take() {
            self.host.restore_root(saved)?;
        }
        self.state = SandboxState::Mounted;
        info!("left sandbox {}", self.root().display());
        Ok(())
    }

    /// Run `argv` with the target as root, under the C locale, failing on a non-zero exit.
    ///
    /// From `Mounted` the host `chroot` tool is used; from `InChroot` the process root
    /// already is the target. `stdin` is a path relative to the target.
    pub fn run(&self, argv: &[&str], stdin: Option<&str>) -> Result<ToolOutput, RuntimeError> {
        let cmd = self.command(argv, stdin)?;
        self.host.run_checked(&cmd)
    }

    /// Like [`ChrootSandbox::run`], but the exit status is left to the caller.
    pub fn exec(&self, argv: &[&str], stdin: Option<&str>) -> Result<ToolOutput, RuntimeError> {
        let cmd = self.command(argv, stdin)?;
        self.host.run(&cmd)
    }

    fn command(&self, argv: &[&str], stdin: Option<&str>) -> Result<ToolCommand, RuntimeError> {
        let Some((program, args)) = argv.split_first() else {
            return Err(RuntimeError::Spawn {
                program: String::new(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty argv"),
            });
        };
        let mut cmd = match self.state {
            SandboxState::Unmounted => {
                return Err(RuntimeError::SandboxState {
                    expected: SandboxState::Mounted,
                    actual: SandboxState::Unmounted,
                })
            }
            SandboxState::Mounted if !self.fs.is_host_root() => ToolCommand::new("chroot")
                .arg(self.root().to_string_lossy())
                .arg(*program)
                .args(args.iter().copied()),
            _ => ToolCommand::new(*program).args(args.iter().copied()),
        };
        for key in LOCALE_VARS {
            cmd = cmd.env(key, "C");
        }
        if let Some(rel) = stdin {
            cmd = match self.state {
                SandboxState::InChroot if !self.fs.is_host_root() => {
                    cmd.stdin_file(Path::new("/").join(rel.trim_start_matches('/')))
                }
                _ => cmd.stdin_file(self.fs.resolve(rel)?),
            };
        }
        Ok(cmd)
    }

    /// Tear down and report the first failure.
    pub fn close(mut self) -> Result<(), RuntimeError> {
        let result = self.teardown_checked();
        self.closed = true;
        self.active = None;
        result
    }

    fn teardown(&mut self) {
        if let Err(e) = self.teardown_checked() {
            warn!("sandbox teardown of {} incomplete: {e}", self.root().display());
        }
        self.closed = true;
        self.active = None;
    }

    /// Every step is attempted even if an earlier one fails.
    fn teardown_checked(&mut self) -> Result<(), RuntimeError> {
        if self.closed {
            return Ok(());
        }
        let mut first_err: Option<RuntimeError> = None;
        let mut note = |r: Result<(), RuntimeError>| {
            if let Err(e) = r {
                warn!("teardown step failed: {e}");
                first_err.get_or_insert(e);
            }
        };

        if self.state == SandboxState::InChroot {
            note(self.leave_sandbox());
        }
        if self.state != SandboxState::InChroot {
            note(self.unmount());
        }

        if let Some(name) = self.injected.interpreter.take() {
            note(
                self.fs
                    .remove_file(interpreter_path(&name))
                    .map(drop)
                    .map_err(Into::into),
            );
        }
        if std::mem::take(&mut self.injected.resolv_conf) {
            note(self.restore_original(RESOLV_CONF));
        }
        if std::mem::take(&mut self.injected.apt_conf) {
            note(self.restore_original(APT_CONF));
        }
        if std::mem::take(&mut self.injected.policy_rc_d) {
            note(self.fs.remove_file(POLICY_RC_D).map(drop).map_err(Into::into));
        }

        debug!("sandbox on {} torn down", self.root().display());
        first_err.map_or(Ok(()), Err)
    }
}

/// Park the target's own `rel` under `.orig` and copy the host file in its place.
///
/// `parked` is set once the target has been touched, so a failed copy is still undone.
fn swap_in(
    fs: &ScopedFs,
    host_file: &Path,
    rel: &str,
    parked: &mut bool,
) -> Result<(), RuntimeError> {
    if !host_file.exists() {
        debug!("host has no {}, leaving {rel} alone", host_file.display());
        return Ok(());
    }
    if fs.exists(rel)? {
        fs.rename(rel, saved_original(rel))?;
    }
    *parked = true;
    if let Some(parent) = Path::new(rel).parent() {
        fs.ensure_dir(parent)?;
    }
    fs.copy_from_host(host_file, rel)?;
    Ok(())
}

impl Drop for ChrootSandbox<'_> {
    fn drop(&mut self) {
        if !self.closed {
            self.teardown();
        }
    }
}
