use crate::exec::{ToolCommand, ToolOutput};
use crate::RuntimeError;
use elbe_fs::mounts;
use std::fs::File;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, trace, warn};

/// Locale variables forced to `C` while a process root is changed.
pub const LOCALE_VARS: [&str; 3] = ["LANG", "LANGUAGE", "LC_ALL"];

/// One pseudo or bind mount, relative to a target root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MountSpec {
    pub source: &'static str,
    pub target: &'static str,
    /// `None` for bind mounts.
    pub fs_type: Option<&'static str>,
}

/// Process root and working directory captured before a root change.
#[derive(Debug)]
pub struct SavedRoot {
    dir: Option<File>,
    cwd: PathBuf,
    chrooted: bool,
}

impl SavedRoot {
    /// A saved root that restores nothing.
    pub fn detached(cwd: PathBuf) -> Self {
        Self {
            dir: None,
            cwd,
            chrooted: false,
        }
    }
}

/// Host-side effects the builder needs: external tools, mounts, and the process root.
pub trait HostOps {
    /// Run a tool to completion. A non-zero exit is reported in the output, not as `Err`.
    fn run(&self, cmd: &ToolCommand) -> Result<ToolOutput, RuntimeError>;
    fn mount(&self, spec: &MountSpec, target: &Path) -> Result<(), RuntimeError>;
    fn unmount(&self, target: &Path) -> Result<(), RuntimeError>;
    fn is_mount_point(&self, path: &Path) -> bool;
    /// Force the C locale, change into `root` and make it the process root.
    /// `/` changes directory only.
    fn change_root(&self, root: &Path) -> Result<SavedRoot, RuntimeError>;
    fn restore_root(&self, saved: SavedRoot) -> Result<(), RuntimeError>;

    fn run_checked(&self, cmd: &ToolCommand) -> Result<ToolOutput, RuntimeError> {
        self.run(cmd)?.check(cmd)
    }
}

/// The real host: `std::process::Command`, `/proc/mounts`, and chroot syscalls.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostSystem;

impl HostSystem {
    pub fn new() -> Self {
        Self
    }
}

impl HostOps for HostSystem {
    fn run(&self, cmd: &ToolCommand) -> Result<ToolOutput, RuntimeError> {
        debug!("exec: {cmd}");
        let mut command = Command::new(&cmd.program);
        command.args(&cmd.args);
        if let Some(dir) = &cmd.cwd {
            command.current_dir(dir);
        }
        command.envs(cmd.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        match &cmd.stdin {
            Some(path) => command.stdin(File::open(path)?),
            None => command.stdin(Stdio::null()),
        };
        if let Some(path) = &cmd.stdout {
            command.stdout(File::create(path)?);
        }

        let output = command.output().map_err(|e| RuntimeError::Spawn {
            program: cmd.program.clone(),
            source: e,
        })?;
        let result = ToolOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        trace!("{} exited with {:?}", cmd.program, result.status);
        Ok(result)
    }

    fn mount(&self, spec: &MountSpec, target: &Path) -> Result<(), RuntimeError> {
        let target_str = target.to_string_lossy().into_owned();
        let cmd = match spec.fs_type {
            Some(fs_type) => ToolCommand::new("mount").args(["-t", fs_type, spec.source]),
            None => ToolCommand::new("mount").args(["-o", "bind", spec.source]),
        }
        .arg(target_str);
        let output = self.run(&cmd)?;
        if output.is_success() {
            Ok(())
        } else {
            Err(RuntimeError::Mount {
                target: target.to_path_buf(),
                reason: output.stderr.trim().to_owned(),
            })
        }
    }

    fn unmount(&self, target: &Path) -> Result<(), RuntimeError> {
        let cmd = ToolCommand::new("umount").arg(target.to_string_lossy());
        let output = self.run(&cmd)?;
        if output.is_success() {
            Ok(())
        } else {
            Err(RuntimeError::Unmount {
                target: target.to_path_buf(),
                reason: output.stderr.trim().to_owned(),
            })
        }
    }

    fn is_mount_point(&self, path: &Path) -> bool {
        mounts::is_mount_point(path)
    }

    fn change_root(&self, root: &Path) -> Result<SavedRoot, RuntimeError> {
        let chroot_err = |source| RuntimeError::Chroot {
            root: root.to_path_buf(),
            source,
        };
        // Relative roots would be looked up again from inside `root` after the chdir.
        let absolute = std::fs::canonicalize(root).map_err(chroot_err)?;
        let dir = File::open("/")?;
        let cwd = std::env::current_dir()?;
        for key in LOCALE_VARS {
            std::env::set_var(key, "C");
        }
        std::env::set_current_dir(&absolute).map_err(chroot_err)?;

        let chrooted = absolute != Path::new("/");
        if chrooted {
            if let Err(e) = std::os::unix::fs::chroot(&absolute) {
                if let Err(back) = std::env::set_current_dir(&cwd) {
                    warn!("could not return to {}: {back}", cwd.display());
                }
                return Err(chroot_err(e));
            }
            if let Err(e) = std::env::set_current_dir("/") {
                let saved = SavedRoot {
                    dir: Some(dir),
                    cwd,
                    chrooted,
                };
                if let Err(back) = self.restore_root(saved) {
                    warn!("could not leave {} again: {back}", absolute.display());
                }
                return Err(chroot_err(e));
            }
        }
        debug!("changed root to {}", absolute.display());
        Ok(SavedRoot {
            dir: Some(dir),
            cwd,
            chrooted,
        })
    }

    fn restore_root(&self, saved: SavedRoot) -> Result<(), RuntimeError> {
        if let Some(dir) = &saved.dir {
            fchdir(dir)?;
        }
        if saved.chrooted {
            std::os::unix::fs::chroot(".").map_err(|e| RuntimeError::Chroot {
                root: PathBuf::from("/"),
                source: e,
            })?;
        }
        std::env::set_current_dir(&saved.cwd)?;
        debug!("restored root, cwd {}", saved.cwd.display());
        Ok(())
    }
}

/// Safe wrapper around `libc::fchdir`.
#[allow(unsafe_code)]
fn fchdir(dir: &File) -> std::io::Result<()> {
    // SAFETY: the descriptor is owned by `dir`, which outlives the call.
    let rc = unsafe { libc::fchdir(dir.as_raw_fd()) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}
