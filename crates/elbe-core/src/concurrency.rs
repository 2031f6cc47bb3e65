use crate::CoreError;
use elbe_runtime::sandboxes_active;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

/// Exclusive advisory lock on a build target, held for the lifetime of the value.
pub struct TargetLock {
    lock_file: File,
    path: PathBuf,
}

impl TargetLock {
    /// `<target>.lock`, next to the target directory.
    pub fn path_for(target: &Path) -> PathBuf {
        let mut name = target
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "target".into());
        name.push(".lock");
        target.with_file_name(name)
    }

    fn open(lock_path: &Path) -> Result<File, CoreError> {
        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(lock_path)?)
    }

    /// Take the lock on `target` or fail with [`CoreError::Lock`] if another build holds it.
    pub fn try_acquire(target: &Path) -> Result<Self, CoreError> {
        let path = Self::path_for(target);
        let file = Self::open(&path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Self {
                lock_file: file,
                path,
            }),
            Err(_) => Err(CoreError::Lock(target.to_path_buf())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TargetLock {
    fn drop(&mut self) {
        let _ = self.lock_file.unlock();
    }
}

static INTERRUPT_REQUESTED: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InterruptAction {
    /// First signal: stop at the next phase boundary.
    Request,
    /// Repeated while a sandbox is up: exiting now would skip its teardown.
    Defer,
    Exit,
}

fn interrupt_action(already_requested: bool, sandbox_active: bool) -> InterruptAction {
    match (already_requested, sandbox_active) {
        (false, _) => InterruptAction::Request,
        (true, true) => InterruptAction::Defer,
        (true, false) => InterruptAction::Exit,
    }
}

fn on_interrupt(flag: &AtomicBool) -> InterruptAction {
    let action = interrupt_action(flag.load(Ordering::SeqCst), sandboxes_active());
    match action {
        InterruptAction::Request => {
            flag.store(true, Ordering::SeqCst);
            eprintln!("\ninterrupt requested, stopping after the current phase...");
        }
        InterruptAction::Defer => {
            eprintln!("\nsandbox still mounted, waiting for its teardown...");
        }
        InterruptAction::Exit => {}
    }
    action
}

/// Record Ctrl-C instead of dying mid-phase. A second signal exits at once unless a
/// sandbox is still up, in which case it is deferred like the first.
pub fn install_signal_handler() {
    let _ = ctrlc::set_handler(move || {
        if on_interrupt(&INTERRUPT_REQUESTED) == InterruptAction::Exit {
            std::process::exit(130);
        }
    });
}

/// The flag set by [`install_signal_handler`].
pub fn interrupt_flag() -> &'static AtomicBool {
    &INTERRUPT_REQUESTED
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_path_sits_next_to_target() {
        assert_eq!(
            TargetLock::path_for(Path::new("/build/target")),
            PathBuf::from("/build/target.lock")
        );
    }

    #[test]
    fn lock_acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("target");
        {
            let lock = TargetLock::try_acquire(&target).unwrap();
            assert!(lock.path().exists());
        }
        assert!(TargetLock::try_acquire(&target).is_ok());
    }

    #[test]
    fn second_build_on_same_target_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("target");
        let _held = TargetLock::try_acquire(&target).unwrap();
        assert!(matches!(
            TargetLock::try_acquire(&target),
            Err(CoreError::Lock(p)) if p == target
        ));
    }

    #[test]
    fn locks_on_different_targets_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let _a = TargetLock::try_acquire(&dir.path().join("a")).unwrap();
        assert!(TargetLock::try_acquire(&dir.path().join("b")).is_ok());
    }

    #[test]
    fn repeated_interrupt_exits_only_without_a_sandbox() {
        assert_eq!(interrupt_action(false, false), InterruptAction::Request);
        assert_eq!(interrupt_action(false, true), InterruptAction::Request);
        assert_eq!(interrupt_action(true, true), InterruptAction::Defer);
        assert_eq!(interrupt_action(true, false), InterruptAction::Exit);
    }

    #[test]
    fn second_interrupt_is_deferred_while_a_sandbox_is_up() {
        static FLAG: AtomicBool = AtomicBool::new(false);
        let _sandbox = elbe_runtime::ActiveSandbox::enter();
        assert_eq!(on_interrupt(&FLAG), InterruptAction::Request);
        assert!(FLAG.load(Ordering::SeqCst));
        assert_eq!(on_interrupt(&FLAG), InterruptAction::Defer);
        assert_eq!(on_interrupt(&FLAG), InterruptAction::Defer);
        assert!(FLAG.load(Ordering::SeqCst));
    }
}
