use crate::exec::{ToolCommand, ToolOutput};
use crate::host::{HostOps, MountSpec, SavedRoot};
use crate::RuntimeError;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct MockState {
    commands: Vec<ToolCommand>,
    mounted: BTreeSet<PathBuf>,
    unmounted: Vec<PathBuf>,
    failing_programs: BTreeSet<String>,
    failing_mounts: Vec<PathBuf>,
    responses: BTreeMap<String, String>,
    root_depth: usize,
}

/// Recording host for tests: no process is spawned, nothing is mounted.
///
/// Every tool invocation succeeds unless its program was registered with
/// [`MockHost::fail_program`]. Mounts are tracked in memory so unmount ordering and
/// idempotency can be asserted.
#[derive(Debug, Default)]
pub struct MockHost {
    state: Mutex<MockState>,
}

impl MockHost {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every invocation of `program` exit with status 1.
    pub fn fail_program(&self, program: &str) {
        self.lock().failing_programs.insert(program.to_owned());
    }

    /// Make mounting any target ending in `rel` fail.
    pub fn fail_mount(&self, rel: &str) {
        self.lock().failing_mounts.push(PathBuf::from(rel));
    }

    /// Stdout returned by every successful invocation of `program`.
    pub fn respond(&self, program: &str, stdout: &str) {
        self.lock()
            .responses
            .insert(program.to_owned(), stdout.to_owned());
    }

    /// Pretend something outside the sandbox mounted `path`.
    pub fn mark_mounted(&self, path: PathBuf) {
        self.lock().mounted.insert(path);
    }

    pub fn commands(&self) -> Vec<ToolCommand> {
        self.lock().commands.clone()
    }

    /// Recorded invocations rendered as command lines.
    pub fn command_lines(&self) -> Vec<String> {
        self.lock().commands.iter().map(ToString::to_string).collect()
    }

    pub fn mounted(&self) -> Vec<PathBuf> {
        self.lock().mounted.iter().cloned().collect()
    }

    /// Unmounted paths in call order.
    pub fn unmounted(&self) -> Vec<PathBuf> {
        self.lock().unmounted.clone()
    }

    /// Number of root changes not yet restored.
    pub fn root_depth(&self) -> usize {
        self.lock().root_depth
    }
}

impl HostOps for MockHost {
    fn run(&self, cmd: &ToolCommand) -> Result<ToolOutput, RuntimeError> {
        let mut state = self.lock();
        state.commands.push(cmd.clone());
        if state.failing_programs.contains(&cmd.program) {
            return Ok(ToolOutput {
                status: Some(1),
                stdout: String::new(),
                stderr: format!("mock: {} failed", cmd.program),
            });
        }
        Ok(ToolOutput {
            status: Some(0),
            stdout: state.responses.get(&cmd.program).cloned().unwrap_or_default(),
            stderr: String::new(),
        })
    }

    fn mount(&self, spec: &MountSpec, target: &Path) -> Result<(), RuntimeError> {
        let mut state = self.lock();
        if state.failing_mounts.iter().any(|rel| target.ends_with(rel)) {
            return Err(RuntimeError::Mount {
                target: target.to_path_buf(),
                reason: format!("mock: cannot mount {}", spec.source),
            });
        }
        state.mounted.insert(target.to_path_buf());
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<(), RuntimeError> {
        let mut state = self.lock();
        if !state.mounted.remove(target) {
            return Err(RuntimeError::Unmount {
                target: target.to_path_buf(),
                reason: "mock: not mounted".to_owned(),
            });
        }
        state.unmounted.push(target.to_path_buf());
        Ok(())
    }

    fn is_mount_point(&self, path: &Path) -> bool {
        self.lock().mounted.contains(path)
    }

    fn change_root(&self, _root: &Path) -> Result<SavedRoot, RuntimeError> {
        self.lock().root_depth += 1;
        Ok(SavedRoot::detached(PathBuf::from("/")))
    }

    fn restore_root(&self, _saved: SavedRoot) -> Result<(), RuntimeError> {
        let mut state = self.lock();
        state.root_depth = state.root_depth.saturating_sub(1);
        Ok(())
    }
}
