use super::EXIT_SUCCESS;
use elbe_fs::ScopedFs;
use elbe_runtime::{ChrootSandbox, HostSystem, RuntimeError, SandboxConfig, ToolOutput};
use std::io::Write;
use std::path::Path;

fn lifecycle(e: &RuntimeError) -> String {
    match e {
        RuntimeError::Mount { .. }
        | RuntimeError::Unmount { .. }
        | RuntimeError::SandboxState { .. }
        | RuntimeError::Chroot { .. } => format!("sandbox lifecycle: {e}"),
        other => other.to_string(),
    }
}

/// Pass the command's captured streams through, then turn its exit status into ours.
fn forward(
    output: &ToolOutput,
    command: &str,
    out: &mut impl Write,
    err: &mut impl Write,
) -> Result<u8, String> {
    out.write_all(output.stdout.as_bytes())
        .and_then(|()| err.write_all(output.stderr.as_bytes()))
        .map_err(|e| format!("failed to forward output of '{command}': {e}"))?;
    match output.status {
        Some(0) => Ok(EXIT_SUCCESS),
        Some(code) => Err(format!("'{command}' exited with status {code}")),
        None => Err(format!("'{command}' was killed by a signal")),
    }
}

/// Open a sandbox on `target`, enter it, run `command`, and take everything down again.
pub fn run(target: &Path, interpreter: Option<String>, command: &[String]) -> Result<u8, String> {
    let host = HostSystem::new();
    let config = SandboxConfig {
        interpreter,
        ..SandboxConfig::default()
    };
    let mut sandbox =
        ChrootSandbox::open(ScopedFs::new(target), config, &host).map_err(|e| lifecycle(&e))?;
    sandbox.mount().map_err(|e| lifecycle(&e))?;
    sandbox.enter_sandbox().map_err(|e| lifecycle(&e))?;

    let argv: Vec<&str> = command.iter().map(String::as_str).collect();
    let output = sandbox.exec(&argv, None);

    sandbox.leave_sandbox().map_err(|e| lifecycle(&e))?;
    sandbox.close().map_err(|e| lifecycle(&e))?;

    let output = output.map_err(|e| lifecycle(&e))?;
    forward(
        &output,
        &command.join(" "),
        &mut std::io::stdout().lock(),
        &mut std::io::stderr().lock(),
    )
}
