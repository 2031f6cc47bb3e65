use crate::RuntimeError;
use std::fmt;
use std::path::PathBuf;

/// Quote a string for safe interpolation into a POSIX shell command line.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// One invocation of an external tool.
///
/// `stdin` and `stdout` are host paths; when set, the stream is redirected from/to that
/// file instead of being captured.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub stdin: Option<PathBuf>,
    pub stdout: Option<PathBuf>,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn stdin_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdin = Some(path.into());
        self
    }

    #[must_use]
    pub fn stdout_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdout = Some(path.into());
        self
    }

    /// The shell pipeline `sh -c <script>`.
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new("sh").arg("-c").arg(script)
    }
}

impl fmt::Display for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            if needs_quoting(arg) {
                write!(f, " {}", shell_quote(arg))?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        if let Some(path) = &self.stdin {
            write!(f, " < {}", path.display())?;
        }
        if let Some(path) = &self.stdout {
            write!(f, " > {}", path.display())?;
        }
        Ok(())
    }
}

fn needs_quoting(arg: &str) -> bool {
    arg.is_empty()
        || arg.contains(|c: char| c.is_whitespace() || "'\"$`\\|&;<>()*?".contains(c))
}

/// Exit status and captured streams of a finished tool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    /// `None` when the process was killed by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success() -> Self {
        Self {
            status: Some(0),
            ..Self::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == Some(0)
    }

    /// Turn a non-zero exit into [`RuntimeError::ExternalTool`].
    pub fn check(self, cmd: &ToolCommand) -> Result<Self, RuntimeError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(RuntimeError::ExternalTool {
                command: cmd.to_string(),
                status: self.status,
                stderr: self.stderr.trim().to_owned(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("rfs.tgz"), "'rfs.tgz'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn shell_quote_prevents_injection() {
        let quoted = shell_quote("$(rm -rf /)");
        assert_eq!(quoted, "'$(rm -rf /)'");
    }

    #[test]
    fn display_quotes_only_where_needed() {
        let cmd = ToolCommand::new("tar")
            .args(["cfz", "/out/my rfs.tgz", "-C", "/t", "."])
            .stdin_file("/dev/null");
        assert_eq!(
            cmd.to_string(),
            "tar cfz '/out/my rfs.tgz' -C /t . < /dev/null"
        );
    }

    #[test]
    fn builder_collects_everything() {
        let cmd = ToolCommand::new("dpkg")
            .arg("--purge")
            .arg("-a")
            .current_dir("/t")
            .env("LC_ALL", "C")
            .stdout_file("/tmp/log");
        assert_eq!(cmd.args, vec!["--purge", "-a"]);
        assert_eq!(cmd.cwd, Some(PathBuf::from("/t")));
        assert_eq!(cmd.env, vec![("LC_ALL".to_owned(), "C".to_owned())]);
        assert_eq!(cmd.stdout, Some(PathBuf::from("/tmp/log")));
    }

    #[test]
    fn check_maps_failure_to_external_tool_error() {
        let cmd = ToolCommand::new("cpio");
        let failed = ToolOutput {
            status: Some(2),
            stdout: String::new(),
            stderr: "cpio: write error\n".to_owned(),
        };
        match failed.check(&cmd) {
            Err(RuntimeError::ExternalTool { status, stderr, .. }) => {
                assert_eq!(status, Some(2));
                assert_eq!(stderr, "cpio: write error");
            }
            other => panic!("expected ExternalTool, got {other:?}"),
        }
        assert!(ToolOutput::success().check(&cmd).is_ok());
    }
}
