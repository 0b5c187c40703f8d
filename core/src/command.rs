use crate::error::CommandError;
use std::fmt;
use std::path::Path;

/// One external program invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn path_arg(self, path: &Path) -> Self {
        self.arg(path.to_string_lossy().into_owned())
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn has_arg(&self, arg: &str) -> bool {
        self.args.iter().any(|a| a == arg)
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failure(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Executes external tools. Implementations decide how (and how long) a
/// process may run; callers only see the captured output.
#[async_trait::async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs the command to completion. An `Err` means the process could not be
    /// run at all or did not finish in time; a non-zero exit is still `Ok`.
    async fn run(&self, command: &CommandSpec) -> Result<CommandOutput, CommandError>;

    /// Like [`run`](Self::run) but turns a non-zero exit into [`CommandError::Failed`].
    async fn run_checked(&self, command: &CommandSpec) -> Result<CommandOutput, CommandError> {
        tracing::debug!(command = %command, "running");
        let output = self.run(command).await?;
        if output.is_success() {
            Ok(output)
        } else {
            Err(CommandError::Failed {
                program: command.program.clone(),
                code: output.code,
                stderr: output.stderr,
            })
        }
    }
}
