use diskmount_core::{CommandError, CommandOutput, CommandRunner, CommandSpec};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Runs tools as child processes, optionally bounded by a timeout. A child
/// that outlives the timeout is killed.
#[derive(Debug, Clone, Default)]
pub struct TokioCommandRunner {
    timeout: Option<Duration>,
}

impl TokioCommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }
}

#[async_trait::async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn run(&self, command: &CommandSpec) -> Result<CommandOutput, CommandError> {
        let program = which::which(&command.program).map_err(|_| CommandError::NotFound {
            program: command.program.clone(),
        })?;

        let mut child = Command::new(&program);
        child
            .args(&command.args)
            .envs(command.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let finished = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, child.output())
                .await
                .map_err(|_| CommandError::Timeout {
                    program: command.program.clone(),
                    after: limit,
                })?,
            None => child.output().await,
        };

        let output = finished.map_err(|source| CommandError::Spawn {
            program: command.program.clone(),
            source,
        })?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_captures_exit_code_and_stderr() {
        let runner = TokioCommandRunner::new();
        let spec = CommandSpec::new("sh").args(["-c", "echo out; echo oops >&2; exit 3"]);

        let output = runner.run(&spec).await.unwrap();
        assert_eq!(output.code, Some(3));
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "oops");

        match runner.run_checked(&spec).await {
            Err(CommandError::Failed { code, stderr, .. }) => {
                assert_eq!(code, Some(3));
                assert!(stderr.contains("oops"));
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_passes_environment() {
        let runner = TokioCommandRunner::new();
        let spec = CommandSpec::new("sh")
            .args(["-c", "printf %s \"$LC_ALL\""])
            .env("LC_ALL", "C");
        assert_eq!(runner.run(&spec).await.unwrap().stdout, "C");
    }

    #[tokio::test]
    async fn test_unknown_program_is_not_found() {
        let runner = TokioCommandRunner::new();
        let err = runner
            .run(&CommandSpec::new("diskmount-no-such-tool"))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_slow_command_times_out() {
        let runner = TokioCommandRunner::with_timeout(Some(Duration::from_millis(100)));
        let err = runner
            .run(&CommandSpec::new("sleep").arg("5"))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Timeout { .. }));
    }
}
