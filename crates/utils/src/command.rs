//! Cancelable external command execution.

use std::path::Path;
use std::process::Stdio;

use devnet_plugin::CommandSpec;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// How many lines of stderr are kept for error reporting.
pub const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("failed to spawn {program:?}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("command cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr_tail: Vec<String>,
    pub success: bool,
    /// Exit code, when the process exited normally.
    pub code: Option<i32>,
}

impl CommandOutput {
    pub fn stderr(&self) -> String {
        self.stderr_tail.join("\n")
    }
}

/// Runs `spec` in `dir`, streaming output lines to `on_line`.
///
/// Cancellation kills the child at the next safe point; whatever the child
/// wrote so far is discarded by the caller along with its scratch dir.
pub async fn run_command(
    spec: &CommandSpec,
    dir: &Path,
    cancel: &CancellationToken,
    mut on_line: impl FnMut(&str),
) -> Result<CommandOutput, CommandError> {
    trace!(target: "command", program = %spec.program, args = ?spec.args, "Running command.");

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|err| CommandError::Spawn { program: spec.program.clone(), source: err })?;

    let mut stdout_lines = BufReader::new(child.stdout.take().expect("stdout piped")).lines();
    let mut stderr_lines = BufReader::new(child.stderr.take().expect("stderr piped")).lines();

    let mut stdout = String::new();
    let mut stderr_tail: Vec<String> = Vec::new();
    let mut stdout_done = false;
    let mut stderr_done = false;

    let status = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                return Err(CommandError::Cancelled);
            }
            line = stdout_lines.next_line(), if !stdout_done => match line? {
                Some(line) => {
                    on_line(&line);
                    stdout.push_str(&line);
                    stdout.push('\n');
                }
                None => stdout_done = true,
            },
            line = stderr_lines.next_line(), if !stderr_done => match line? {
                Some(line) => {
                    on_line(&line);
                    if stderr_tail.len() == STDERR_TAIL_LINES {
                        stderr_tail.remove(0);
                    }
                    stderr_tail.push(line);
                }
                None => stderr_done = true,
            },
            status = child.wait(), if stdout_done && stderr_done => break status?,
        }
    };

    Ok(CommandOutput { stdout, stderr_tail, success: status.success(), code: status.code() })
}

/// Like [`run_command`], but with stdin fed from `input`. Used for commands
/// that read a mnemonic or confirmation from their standard input.
pub async fn run_command_with_stdin(
    spec: &CommandSpec,
    dir: &Path,
    input: &str,
    cancel: &CancellationToken,
) -> Result<CommandOutput, CommandError> {
    use tokio::io::AsyncWriteExt;

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .current_dir(dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|err| CommandError::Spawn { program: spec.program.clone(), source: err })?;

    {
        let mut stdin = child.stdin.take().expect("stdin piped");
        stdin.write_all(input.as_bytes()).await?;
        stdin.shutdown().await?;
    }

    use tokio::io::AsyncReadExt;

    let mut stdout_pipe = child.stdout.take().expect("stdout piped");
    let mut stderr_pipe = child.stderr.take().expect("stderr piped");

    let status = tokio::select! {
        _ = cancel.cancelled() => {
            let _ = child.kill().await;
            return Err(CommandError::Cancelled);
        }
        status = child.wait() => status?,
    };

    let mut stdout_buf = Vec::new();
    let mut stderr_buf = Vec::new();
    stdout_pipe.read_to_end(&mut stdout_buf).await?;
    stderr_pipe.read_to_end(&mut stderr_buf).await?;

    let stderr = String::from_utf8_lossy(&stderr_buf);
    let stderr_tail = stderr
        .lines()
        .rev()
        .take(STDERR_TAIL_LINES)
        .map(str::to_string)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&stdout_buf).into_owned(),
        stderr_tail,
        success: status.success(),
        code: status.code(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh").args(["-c", script])
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_status() {
        let dir = tempfile::tempdir().unwrap();
        let out = run_command(&sh("echo hello"), dir.path(), &CancellationToken::new(), |_| {})
            .await
            .unwrap();
        assert!(out.success);
        assert_eq!(out.stdout, "hello\n");
    }

    #[tokio::test]
    async fn keeps_bounded_stderr_tail_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let script = "for i in $(seq 1 40); do echo \"err $i\" >&2; done; exit 1";
        let out =
            run_command(&sh(script), dir.path(), &CancellationToken::new(), |_| {}).await.unwrap();
        assert!(!out.success);
        assert_eq!(out.stderr_tail.len(), STDERR_TAIL_LINES);
        assert_eq!(out.stderr_tail.last().unwrap(), "err 40");
    }

    #[tokio::test]
    async fn cancellation_kills_the_child() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = run_command(&sh("sleep 30"), dir.path(), &cancel, |_| {}).await.unwrap_err();
        assert!(matches!(err, CommandError::Cancelled));
    }

    #[tokio::test]
    async fn stdin_is_fed_to_the_child() {
        let dir = tempfile::tempdir().unwrap();
        let out = run_command_with_stdin(&sh("cat"), dir.path(), "hi\n", &CancellationToken::new())
            .await
            .unwrap();
        assert!(out.success);
        assert_eq!(out.stdout, "hi\n");
    }
}
