//! Child process execution.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{ExecError, Result};

/// Default time a child gets between the termination signal and the kill.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(2);

/// How long to wait for output readers once the child is gone.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_millis(200);

/// A command line with its environment overlay and working directory.
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Added to (and overriding) the inherited environment.
    pub env: BTreeMap<String, String>,
    pub workdir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
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
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

/// Captured result of a successful command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Launches child processes on behalf of a step body.
///
/// Cancelling the token terminates the running child: `SIGTERM` first, then
/// a kill once the grace period has elapsed.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    cancel: CancellationToken,
    grace: Duration,
}

impl CommandRunner {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            grace: DEFAULT_GRACE_PERIOD,
        }
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn grace_period(&self) -> Duration {
        self.grace
    }

    /// Run to completion, capturing stdout and stderr.
    pub async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        tracing::debug!(program = %spec.program, args = ?spec.args, "running command");
        let mut child = self.spawn(spec)?;

        let stdout = child.stdout.take().map(capture);
        let stderr = child.stderr.take().map(capture);

        let status = self.wait(&mut child, &spec.program).await;
        let stdout = collect(stdout).await;
        let stderr = collect(stderr).await;

        let exit_code = check_status(&spec.program, status?)?;
        Ok(CommandOutput {
            exit_code,
            stdout,
            stderr,
        })
    }

    /// Run to completion, logging every output line as it arrives.
    pub async fn run_streaming(&self, spec: &CommandSpec) -> Result<i32> {
        tracing::info!(program = %spec.program, args = ?spec.args, "running command");
        let mut child = self.spawn(spec)?;

        let readers: Vec<_> = [
            child.stdout.take().map(|s| stream_lines(s, spec.program.clone(), "stdout")),
            child.stderr.take().map(|s| stream_lines(s, spec.program.clone(), "stderr")),
        ]
        .into_iter()
        .flatten()
        .collect();

        let status = self.wait(&mut child, &spec.program).await;
        for reader in readers {
            drain(reader).await;
        }
        check_status(&spec.program, status?)
    }

    fn spawn(&self, spec: &CommandSpec) -> Result<Child> {
        if self.cancel.is_cancelled() {
            return Err(ExecError::Cancelled {
                what: format!("'{}'", spec.program),
            });
        }
        spec.to_command().spawn().map_err(|source| ExecError::Spawn {
            program: spec.program.clone(),
            source,
        })
    }

    async fn wait(&self, child: &mut Child, program: &str) -> Result<ExitStatus> {
        tokio::select! {
            status = child.wait() => Ok(status?),
            _ = self.cancel.cancelled() => {
                self.terminate(child, program).await;
                Err(ExecError::Cancelled {
                    what: format!("'{}'", program),
                })
            }
        }
    }

    async fn terminate(&self, child: &mut Child, program: &str) {
        send_terminate(child);
        match tokio::time::timeout(self.grace, child.wait()).await {
            Ok(_) => tracing::debug!(program = program, "child exited after termination signal"),
            Err(_) => {
                tracing::warn!(
                    program = program,
                    grace_ms = self.grace.as_millis() as u64,
                    "child ignored termination signal, killing"
                );
                let _ = child.kill().await;
            }
        }
    }
}

#[cfg(unix)]
fn send_terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        // SAFETY: plain syscall on a pid we own; no memory is shared.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child) {
    let _ = child.start_kill();
}

fn check_status(program: &str, status: ExitStatus) -> Result<i32> {
    match status.code() {
        Some(0) => Ok(0),
        Some(code) => Err(ExecError::ExitCode {
            program: program.to_string(),
            code,
        }),
        None => Err(ExecError::ExitCode {
            program: program.to_string(),
            code: -1,
        }),
    }
}

fn capture<R>(mut pipe: R) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf).await;
        String::from_utf8_lossy(&buf).into_owned()
    })
}

async fn collect(reader: Option<JoinHandle<String>>) -> String {
    match reader {
        Some(handle) => drain_value(handle).await.unwrap_or_default(),
        None => String::new(),
    }
}

fn stream_lines<R>(pipe: R, program: String, stream: &'static str) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(pipe).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::info!(tool = %program, stream = stream, "{}", line);
        }
    })
}

/// Wait briefly for a reader; grandchildren may keep the pipe open.
async fn drain(reader: JoinHandle<()>) {
    drain_value(reader).await;
}

async fn drain_value<T>(mut reader: JoinHandle<T>) -> Option<T> {
    match tokio::time::timeout(READER_DRAIN_TIMEOUT, &mut reader).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(_)) => None,
        Err(_) => {
            reader.abort();
            None
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn runner() -> CommandRunner {
        CommandRunner::new(CancellationToken::new())
    }

    #[tokio::test]
    async fn test_run_captures_output() {
        let spec = CommandSpec::new("sh").args(["-c", "echo out; echo err >&2"]);
        let output = runner().run(&spec).await.unwrap();
        assert_eq!(output.exit_code, 0);
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_error() {
        let spec = CommandSpec::new("sh").args(["-c", "exit 3"]);
        let err = runner().run(&spec).await.unwrap_err();
        assert!(matches!(err, ExecError::ExitCode { code: 3, .. }));
    }

    #[tokio::test]
    async fn test_env_overlay_and_workdir() {
        let dir = tempfile::TempDir::new().unwrap();
        let spec = CommandSpec::new("sh")
            .args(["-c", "echo \"$GREETING\"; pwd"])
            .env("GREETING", "hi")
            .workdir(dir.path());
        let output = runner().run(&spec).await.unwrap();
        let mut lines = output.stdout.lines();
        assert_eq!(lines.next(), Some("hi"));
        let pwd = std::fs::canonicalize(lines.next().unwrap()).unwrap();
        assert_eq!(pwd, std::fs::canonicalize(dir.path()).unwrap());
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let spec = CommandSpec::new("/definitely/not/a/binary");
        let err = runner().run(&spec).await.unwrap_err();
        assert!(matches!(err, ExecError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_already_cancelled_does_not_spawn() {
        let token = CancellationToken::new();
        token.cancel();
        let err = CommandRunner::new(token)
            .run(&CommandSpec::new("true"))
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancel_terminates_cooperative_child() {
        let token = CancellationToken::new();
        let runner = CommandRunner::new(token.clone()).with_grace_period(Duration::from_secs(5));
        let spec = CommandSpec::new("sleep").arg("30");

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            token.cancel();
        });

        let started = std::time::Instant::now();
        let err = runner.run(&spec).await.unwrap_err();
        canceller.await.unwrap();

        assert!(err.is_cancelled());
        // SIGTERM ends `sleep` immediately, well before the grace period.
        assert!(started.elapsed() < Duration::from_secs(3));
    }
}
