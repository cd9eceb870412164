//! Subprocess plumbing shared by the CLI-driven collaborators.
//!
//! Output lines are forwarded to the job's [`LogSink`] as they are
//! produced. Cancelling the token kills the child immediately.

use std::ffi::OsStr;
use std::path::Path;
use std::process::Stdio;

use depot_core::build::{LogSink, LogStream};
use depot_core::{Error, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// One external command invocation.
pub struct Process {
    command: Command,
    command_line: String,
    stdin: Option<String>,
    capture_stdout: bool,
}

impl Process {
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        let command_line = program.as_ref().to_string_lossy().into_owned();
        Self {
            command: Command::new(program),
            command_line,
            stdin: None,
            capture_stdout: false,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.command_line.push(' ');
        self.command_line.push_str(&arg.as_ref().to_string_lossy());
        self.command.arg(arg);
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        for arg in args {
            self = self.arg(arg);
        }
        self
    }

    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.command.current_dir(dir);
        self
    }

    /// Feed `input` on stdin. Never shown in logs.
    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Return stdout instead of logging it. Stderr is still logged.
    pub fn capture_stdout(mut self) -> Self {
        self.capture_stdout = true;
        self
    }

    /// The command line as echoed to the build log.
    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    /// Run to completion. Returns captured stdout (empty unless
    /// [`capture_stdout`](Self::capture_stdout) was set).
    ///
    /// Fails with `Error::Cancelled` if the token fires, after the child
    /// has been killed, and with `Error::ExecutionFailed` on a non-zero exit.
    pub async fn run(self, cancel: &CancellationToken, logs: &dyn LogSink) -> Result<String> {
        let Process {
            mut command,
            command_line,
            stdin,
            capture_stdout,
        } = self;

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        logs.system(format!("$ {}", command_line)).await;
        debug!(command = %command_line, "Spawning process");

        let mut child = command
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::ExecutionFailed(format!("failed to start `{}`: {}", command_line, e))
            })?;

        if let Some(input) = stdin {
            let mut pipe = child
                .stdin
                .take()
                .ok_or_else(|| Error::Internal("child stdin not captured".to_string()))?;
            pipe.write_all(input.as_bytes())
                .await
                .map_err(|e| Error::ExecutionFailed(format!("writing stdin: {}", e)))?;
            drop(pipe);
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Internal("child stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Internal("child stderr not captured".to_string()))?;

        let mut stdout_reader = BufReader::new(stdout).lines();
        let mut stderr_reader = BufReader::new(stderr).lines();
        let mut stdout_open = true;
        let mut stderr_open = true;
        let mut captured = String::new();
        let mut last_stderr: Option<String> = None;

        while stdout_open || stderr_open {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(kill(child, &command_line).await);
                }
                line = stdout_reader.next_line(), if stdout_open => {
                    match line {
                        Ok(Some(line)) if capture_stdout => {
                            captured.push_str(&line);
                            captured.push('\n');
                        }
                        Ok(Some(line)) => logs.emit(LogStream::Stdout, line).await,
                        Ok(None) => stdout_open = false,
                        Err(e) => {
                            warn!(error = %e, "Error reading stdout");
                            stdout_open = false;
                        }
                    }
                }
                line = stderr_reader.next_line(), if stderr_open => {
                    match line {
                        Ok(Some(line)) => {
                            if !line.trim().is_empty() {
                                last_stderr = Some(line.clone());
                            }
                            logs.emit(LogStream::Stderr, line).await;
                        }
                        Ok(None) => stderr_open = false,
                        Err(e) => {
                            warn!(error = %e, "Error reading stderr");
                            stderr_open = false;
                        }
                    }
                }
            }
        }

        let waited = tokio::select! {
            _ = cancel.cancelled() => None,
            status = child.wait() => Some(status),
        };
        let status = match waited {
            Some(status) => status.map_err(|e| {
                Error::ExecutionFailed(format!("waiting for `{}`: {}", command_line, e))
            })?,
            None => return Err(kill(child, &command_line).await),
        };

        if !status.success() {
            let program = command_line.split(' ').next().unwrap_or(&command_line);
            let mut message = format!("{} exited with {}", program, status);
            if let Some(line) = last_stderr {
                message.push_str(": ");
                message.push_str(&line);
            }
            return Err(Error::ExecutionFailed(message));
        }

        Ok(captured)
    }
}

async fn kill(mut child: Child, command_line: &str) -> Error {
    if let Err(e) = child.kill().await {
        warn!(command = %command_line, error = %e, "Failed to kill process");
    } else {
        debug!(command = %command_line, "Killed process");
    }
    Error::Cancelled
}
