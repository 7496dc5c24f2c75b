//! Runs external tool commands through a shell with a hard timeout.

use std::process::Stdio;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::process::Command as TokioCommand;

use crate::error::ProcessError;

/// Shell used when the configuration does not name one.
pub const DEFAULT_SHELL: &str = "/bin/sh";

/// Captured result of a finished command.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code, or -1 when the process was killed by a signal.
    pub exit_code: i32,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

/// Spawns commands as `<shell> -c <command>`.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    shell: String,
}

impl ProcessRunner {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }

    pub fn shell(&self) -> &str {
        &self.shell
    }

    /// Runs `command` and waits at most `timeout` for it to exit.
    ///
    /// The command gets its own process group; on timeout the whole group
    /// is killed so that pipelines and forked helpers don't outlive it.
    /// A non-zero exit is an error that still carries the captured output.
    pub async fn run(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<ProcessOutput, ProcessError> {
        let started = Instant::now();

        let mut cmd = TokioCommand::new(&self.shell);
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd.spawn().map_err(|source| ProcessError::SpawnFailed {
            shell: self.shell.clone(),
            source,
        })?;
        let pid = child.id();

        log::debug!(
            "Spawned '{}' (pid {:?})",
            crate::sanitize::command_program(command),
            pid
        );

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(ProcessError::Io)?,
            Err(_) => {
                if let Some(pid) = pid {
                    kill_process_group(pid);
                }
                log::warn!(
                    "'{}' timed out after {:?}",
                    crate::sanitize::command_program(command),
                    timeout
                );
                return Err(ProcessError::Timeout(timeout));
            }
        };

        let result = ProcessOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
            duration: started.elapsed(),
        };

        if result.exit_code == 0 {
            Ok(result)
        } else {
            Err(ProcessError::NonZeroExit {
                code: result.exit_code,
                output: result,
            })
        }
    }

    /// Runs `command` to completion from synchronous code on a private
    /// current-thread runtime.
    pub fn run_blocking(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<ProcessOutput, ProcessError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(ProcessError::Runtime)?;
        runtime.block_on(self.run(command, timeout))
    }
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new(DEFAULT_SHELL)
    }
}

#[cfg(unix)]
fn kill_process_group(pid: u32) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        log::warn!("Failed to kill process group {}: {}", pid, e);
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) {
    // kill_on_drop takes care of the direct child.
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(10);

    #[tokio::test]
    async fn test_captures_streams_separately() {
        let output = ProcessRunner::default()
            .run("echo out; echo err >&2", TIMEOUT)
            .await
            .unwrap();
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
        assert_eq!(output.exit_code, 0);
    }

    #[tokio::test]
    async fn test_non_zero_exit_keeps_output() {
        let err = ProcessRunner::default()
            .run("echo partial; echo broken >&2; exit 3", TIMEOUT)
            .await
            .unwrap_err();
        match err {
            ProcessError::NonZeroExit { code, output } => {
                assert_eq!(code, 3);
                assert_eq!(output.stdout, "partial\n");
                assert_eq!(output.stderr, "broken\n");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_timeout() {
        let started = Instant::now();
        let err = ProcessRunner::default()
            .run("sleep 5", Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_missing_shell() {
        let err = ProcessRunner::new("/nonexistent/shell")
            .run("true", TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::SpawnFailed { .. }));
    }

    #[test]
    fn test_run_blocking() {
        let output = ProcessRunner::default()
            .run_blocking("printf '%s' \"$((2 + 3))\"", TIMEOUT)
            .unwrap();
        assert_eq!(output.stdout, "5");
    }
}
