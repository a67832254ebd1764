//! Bounded execution of external commands.
//!
//! Every command runs in its own process group with stdout and stderr
//! sharing one pipe, so the captured output keeps the order in which the
//! command wrote it. When a deadline is set and passes, the whole group is
//! killed and reaped before [`VolumeError::Timeout`] is returned.

use super::constants::KILL_GRACE;
use super::error::{VolumeError, VolumeResult};
use async_trait::async_trait;
use log::{debug, warn};
use nix::fcntl::OFlag;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{pipe2, Pid};
use std::os::fd::{FromRawFd, OwnedFd};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};

/// Runs an external command and returns its combined output.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs `program` with `args`, bounded by `timeout` when one is given.
    ///
    /// # Errors
    ///
    /// * [`VolumeError::Timeout`] if the deadline passed first. No output is returned.
    /// * [`VolumeError::ProcessFailure`] if the command could not start or exited non-zero.
    async fn run(
        &self,
        program: &Path,
        args: &[String],
        timeout: Option<Duration>,
    ) -> VolumeResult<Vec<u8>>;
}

/// [`CommandRunner`] backed by real OS processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    /// Creates a new runner.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(
        &self,
        program: &Path,
        args: &[String],
        timeout: Option<Duration>,
    ) -> VolumeResult<Vec<u8>> {
        let command_line = render_command(program, args);
        debug!("Running `{}` (timeout: {:?})", command_line, timeout);

        let (read_end, write_end) = output_pipe()?;
        let stderr_end = write_end.try_clone()?;

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(write_end))
            .stderr(Stdio::from(stderr_end))
            .process_group(0)
            .kill_on_drop(true);

        let spawned = command.spawn();
        // The command keeps our copies of the write end open until dropped.
        drop(command);
        let mut child = match spawned {
            Ok(child) => child,
            Err(err) => {
                return Err(VolumeError::ProcessFailure {
                    command: command_line,
                    status: format!("failed to start: {}", err),
                    output: String::new(),
                })
            }
        };
        // The child leads its own group. Its pid stays the group id even after
        // the child itself has exited and `child.id()` has gone back to `None`.
        let pgid = child.id().map(|pid| Pid::from_raw(pid as i32));

        let mut reader = tokio::fs::File::from_std(std::fs::File::from(read_end));
        let mut output = Vec::new();
        let completion = async {
            let (read, status) = tokio::join!(reader.read_to_end(&mut output), child.wait());
            read.and(status)
        };

        let finished = match timeout {
            Some(limit) => tokio::time::timeout(limit, completion).await.ok(),
            None => Some(completion.await),
        };

        let status = match finished {
            Some(status) => status?,
            None => {
                warn!("`{}` exceeded {:?}, killing it", command_line, timeout);
                terminate(&mut child, pgid).await;
                return Err(VolumeError::Timeout {
                    command: command_line,
                    timeout: timeout.unwrap_or_default(),
                });
            }
        };

        if !status.success() {
            return Err(VolumeError::ProcessFailure {
                command: command_line,
                status: status.to_string(),
                output: String::from_utf8_lossy(&output).into_owned(),
            });
        }

        Ok(output)
    }
}

/// Kills the child's process group and waits for the child to exit.
async fn terminate(child: &mut Child, pgid: Option<Pid>) {
    let group_killed = match pgid {
        Some(pgid) => match killpg(pgid, Signal::SIGKILL) {
            Ok(()) => true,
            Err(err) => {
                warn!("Failed to kill process group {}: {}", pgid, err);
                false
            }
        },
        None => false,
    };
    if !group_killed {
        if let Err(err) = child.start_kill() {
            warn!("Failed to kill timed out command: {}", err);
        }
    }

    match tokio::time::timeout(KILL_GRACE, child.wait()).await {
        Ok(Ok(status)) => debug!("Timed out command reaped: {}", status),
        Ok(Err(err)) => warn!("Failed to reap timed out command: {}", err),
        Err(_) => warn!("Timed out command still running after {:?}", KILL_GRACE),
    }
}

fn output_pipe() -> VolumeResult<(OwnedFd, OwnedFd)> {
    let (read_fd, write_fd) = pipe2(OFlag::O_CLOEXEC).map_err(std::io::Error::from)?;
    // SAFETY: pipe2 just returned these descriptors and nothing else owns them.
    let fds = unsafe { (OwnedFd::from_raw_fd(read_fd), OwnedFd::from_raw_fd(write_fd)) };
    Ok(fds)
}

/// Formats a command line for logs and error messages.
pub fn render_command(program: &Path, args: &[String]) -> String {
    let mut line = program.display().to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::error::ErrorKind;
    use std::time::Instant;

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn test_captures_stdout_and_stderr() {
        let output = ProcessRunner::new()
            .run(Path::new("/bin/sh"), &sh("echo out; echo err 1>&2"), None)
            .await
            .unwrap();

        let text = String::from_utf8(output).unwrap();
        assert_eq!(text, "out\nerr\n");
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_process_failure() {
        let err = ProcessRunner::new()
            .run(
                Path::new("/bin/sh"),
                &sh("echo boom; exit 3"),
                Some(Duration::from_secs(10)),
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ProcessFailure);
        match err {
            VolumeError::ProcessFailure { status, output, .. } => {
                assert!(status.contains('3'));
                assert_eq!(output, "boom\n");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_program_is_process_failure() {
        let err = ProcessRunner::new()
            .run(Path::new("/nonexistent/imgvol-tool"), &[], None)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ProcessFailure);
    }

    #[tokio::test]
    async fn test_timeout_kills_command() {
        let started = Instant::now();
        let err = ProcessRunner::new()
            .run(
                Path::new("/bin/sh"),
                &sh("echo partial; sleep 30"),
                Some(Duration::from_millis(200)),
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    fn is_running(pid: i32) -> bool {
        // Killed processes may linger as zombies until their new parent reaps them.
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => stat
                .rsplit(')')
                .next()
                .and_then(|rest| rest.split_whitespace().next())
                .map_or(false, |state| state != "Z" && state != "X"),
            Err(_) => false,
        }
    }

    #[tokio::test]
    async fn test_timeout_kills_background_children() {
        let temp_dir = tempfile::tempdir().unwrap();
        let pid_file = temp_dir.path().join("helper.pid");
        let script = format!("sleep 41 & echo $! > {}; exit 0", pid_file.display());

        let err = ProcessRunner::new()
            .run(
                Path::new("/bin/sh"),
                &sh(&script),
                Some(Duration::from_millis(500)),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);

        let pid: i32 = std::fs::read_to_string(&pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while is_running(pid) && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!is_running(pid), "helper {} outlived the timeout", pid);
    }

    #[tokio::test]
    async fn test_fast_command_within_timeout() {
        let output = ProcessRunner::new()
            .run(
                Path::new("/bin/sh"),
                &sh("printf '  /var/lib/containers/root  '"),
                Some(Duration::from_secs(10)),
            )
            .await
            .unwrap();

        assert_eq!(output, b"  /var/lib/containers/root  ");
    }

    #[test]
    fn test_render_command() {
        let args = vec!["delete".to_string(), "vol-1".to_string()];
        assert_eq!(
            render_command(Path::new("/bin/buildah"), &args),
            "/bin/buildah delete vol-1"
        );
    }
}
