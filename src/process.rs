use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;

use crate::error::{Result, ScanError};
use crate::logging::ScanLogger;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Runs an external prober to completion.
///
/// A non-zero exit yields [`ScanError::ProcessFailed`], an overrun yields
/// [`ScanError::Timeout`]. Implementations must not leave the process (or
/// anything it spawned) running once `run` returns.
///
/// With `elevated`, [`ProcessRunner`] runs `sudo -n <executable>`. The
/// process group then belongs to root and, unless the caller is root
/// itself, cannot be signalled; anything the prober leaves behind may
/// outlive the call. That case is logged as an error.
#[async_trait]
pub trait Runner: Send + Sync {
    async fn run(
        &self,
        executable: &Path,
        args: &[String],
        working_dir: &Path,
        timeout: Duration,
        elevated: bool,
    ) -> Result<ProcessOutput>;
}

// How long to wait for stdout/stderr to close once the process group is gone.
const PIPE_DRAIN: Duration = Duration::from_secs(2);

type PipeReader = JoinHandle<std::io::Result<Vec<u8>>>;

fn drain<R>(mut pipe: R) -> PipeReader
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        pipe.read_to_end(&mut buf).await?;
        Ok(buf)
    })
}

#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    logger: ScanLogger,
}

impl ProcessRunner {
    pub fn new(logger: ScanLogger) -> Self {
        Self {
            logger: logger.scoped("grabscan::process"),
        }
    }

    fn command(executable: &Path, args: &[String], working_dir: &Path, elevated: bool) -> Command {
        let mut std_cmd = if elevated {
            let mut sudo = std::process::Command::new("sudo");
            sudo.arg("-n").arg(executable);
            sudo
        } else {
            std::process::Command::new(executable)
        };
        // Own process group so the whole tree can be killed at once.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            std_cmd.process_group(0);
        }

        let mut cmd = Command::from(std_cmd);
        cmd.args(args)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    #[cfg(unix)]
    fn kill_tree(&self, pid: Option<u32>) {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        let Some(pid) = pid else { return };
        self.report_group_kill(pid, killpg(Pid::from_raw(pid as i32), Signal::SIGKILL));
    }

    #[cfg(unix)]
    fn report_group_kill(&self, pid: u32, result: nix::Result<()>) {
        use nix::errno::Errno;

        match result {
            Ok(()) => {
                self.logger.trace(format_args!("[process] group_killed: pgid={}", pid));
            }
            Err(Errno::ESRCH) => {}
            Err(Errno::EPERM) => {
                self.logger.error(format_args!(
                    "[process] group_kill_denied: pgid={} children of an elevated process may still be running",
                    pid
                ));
            }
            Err(e) => {
                self.logger.debug(format_args!("[process] group_kill_failed: pgid={} error={}", pid, e));
            }
        }
    }

    #[cfg(not(unix))]
    fn kill_tree(&self, _pid: Option<u32>) {}

    async fn collect(&self, reader: Option<PipeReader>, stream: &str) -> String {
        let Some(mut reader) = reader else {
            return String::new();
        };
        match tokio::time::timeout(PIPE_DRAIN, &mut reader).await {
            Ok(Ok(Ok(buf))) => String::from_utf8_lossy(&buf).into_owned(),
            Ok(Ok(Err(e))) => {
                self.logger.debug(format_args!("[process] read_failed: stream={} error={}", stream, e));
                String::new()
            }
            Ok(Err(e)) => {
                self.logger.debug(format_args!("[process] reader_failed: stream={} error={}", stream, e));
                String::new()
            }
            Err(_) => {
                reader.abort();
                self.logger.warn(format_args!(
                    "[process] pipe_still_open: stream={} after={}ms",
                    stream,
                    PIPE_DRAIN.as_millis()
                ));
                String::new()
            }
        }
    }
}

#[async_trait]
impl Runner for ProcessRunner {
    async fn run(
        &self,
        executable: &Path,
        args: &[String],
        working_dir: &Path,
        timeout: Duration,
        elevated: bool,
    ) -> Result<ProcessOutput> {
        let mut cmd = Self::command(executable, args, working_dir, elevated);
        self.logger.debug(format_args!(
            "[process] spawning: executable={} elevated={} timeout={}s cwd={} args={:?}",
            executable.display(),
            elevated,
            timeout.as_secs(),
            working_dir.display(),
            args
        ));

        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|source| ScanError::Spawn {
            executable: executable.display().to_string(),
            source,
        })?;
        let pid = child.id();
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        // Only the exit is timed: descendants may keep the pipes open long
        // after the prober itself is done.
        let waited = tokio::time::timeout(timeout, child.wait()).await;
        self.kill_tree(pid);
        let elapsed = started.elapsed();

        let status = match waited {
            Err(_) => {
                if let Err(e) = child.kill().await {
                    self.logger.debug(format_args!("[process] kill_failed: pid={:?} error={}", pid, e));
                }
                for reader in stdout.iter().chain(stderr.iter()) {
                    reader.abort();
                }
                self.logger.error(format_args!(
                    "[process] timed_out: executable={} pid={:?} after={}ms",
                    executable.display(),
                    pid,
                    elapsed.as_millis()
                ));
                return Err(ScanError::Timeout(timeout));
            }
            Ok(result) => result?,
        };

        let stdout = self.collect(stdout, "stdout").await;
        let stderr = self.collect(stderr, "stderr").await;
        if !stdout.is_empty() {
            self.logger.trace(format_args!("[process] stdout: {}", stdout.trim_end()));
        }
        if !stderr.is_empty() {
            self.logger.trace(format_args!("[process] stderr: {}", stderr.trim_end()));
        }

        match status.code() {
            Some(0) => {
                self.logger.debug(format_args!(
                    "[process] completed: executable={} duration={}ms",
                    executable.display(),
                    elapsed.as_millis()
                ));
                Ok(ProcessOutput {
                    exit_code: 0,
                    stdout,
                    stderr,
                })
            }
            code => {
                self.logger.error(format_args!(
                    "[process] failed: executable={} status={} duration={}ms stderr={}",
                    executable.display(),
                    status,
                    elapsed.as_millis(),
                    stderr.trim()
                ));
                Err(ScanError::ProcessFailed {
                    exit_code: code,
                    stderr,
                })
            }
        }
    }
}
