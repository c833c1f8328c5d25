//! Snapshot diff process - wraps `btrfs send` (or a compatible tool)
//!
//! Stdout is read with a bounded wait so the transfer loop can interleave
//! reads with publishing and liveness checks instead of blocking on the pipe.

use bytes::Bytes;
use std::ffi::OsString;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::error::{ReplError, Result};

/// Default read size per stream iteration (1MB)
pub const DIFF_CHUNK_SIZE: usize = 1024 * 1024;

/// Default bound on a single stdout read
pub const READ_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Invocation of the snapshot diff tool.
///
/// Full: `<program> send <current>`
/// Incremental: `<program> send -p <parent> <current>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffCommand {
    program: PathBuf,
    current: PathBuf,
    parent: Option<PathBuf>,
}

impl DiffCommand {
    pub fn full(program: impl Into<PathBuf>, current: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            current: current.into(),
            parent: None,
        }
    }

    pub fn incremental(
        program: impl Into<PathBuf>,
        parent: impl Into<PathBuf>,
        current: impl Into<PathBuf>,
    ) -> Self {
        Self {
            program: program.into(),
            current: current.into(),
            parent: Some(parent.into()),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn parent(&self) -> Option<&Path> {
        self.parent.as_deref()
    }

    pub fn is_incremental(&self) -> bool {
        self.parent.is_some()
    }

    pub fn args(&self) -> Vec<OsString> {
        let mut args = vec![OsString::from("send")];
        if let Some(parent) = &self.parent {
            args.push(OsString::from("-p"));
            args.push(parent.clone().into_os_string());
        }
        args.push(self.current.clone().into_os_string());
        args
    }

    /// Start the diff tool with piped stdout/stderr.
    ///
    /// The child is killed if the returned process is dropped.
    pub fn spawn(&self, chunk_size: usize, poll_interval: Duration) -> Result<DiffStreamProcess> {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.args());

        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| ReplError::Spawn {
            program: self.program.display().to_string(),
            source,
        })?;

        let stdout = child.stdout.take().ok_or_else(|| ReplError::Spawn {
            program: self.program.display().to_string(),
            source: io::Error::new(io::ErrorKind::BrokenPipe, "stdout not captured"),
        })?;

        Ok(DiffStreamProcess::from_child(
            child,
            Box::new(stdout),
            chunk_size,
            poll_interval,
        ))
    }
}

impl fmt::Display for DiffCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in self.args() {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Result of one bounded stdout read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    Data(Bytes),
    /// Nothing available within the poll interval
    WouldBlock,
    Eof,
}

/// Exit information captured once the diff tool finishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffExit {
    /// `None` when terminated by a signal
    pub code: Option<i32>,
    pub stderr: String,
}

impl DiffExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn describe(&self) -> String {
        let status = match self.code {
            Some(code) => format!("exit code {}", code),
            None => "terminated by signal".to_string(),
        };
        if self.stderr.is_empty() {
            status
        } else {
            format!("{}: {}", status, self.stderr)
        }
    }
}

/// A running diff tool whose stdout is the replication stream.
pub struct DiffStreamProcess {
    child: Child,
    stdout: Box<dyn AsyncRead + Send + Unpin>,
    stderr_task: Option<JoinHandle<String>>,
    exit: Option<ExitStatus>,
    eof: bool,
    buf: Vec<u8>,
    poll_interval: Duration,
}

impl DiffStreamProcess {
    /// Wrap a spawned child, reading the stream from `stdout`.
    ///
    /// Stderr, if piped, is collected in the background for [`finish`].
    ///
    /// [`finish`]: DiffStreamProcess::finish
    pub(crate) fn from_child(
        mut child: Child,
        stdout: Box<dyn AsyncRead + Send + Unpin>,
        chunk_size: usize,
        poll_interval: Duration,
    ) -> Self {
        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                // Diagnostics only; a read error just truncates them
                let _ = stderr.read_to_end(&mut buf).await;
                String::from_utf8_lossy(&buf).trim().to_string()
            })
        });

        Self {
            child,
            stdout,
            stderr_task,
            exit: None,
            eof: false,
            buf: vec![0u8; chunk_size.max(1)],
            poll_interval,
        }
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Poll the child without blocking. Caches the exit status once seen.
    pub fn is_alive(&mut self) -> io::Result<bool> {
        if self.exit.is_some() {
            return Ok(false);
        }
        match self.child.try_wait()? {
            Some(status) => {
                self.exit = Some(status);
                Ok(false)
            }
            None => Ok(true),
        }
    }

    /// Exit code, once the process has been observed to exit.
    ///
    /// `Some(None)` means it exited without a code (killed by a signal).
    pub fn exit_code(&self) -> Option<Option<i32>> {
        self.exit.map(|status| status.code())
    }

    /// True once stdout has reached end of file.
    pub fn is_drained(&self) -> bool {
        self.eof
    }

    /// Read whatever stdout has available, waiting at most the poll interval.
    pub async fn read_available(&mut self) -> io::Result<ReadOutcome> {
        if self.eof {
            if self.exit.is_none() {
                // Pipe closed but the process lingers; don't spin on it
                tokio::time::sleep(self.poll_interval).await;
            }
            return Ok(ReadOutcome::Eof);
        }

        match tokio::time::timeout(self.poll_interval, self.stdout.read(&mut self.buf)).await {
            Err(_) => Ok(ReadOutcome::WouldBlock),
            Ok(Ok(0)) => {
                self.eof = true;
                Ok(ReadOutcome::Eof)
            }
            Ok(Ok(n)) => Ok(ReadOutcome::Data(Bytes::copy_from_slice(&self.buf[..n]))),
            Ok(Err(e)) => Err(e),
        }
    }

    /// Collect exit code and stderr. Only meaningful after exit.
    pub async fn finish(&mut self) -> DiffExit {
        let stderr = match self.stderr_task.take() {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };
        DiffExit {
            code: self.exit.and_then(|status| status.code()),
            stderr,
        }
    }

    /// Kill the child if it is still running and reap it.
    pub async fn terminate(&mut self) -> io::Result<()> {
        if !self.is_alive()? {
            return Ok(());
        }
        self.child.start_kill()?;
        let status = self.child.wait().await?;
        self.exit = Some(status);
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    async fn drain(proc: &mut DiffStreamProcess) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            let alive = proc.is_alive().unwrap();
            match proc.read_available().await.unwrap() {
                ReadOutcome::Data(b) => out.extend_from_slice(&b),
                ReadOutcome::WouldBlock => {}
                ReadOutcome::Eof if !alive => break,
                ReadOutcome::Eof => {}
            }
        }
        out
    }

    #[test]
    fn test_full_args() {
        let cmd = DiffCommand::full("/sbin/btrfs", "/mnt2/p/s_snap2");
        assert_eq!(cmd.args(), vec!["send", "/mnt2/p/s_snap2"]);
        assert!(!cmd.is_incremental());
        assert_eq!(cmd.to_string(), "/sbin/btrfs send /mnt2/p/s_snap2");
    }

    #[test]
    fn test_incremental_args() {
        let cmd = DiffCommand::incremental("/sbin/btrfs", "/mnt2/p/s_snap1", "/mnt2/p/s_snap2");
        assert_eq!(
            cmd.args(),
            vec!["send", "-p", "/mnt2/p/s_snap1", "/mnt2/p/s_snap2"]
        );
        assert!(cmd.is_incremental());
        assert_eq!(cmd.parent(), Some(Path::new("/mnt2/p/s_snap1")));
    }

    #[tokio::test]
    async fn test_stream_stdout_until_exit() {
        // echo prints its arguments, which stand in for the diff stream
        let cmd = DiffCommand::full("echo", "/mnt2/p/s_snap");
        let mut proc = cmd.spawn(4, READ_POLL_INTERVAL).unwrap();

        let out = drain(&mut proc).await;
        assert_eq!(out, b"send /mnt2/p/s_snap\n");
        assert!(proc.is_drained());
        assert_eq!(proc.exit_code(), Some(Some(0)));
        assert!(proc.finish().await.success());
    }

    #[tokio::test]
    async fn test_nonzero_exit() {
        let cmd = DiffCommand::full("false", "/mnt2/p/s_snap");
        let mut proc = cmd.spawn(DIFF_CHUNK_SIZE, READ_POLL_INTERVAL).unwrap();

        let out = drain(&mut proc).await;
        assert!(out.is_empty());
        let exit = proc.finish().await;
        assert_eq!(exit.code, Some(1));
        assert!(!exit.success());
        assert!(exit.describe().starts_with("exit code 1"));
    }

    #[tokio::test]
    async fn test_missing_program() {
        let cmd = DiffCommand::full("/nonexistent/diff-tool", "/mnt2/p/s_snap");
        let err = cmd
            .spawn(DIFF_CHUNK_SIZE, READ_POLL_INTERVAL)
            .err()
            .unwrap();
        assert!(matches!(err, ReplError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_terminate_running_process() {
        // `yes send <path>` never exits on its own
        let cmd = DiffCommand::full("yes", "/mnt2/p/s_snap");
        let mut proc = cmd.spawn(DIFF_CHUNK_SIZE, READ_POLL_INTERVAL).unwrap();
        assert!(proc.is_alive().unwrap());

        proc.terminate().await.unwrap();
        assert!(!proc.is_alive().unwrap());
        assert_eq!(proc.exit_code(), Some(None));
    }
}
