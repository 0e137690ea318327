//! Supervised child processes.
//!
//! A [`Supervised`] child is spawned into its own process group and is
//! killed (group and all) when it is dropped without having been waited to
//! completion. This covers early returns, panics unwinding through the
//! caller, timeouts, and cancellation: the build tool never outlives the run
//! that started it.

use std::io::{self, Read, Seek, SeekFrom};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, warn};
use wait_timeout::ChildExt;

/// How often a waiting child is checked for cancellation.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Shared flag used to abandon a run from another thread (e.g. Ctrl-C).
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// A fresh, un-cancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Every clone observes it.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Why waiting on a supervised child did not produce an exit status.
#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    /// The deadline passed; the child has been killed.
    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    /// The cancel token fired; the child has been killed.
    #[error("cancelled")]
    Cancelled,

    /// Waiting itself failed.
    #[error("failed to wait for child: {0}")]
    Io(#[from] io::Error),
}

/// A child process that is terminated on drop unless it already exited.
#[derive(Debug)]
pub struct Supervised {
    child: Option<Child>,
}

impl Supervised {
    /// Spawn `cmd` in a new process group.
    ///
    /// # Errors
    ///
    /// Returns the spawn error unchanged (e.g. `NotFound` for a missing
    /// program).
    pub fn spawn(cmd: &mut Command) -> io::Result<Self> {
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        let child = cmd.spawn()?;
        debug!(pid = child.id(), "spawned supervised child");
        Ok(Self { child: Some(child) })
    }

    /// OS process id.
    pub fn id(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    /// Wait for the child to exit, honoring an optional timeout and the
    /// cancel token.
    ///
    /// # Errors
    ///
    /// Returns [`WaitError::TimedOut`] or [`WaitError::Cancelled`] after
    /// killing the child, or [`WaitError::Io`] if the OS wait call fails.
    pub fn wait(
        mut self,
        timeout: Option<Duration>,
        cancel: &CancelToken,
    ) -> Result<ExitStatus, WaitError> {
        let started = Instant::now();
        let deadline = timeout.map(|t| started + t);

        loop {
            if cancel.is_cancelled() {
                self.terminate();
                return Err(WaitError::Cancelled);
            }

            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        self.terminate();
                        return Err(WaitError::TimedOut(started.elapsed()));
                    }
                    POLL_INTERVAL.min(deadline - now)
                }
                None => POLL_INTERVAL,
            };

            let Some(child) = self.child.as_mut() else {
                return Err(WaitError::Io(io::Error::other("child already reaped")));
            };
            if let Some(status) = child.wait_timeout(slice)? {
                self.child = None;
                return Ok(status);
            }
        }
    }

    /// Kill the child's process group, then the child, and reap it.
    fn terminate(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };

        #[cfg(unix)]
        kill_group(child.id());

        if let Err(e) = child.kill() {
            // Already exited between the last poll and now.
            debug!(error = %e, "kill on supervised child failed");
        }
        if let Err(e) = child.wait() {
            warn!(error = %e, "failed to reap supervised child");
        }
    }
}

impl Drop for Supervised {
    fn drop(&mut self) {
        if self.child.is_some() {
            warn!(pid = ?self.id(), "terminating unfinished child process");
            self.terminate();
        }
    }
}

/// Why [`run_captured`] produced no exit status.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    /// The program could not be started.
    #[error("failed to start: {0}")]
    Spawn(#[source] io::Error),

    /// Waiting failed, timed out, or was cancelled.
    #[error(transparent)]
    Wait(#[from] WaitError),

    /// The captured output could not be read back.
    #[error("failed to read output: {0}")]
    Output(#[source] io::Error),
}

/// Run `cmd` under supervision and return its status with stdout and stderr
/// interleaved.
///
/// Output goes through an anonymous temporary file, not pipes, so the child
/// never blocks on a full pipe buffer.
///
/// # Errors
///
/// See [`CaptureError`].
pub fn run_captured(
    cmd: &mut Command,
    timeout: Option<Duration>,
    cancel: &CancelToken,
) -> Result<(ExitStatus, String), CaptureError> {
    let mut output = tempfile::tempfile().map_err(CaptureError::Output)?;
    let stdout = output.try_clone().map_err(CaptureError::Output)?;
    let stderr = output.try_clone().map_err(CaptureError::Output)?;
    cmd.stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr));

    let child = Supervised::spawn(cmd).map_err(CaptureError::Spawn)?;
    let status = child.wait(timeout, cancel)?;

    output.seek(SeekFrom::Start(0)).map_err(CaptureError::Output)?;
    let mut bytes = Vec::new();
    output.read_to_end(&mut bytes).map_err(CaptureError::Output)?;
    Ok((status, String::from_utf8_lossy(&bytes).into_owned()))
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn kill_group(pid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: kill(2) takes plain integers and does not touch memory. The
    // negative pid targets the process group created by `process_group(0)`,
    // whose id equals the leader's pid.
    let ret = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if ret != 0 {
        debug!(pgid, error = %io::Error::last_os_error(), "process group kill failed");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn test_wait_success() {
        let child = Supervised::spawn(&mut sh("exit 0")).unwrap();
        let status = child.wait(None, &CancelToken::new()).unwrap();
        assert!(status.success());
    }

    #[test]
    fn test_wait_reports_exit_code() {
        let child = Supervised::spawn(&mut sh("exit 7")).unwrap();
        let status = child.wait(None, &CancelToken::new()).unwrap();
        assert_eq!(status.code(), Some(7));
    }

    #[test]
    fn test_timeout_kills_child() {
        let child = Supervised::spawn(&mut sh("sleep 30")).unwrap();
        let started = Instant::now();
        let err = child
            .wait(Some(Duration::from_millis(200)), &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, WaitError::TimedOut(_)));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_cancel_kills_child() {
        let token = CancelToken::new();
        let child = Supervised::spawn(&mut sh("sleep 30")).unwrap();
        token.cancel();
        let err = child.wait(None, &token).unwrap_err();
        assert!(matches!(err, WaitError::Cancelled));
    }

    #[test]
    fn test_run_captured_interleaves_output() {
        let (status, output) = run_captured(
            &mut sh("echo out; echo err >&2; exit 2"),
            None,
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(status.code(), Some(2));
        assert_eq!(output, "out\nerr\n");
    }

    #[test]
    fn test_run_captured_missing_program() {
        let err = run_captured(
            &mut Command::new("/nonexistent/program"),
            None,
            &CancelToken::new(),
        )
        .unwrap_err();
        assert!(matches!(err, CaptureError::Spawn(e) if e.kind() == io::ErrorKind::NotFound));
    }

    #[test]
    fn test_drop_kills_process_group() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker");
        let script = format!("(sleep 1; touch {}) & wait", marker.display());
        let child = Supervised::spawn(&mut sh(&script)).unwrap();
        drop(child);
        std::thread::sleep(Duration::from_millis(1500));
        assert!(!marker.exists(), "grandchild survived the group kill");
    }
}
