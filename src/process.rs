//! Timeout-bounded child processes.
//!
//! Every long-running child (test runners, command agents) goes through
//! [`run_with_timeout`]:
//!
//! - the child leads a fresh process group, so a timeout can kill everything
//!   it spawned rather than just the shell;
//! - stdout and stderr are drained on their own threads into buffers that
//!   keep the last [`CAPTURE_LIMIT`] bytes, so a chatty child never blocks
//!   on a full pipe and runner summaries survive;
//! - the group is sent `SIGKILL` only while its leader is still unreaped
//!   (a zombie pins the group id), then the leader is reaped.

use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

/// Bytes captured per stream; earlier output is discarded.
pub const CAPTURE_LIMIT: usize = 8 * 1024 * 1024;

/// Bytes of each stream kept in reports and records.
pub const LOG_LIMIT: usize = 64 * 1024;

/// How often a running child is polled.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// How long to wait for the pipes to close once the child is gone. A
/// grandchild that escaped the process group can hold them open forever.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Captured result of one child process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandRun {
    /// Exit code, or `None` if the child was killed by a signal.
    pub exit_code: Option<i32>,
    /// Captured stdout (lossy UTF-8, last [`CAPTURE_LIMIT`] bytes).
    pub stdout: String,
    /// Captured stderr (lossy UTF-8, last [`CAPTURE_LIMIT`] bytes).
    pub stderr: String,
    /// Wall-clock time from spawn to reap.
    pub duration: Duration,
    /// The child exceeded its budget and was killed.
    pub timed_out: bool,
}

impl CommandRun {
    /// Exited with status 0.
    #[must_use]
    pub const fn success(&self) -> bool {
        matches!(self.exit_code, Some(0))
    }

    /// Duration in whole milliseconds.
    #[must_use]
    pub fn duration_ms(&self) -> u64 {
        u64::try_from(self.duration.as_millis()).unwrap_or(u64::MAX)
    }
}

/// A `sh -c <command>` invocation rooted at `cwd`.
#[must_use]
pub fn shell(command: &str, cwd: &Path) -> Command {
    let mut cmd = Command::new("sh");
    cmd.args(["-c", command]).current_dir(cwd);
    cmd
}

/// Spawn `cmd` in its own process group and wait at most `timeout`.
///
/// Stdin is closed; stdout and stderr are captured.
///
/// # Errors
/// Returns an I/O error if the child cannot be spawned or waited on. A
/// non-zero exit or a timeout is reported in the [`CommandRun`], not as an
/// error.
pub fn run_with_timeout(mut cmd: Command, timeout: Duration) -> std::io::Result<CommandRun> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt as _;
        cmd.process_group(0);
    }

    let start = Instant::now();
    let mut child = cmd.spawn()?;
    let stdout = child.stdout.take().map(drain);
    let stderr = child.stderr.take().map(drain);

    let waited = wait_with_deadline(&mut child, start + timeout);
    if waited.is_err() {
        // Not reaped yet, so the group id is still ours.
        kill_process_group(child.id());
        let _ = child.kill();
        let _ = child.wait();
    }
    let (status, timed_out) = waited?;
    let exit_code = if timed_out { None } else { status.code() };

    let stdout = stdout.map(collect).unwrap_or_default();
    let mut stderr = stderr.map(collect).unwrap_or_default();
    if timed_out {
        if !stderr.is_empty() && !stderr.ends_with('\n') {
            stderr.push('\n');
        }
        stderr.push_str(&format!("killed by timeout after {}s", timeout.as_secs()));
    }

    Ok(CommandRun {
        exit_code,
        stdout,
        stderr,
        duration: start.elapsed(),
        timed_out,
    })
}

/// Wait for `child` until `deadline`, then tear its group down and reap it.
///
/// Whatever the child left running in its group goes with it, on a normal
/// exit as well as on timeout. The kill always precedes the reap: until the
/// leader is reaped its pid cannot be recycled, so the signal can never
/// reach an unrelated group.
fn wait_with_deadline(child: &mut Child, deadline: Instant) -> std::io::Result<(ExitStatus, bool)> {
    loop {
        if has_exited(child)? {
            if LEADER_PINNED_UNTIL_REAPED {
                kill_process_group(child.id());
            }
            return Ok((child.wait()?, false));
        }
        if Instant::now() >= deadline {
            kill_process_group(child.id());
            let _ = child.kill();
            let status = child.wait()?;
            return Ok((status, true));
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Whether [`has_exited`] leaves the exited leader unreaped.
const LEADER_PINNED_UNTIL_REAPED: bool = cfg!(target_os = "linux");

/// Whether the child has exited, without reaping it where the platform
/// allows (`waitid` with `WNOWAIT`).
#[cfg(target_os = "linux")]
fn has_exited(child: &Child) -> std::io::Result<bool> {
    use nix::sys::wait::{Id, WaitPidFlag, WaitStatus, waitid};
    use nix::unistd::Pid;

    let pid = Pid::from_raw(i32::try_from(child.id()).map_err(std::io::Error::other)?);
    let flags = WaitPidFlag::WEXITED | WaitPidFlag::WNOHANG | WaitPidFlag::WNOWAIT;
    match waitid(Id::Pid(pid), flags) {
        Ok(WaitStatus::StillAlive) => Ok(false),
        Ok(_) => Ok(true),
        Err(errno) => Err(errno.into()),
    }
}

/// Whether the child has exited. Reaps it, so the group is left alone.
#[cfg(not(target_os = "linux"))]
fn has_exited(child: &mut Child) -> std::io::Result<bool> {
    Ok(child.try_wait()?.is_some())
}

/// Send `SIGKILL` to the process group led by `pgid`. An already empty
/// group is not an error.
fn kill_process_group(pgid: u32) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        if let Ok(raw) = i32::try_from(pgid)
            && let Err(errno) = killpg(Pid::from_raw(raw), Signal::SIGKILL)
            && errno != nix::errno::Errno::ESRCH
        {
            tracing::debug!(pgid, %errno, "killpg failed");
        }
    }
    #[cfg(not(unix))]
    let _ = pgid;
}

fn drain<R: Read + Send + 'static>(reader: R) -> mpsc::Receiver<(Vec<u8>, usize)> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let captured = read_tail(reader, CAPTURE_LIMIT).unwrap_or_default();
        let _ = tx.send(captured);
    });
    rx
}

fn collect(rx: mpsc::Receiver<(Vec<u8>, usize)>) -> String {
    match rx.recv_timeout(DRAIN_GRACE) {
        Ok((bytes, 0)) => String::from_utf8_lossy(&bytes).into_owned(),
        Ok((bytes, dropped)) => format!(
            "[... {dropped} bytes truncated ...]\n{}",
            String::from_utf8_lossy(&bytes)
        ),
        Err(_) => "[... output unavailable: pipe held open by a detached process ...]\n".to_owned(),
    }
}

/// Read `reader` to the end keeping only its last `cap` bytes. Returns the
/// kept bytes and how many were dropped from the front.
fn read_tail<R: Read>(mut reader: R, cap: usize) -> std::io::Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    let mut dropped = 0;
    loop {
        let n = reader.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        // Compact in batches so the front is not shifted on every read.
        if buf.len() >= cap.saturating_mul(2).max(cap + chunk.len()) {
            let excess = buf.len() - cap;
            buf.drain(..excess);
            dropped += excess;
        }
    }
    if buf.len() > cap {
        let excess = buf.len() - cap;
        buf.drain(..excess);
        dropped += excess;
    }
    Ok((buf, dropped))
}

/// Keep the last `limit` bytes of `log`, marking what was dropped.
///
/// Runners print their summaries last, so the tail is the useful part.
#[must_use]
pub fn truncate_log(log: &str, limit: usize) -> String {
    if log.len() <= limit {
        return log.to_owned();
    }
    let mut start = log.len() - limit;
    while !log.is_char_boundary(start) {
        start += 1;
    }
    format!("[... {start} bytes truncated ...]\n{}", &log[start..])
}
