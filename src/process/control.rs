//! Signal-based process control for standalone instances.

use std::time::{Duration, Instant};

use crate::error::{AppError, Result};

/// Check if a process is alive by PID. Zombies count as exited.
#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    if pid == 0 || kill(Pid::from_raw(pid as i32), None).is_err() {
        return false;
    }
    !is_zombie(pid)
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    std::fs::read_to_string(format!("/proc/{}/stat", pid))
        .ok()
        .and_then(|stat| {
            stat.rsplit_once(')')
                .and_then(|(_, rest)| rest.trim_start().chars().next())
        })
        .is_some_and(|state| state == 'Z')
}

#[cfg(all(unix, not(target_os = "linux")))]
fn is_zombie(_pid: u32) -> bool {
    false
}

#[cfg(not(unix))]
pub fn is_process_alive(_pid: u32) -> bool {
    false
}

/// Send SIGTERM to the process group led by `pid`, falling back to the
/// process itself.
#[cfg(unix)]
pub(super) fn graceful_signal(pid: u32) -> Result<()> {
    use nix::sys::signal::{kill, killpg, Signal};
    use nix::unistd::{getpgid, Pid};

    let target = Pid::from_raw(pid as i32);
    let sent = match getpgid(Some(target)) {
        Ok(pgid) if pgid == target => killpg(pgid, Signal::SIGTERM),
        _ => kill(target, Signal::SIGTERM),
    };
    sent.map_err(|e| AppError::supervision(format!("Failed to send SIGTERM to PID {}: {}", pid, e)))
}

#[cfg(not(unix))]
pub(super) fn graceful_signal(pid: u32) -> Result<()> {
    Err(AppError::supervision(format!(
        "Signals are not supported on this platform (PID {})",
        pid
    )))
}

#[cfg(unix)]
pub fn force_kill(pid: u32) -> Result<()> {
    use nix::sys::signal::{kill, killpg, Signal};
    use nix::unistd::{getpgid, Pid};

    let target = Pid::from_raw(pid as i32);
    match getpgid(Some(target)) {
        Ok(pgid) => killpg(pgid, Signal::SIGKILL).map_err(|e| {
            AppError::supervision(format!(
                "Failed to kill process group {} (from pid {}): {}",
                pgid.as_raw(),
                pid,
                e
            ))
        }),
        Err(e) => kill(target, Signal::SIGKILL).map_err(|kill_err| {
            AppError::supervision(format!(
                "Failed to kill process {} (getpgid failed: {}): {}",
                pid, e, kill_err
            ))
        }),
    }
}

#[cfg(not(unix))]
pub fn force_kill(pid: u32) -> Result<()> {
    Err(AppError::supervision(format!(
        "Signals are not supported on this platform (PID {})",
        pid
    )))
}

/// SIGTERM `pid`, wait up to `timeout` for it to exit, then SIGKILL.
///
/// Returns `true` when the process exited on its own.
pub async fn graceful_shutdown(pid: u32, timeout: Duration) -> Result<bool> {
    if !is_process_alive(pid) {
        return Ok(true);
    }

    if let Err(e) = graceful_signal(pid) {
        log::warn!("Graceful signal failed for PID {pid}: {e}, will force kill immediately");
        force_kill(pid)?;
        return Ok(false);
    }

    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if !is_process_alive(pid) {
            return Ok(true);
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    if is_process_alive(pid) {
        log::warn!(
            "PID {pid} did not exit within {}s, force killing",
            timeout.as_secs()
        );
        force_kill(pid)?;
        return Ok(false);
    }
    Ok(true)
}
