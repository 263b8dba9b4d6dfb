//! Process liveness and termination by pid.

use std::time::Duration;

/// Whether a process with `pid` currently exists.
///
/// `kill(pid, 0)` delivers nothing but still performs the existence check;
/// `EPERM` means the process exists under another user.
#[cfg(unix)]
pub fn is_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    let result = unsafe { libc::kill(pid as i32, 0) };
    if result == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn is_alive(pid: u32) -> bool {
    pid == std::process::id()
}

/// Ask `pid` to exit with SIGTERM and escalate to SIGKILL after `grace`.
///
/// Returns `true` once the process is gone.
#[cfg(unix)]
pub async fn terminate(pid: u32, grace: Duration) -> bool {
    if !is_alive(pid) {
        return true;
    }

    tracing::info!(pid, "sending SIGTERM to previous instance");
    unsafe {
        libc::kill(pid as i32, libc::SIGTERM);
    }
    if wait_for_exit(pid, grace).await {
        return true;
    }

    tracing::warn!(pid, "previous instance ignored SIGTERM, sending SIGKILL");
    unsafe {
        libc::kill(pid as i32, libc::SIGKILL);
    }
    wait_for_exit(pid, Duration::from_secs(2)).await
}

#[cfg(not(unix))]
pub async fn terminate(pid: u32, _grace: Duration) -> bool {
    !is_alive(pid)
}

async fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if !is_alive(pid) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
