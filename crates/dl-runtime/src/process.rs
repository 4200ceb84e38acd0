use std::time::Duration;

use tokio::process::Child;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Returns `true` when a process with `pid` appears to be alive.
pub fn is_process_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        let Ok(raw_pid) = i32::try_from(pid) else {
            return false;
        };
        // Safety: signal 0 performs error checking only and delivers nothing.
        unsafe { libc::kill(raw_pid, 0) == 0 }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}

#[cfg(unix)]
pub fn send_signal(pid: u32, signal: i32) -> std::io::Result<()> {
    let raw_pid = i32::try_from(pid).map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("PID out of range: {pid}"),
        )
    })?;
    // Safety: `raw_pid` is validated as a positive process id for libc::kill.
    let rc = unsafe { libc::kill(raw_pid, signal) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// SIGTERM, then SIGKILL once `grace` has elapsed. Returns `false` when the
/// process was already gone.
pub async fn terminate_pid(pid: u32, grace: Duration) -> bool {
    if !is_process_alive(pid) {
        return false;
    }

    #[cfg(unix)]
    {
        if send_signal(pid, libc::SIGTERM).is_err() {
            return false;
        }
        let deadline = tokio::time::Instant::now() + grace;
        while tokio::time::Instant::now() < deadline {
            if !is_process_alive(pid) {
                return true;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        tracing::warn!(pid, "process ignored SIGTERM, sending SIGKILL");
        let _ = send_signal(pid, libc::SIGKILL);
    }
    true
}

/// Two-phase shutdown for a child this process owns. The child is reaped
/// before returning.
pub async fn terminate_child(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            let _ = send_signal(pid, libc::SIGTERM);
            if tokio::time::timeout(grace, child.wait()).await.is_ok() {
                return;
            }
            tracing::warn!(pid, "child ignored SIGTERM, killing");
        }
    }
    #[cfg(not(unix))]
    {
        let _ = grace;
    }
    let _ = child.kill().await;
    let _ = child.wait().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_process_alive_self() {
        assert!(is_process_alive(std::process::id()));
    }

    #[test]
    fn is_process_alive_reaped_child() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        assert!(!is_process_alive(pid));
    }

    #[tokio::test]
    async fn terminate_pid_returns_false_for_dead_process() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        assert!(!terminate_pid(pid, Duration::from_millis(100)).await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn terminate_child_stops_sleep() {
        let mut child = tokio::process::Command::new("sleep")
            .arg("60")
            .spawn()
            .unwrap();
        terminate_child(&mut child, Duration::from_secs(2)).await;
        assert!(child.try_wait().unwrap().is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn terminate_child_escalates_when_term_is_ignored() {
        let mut child = tokio::process::Command::new("sh")
            .args(["-c", "trap '' TERM; exec sleep 60"])
            .spawn()
            .unwrap();
        // Give the shell time to install the trap.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let started = std::time::Instant::now();
        terminate_child(&mut child, Duration::from_millis(300)).await;
        assert!(child.try_wait().unwrap().is_some());
        assert!(started.elapsed() >= Duration::from_millis(300));
    }
}
