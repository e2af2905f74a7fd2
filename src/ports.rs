//! Best-effort reclamation of a TCP port.
//!
//! The owning process is found with `lsof` and killed with `SIGKILL`. This is
//! coarse and racy: it cannot tell a previous instance of our own app from an
//! unrelated process that happens to hold the port, and the port may be taken
//! again before the new backend binds it. Callers treat every error as
//! informational.

use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum PortError {
    #[error("could not execute lsof command: {0}")]
    Introspection(#[from] std::io::Error),
    #[error("no process found using port {0}")]
    NotFound(u16),
    #[error("could not parse output for port {0}")]
    Unparsable(u16),
    #[error("invalid PID: {0}")]
    InvalidPid(String),
    #[error("failed to kill process {pid}: {reason}")]
    KillFailed { pid: u32, reason: String },
}

/// Find the process bound to `port` and forcibly terminate it.
///
/// Returns the PID that was killed.
pub async fn kill_port(port: u16) -> Result<u32, PortError> {
    let pid = find_pid(port).await?;
    info!(port, pid, "Reclaiming port from existing process");
    kill_process(pid)?;
    Ok(pid)
}

async fn find_pid(port: u16) -> Result<u32, PortError> {
    // Listening sockets only; client connections to the port belong to callers
    let output = Command::new("lsof")
        .arg("-i")
        .arg(format!("TCP:{}", port))
        .arg("-sTCP:LISTEN")
        .output()
        .await?;

    // lsof exits non-zero when nothing matches
    if !output.status.success() && output.stdout.is_empty() {
        debug!(port, status = ?output.status, "lsof found no listener");
        return Err(PortError::NotFound(port));
    }

    parse_lsof_pid(&String::from_utf8_lossy(&output.stdout), port, std::process::id())
}

/// Extract the PID from the first data row of `lsof -i` output that does
/// not belong to `own_pid`
pub fn parse_lsof_pid(output: &str, port: u16, own_pid: u32) -> Result<u32, PortError> {
    for row in output.lines().skip(1).filter(|l| !l.trim().is_empty()) {
        let pid = row
            .split_whitespace()
            .nth(1)
            .ok_or(PortError::Unparsable(port))?;
        let pid = pid
            .parse::<u32>()
            .map_err(|_| PortError::InvalidPid(pid.to_string()))?;
        if pid != own_pid {
            return Ok(pid);
        }
    }
    Err(PortError::NotFound(port))
}

#[cfg(unix)]
fn kill_process(pid: u32) -> Result<(), PortError> {
    let pid_t = libc::pid_t::try_from(pid).map_err(|_| PortError::InvalidPid(pid.to_string()))?;
    if pid_t <= 0 || pid == std::process::id() {
        return Err(PortError::KillFailed {
            pid,
            reason: "refusing to signal this process".to_string(),
        });
    }
    let result = unsafe { libc::kill(pid_t, libc::SIGKILL) };
    if result != 0 {
        return Err(PortError::KillFailed {
            pid,
            reason: std::io::Error::last_os_error().to_string(),
        });
    }
    Ok(())
}

#[cfg(not(unix))]
fn kill_process(pid: u32) -> Result<(), PortError> {
    Err(PortError::KillFailed {
        pid,
        reason: "port reclamation is only supported on Unix".to_string(),
    })
}
