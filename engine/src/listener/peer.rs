//! Peer identification: credentials, `/proc` directory handle, pidfd liveness
//! check, and `exe` symlink resolution.

use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::RawFd;
use std::sync::Once;

use tokio::net::UnixStream;
use tracing::warn;

use crate::error::{GatewayError, Result};

static PIDFD_WARNING: Once = Once::new();

/// The peer's PID, as reported by `SO_PEERCRED` at accept time.
pub fn peer_pid(stream: &UnixStream) -> Result<u32> {
    let cred = stream
        .peer_cred()
        .map_err(|e| GatewayError::PermissionDenied(e.to_string()))?;
    cred.pid()
        .map(|pid| pid as u32)
        .ok_or_else(|| GatewayError::PermissionDenied("peer reported no pid".to_string()))
}

/// Opens a read-only directory handle on `/proc/{pid}`. Failure here is
/// fatal for this connection only (the PID may already be gone).
pub fn open_proc_dir(pid: u32) -> Result<std::fs::File> {
    std::fs::OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_DIRECTORY)
        .open(format!("/proc/{pid}"))
        .map_err(|e| GatewayError::PermissionDenied(e.to_string()))
}

/// Resolves the absolute target of `/proc/{pid}/exe`.
pub fn read_exe_path(pid: u32) -> Result<String> {
    let target = std::fs::read_link(format!("/proc/{pid}/exe"))
        .map_err(|e| GatewayError::PermissionDenied(e.to_string()))?;
    target
        .to_str()
        .map(str::to_string)
        .ok_or_else(|| GatewayError::PermissionDenied("exe path is not valid UTF-8".to_string()))
}

/// Opens a pidfd for `pid` via the `pidfd_open` syscall. Returns `Ok(None)`
/// (after logging a one-time warning) when the kernel does not support the
/// syscall, matching the reference daemon's silent-downgrade behavior.
fn pidfd_open(pid: u32) -> Result<Option<RawFd>> {
    // SAFETY: pidfd_open takes a pid and flags (must be 0) and returns a new
    // fd or -1/errno; no pointers are passed so the call cannot corrupt memory.
    let fd = unsafe { libc::syscall(libc::SYS_pidfd_open, pid as libc::pid_t, 0) };
    if fd >= 0 {
        return Ok(Some(fd as RawFd));
    }
    let errno = std::io::Error::last_os_error();
    if errno.raw_os_error() == Some(libc::ENOSYS) {
        PIDFD_WARNING.call_once(|| {
            warn!("kernel does not support pidfd_open; skipping peer liveness verification");
        });
        return Ok(None);
    }
    if errno.raw_os_error() == Some(libc::ESRCH) {
        return Err(GatewayError::PermissionDenied(format!(
            "pid {pid} no longer exists"
        )));
    }
    Err(GatewayError::PermissionDenied(errno.to_string()))
}

/// Sends signal 0 through `pidfd` to verify the process it refers to is
/// still alive and accessible.
fn pidfd_send_null_signal(pidfd: RawFd) -> Result<()> {
    // SAFETY: pidfd_send_signal with sig=0 and a null siginfo is a pure
    // liveness probe; it performs no action on the target process.
    let rc = unsafe { libc::syscall(libc::SYS_pidfd_send_signal, pidfd, 0, std::ptr::null::<u8>(), 0) };
    if rc == 0 {
        Ok(())
    } else {
        Err(GatewayError::PermissionDenied(
            std::io::Error::last_os_error().to_string(),
        ))
    }
}

/// Verifies the peer at `pid` is still the same, live process, using a
/// pidfd when the kernel supports it. On kernels without pidfd support this
/// is a no-op (the PID-reuse race window documented in the trust-boundary
/// note is accepted, not silently hidden).
pub fn verify_peer_alive(pid: u32) -> Result<()> {
    match pidfd_open(pid)? {
        Some(fd) => {
            let result = pidfd_send_null_signal(fd);
            unsafe {
                libc::close(fd);
            }
            result
        }
        None => Ok(()),
    }
}
