//! Utility functions shared by the spawner and child setup paths

use std::ffi::CString;
use std::fs;
use std::os::fd::RawFd;

use crate::errors::{Result, SpawnerError};

/// Longest process name accepted by PR_SET_NAME (15 bytes + NUL).
const TASK_COMM_LEN: usize = 15;

/// Get the effective UID of the calling process
pub fn get_euid() -> u32 {
    unsafe { libc::geteuid() }
}

/// Get the effective GID of the calling process
pub fn get_egid() -> u32 {
    unsafe { libc::getegid() }
}

/// Close every open file descriptor above 2 that is not in `keep`.
///
/// Walks /proc/self/fd rather than iterating up to RLIMIT_NOFILE. The
/// directory fd used for the walk shows up in the listing and is skipped by
/// closing only after collecting the entries.
pub fn close_fds_except(keep: &[RawFd]) {
    let mut to_close: Vec<RawFd> = Vec::new();
    if let Ok(entries) = fs::read_dir("/proc/self/fd") {
        for entry in entries.flatten() {
            if let Some(fd) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<RawFd>().ok())
                && fd > 2
                && !keep.contains(&fd)
            {
                to_close.push(fd);
            }
        }
    }
    for fd in to_close {
        unsafe {
            libc::close(fd);
        }
    }
}

/// Set the process title seen in ps, truncated to the kernel limit.
pub fn set_process_name(name: &str) -> Result<()> {
    let truncated: String = name.chars().take(TASK_COMM_LEN).collect();
    let cname = CString::new(truncated)
        .map_err(|_| SpawnerError::InvalidConfig("process name contains NUL byte".to_string()))?;
    let ret = unsafe { libc::prctl(libc::PR_SET_NAME, cname.as_ptr(), 0, 0, 0) };
    if ret != 0 {
        return Err(SpawnerError::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

/// Replace stdin with /dev/null.
pub fn devnull_stdin() -> std::io::Result<()> {
    let devnull = CString::new("/dev/null").expect("static path");
    let fd = unsafe { libc::open(devnull.as_ptr(), libc::O_RDONLY) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    let ret = unsafe { libc::dup2(fd, 0) };
    unsafe {
        if fd > 2 {
            libc::close(fd);
        }
    }
    if ret < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Count of fds currently open in this process. Used by fd-hygiene tests.
#[cfg(test)]
pub fn open_fd_count() -> usize {
    match fs::read_dir("/proc/self/fd") {
        // The read_dir handle itself is open during the walk
        Ok(entries) => entries.count().saturating_sub(1),
        Err(_) => 0,
    }
}
