//! Stdout isolation after the handshake.
//!
//! The host reads the handshake from our stdout and may keep reading it for
//! the life of the process. Once the line is out, fd 1 is pointed at stderr so
//! stray prints from capability code (or anything it spawns) land in the log
//! stream instead.

#[cfg(unix)]
use std::io::{self, Write};
#[cfg(unix)]
use std::os::fd::{BorrowedFd, FromRawFd, OwnedFd};

#[cfg(unix)]
use nix::unistd::dup2;

#[cfg(unix)]
const STDOUT_FD: i32 = 1;
#[cfg(unix)]
const STDERR_FD: i32 = 2;

/// Point fd 1 at whatever fd 2 refers to.
///
/// Must run after the handshake line has been flushed.
#[cfg(unix)]
pub fn isolate_stdout() -> io::Result<()> {
    io::stdout().flush()?;

    // Safety: fds 1 and 2 are opened by the OS at process start. dup2 replaces
    // fd 1 atomically; `forget` keeps the OwnedFd from closing it afterwards.
    let stderr = unsafe { BorrowedFd::borrow_raw(STDERR_FD) };
    let mut stdout = unsafe { OwnedFd::from_raw_fd(STDOUT_FD) };
    let result = dup2(stderr, &mut stdout);
    std::mem::forget(stdout);
    result.map_err(|e| io::Error::other(format!("dup2 stderr->stdout failed: {e}")))?;

    tracing::debug!("Stdout redirected to stderr");
    Ok(())
}

#[cfg(not(unix))]
pub fn isolate_stdout() -> std::io::Result<()> {
    tracing::debug!("Stdout isolation not supported on this platform");
    Ok(())
}
