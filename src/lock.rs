//! Advisory `flock` helpers.
//!
//! Locks belong to the open file, so they vanish with the holder: a dropped
//! task, a killed process or a rebooted host all release them.

use std::fs::File;
use std::io;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LockMode {
    Shared,
    Exclusive,
}

/// Try to lock `file` without blocking.
///
/// Returns `Ok(false)` if someone else holds a conflicting lock.
#[cfg(unix)]
pub(crate) fn try_lock(file: &File, mode: LockMode) -> io::Result<bool> {
    use std::os::unix::io::AsRawFd;

    // SAFETY: flock only reads the descriptor, which `file` keeps open
    let result = unsafe { libc::flock(file.as_raw_fd(), operation(mode) | libc::LOCK_NB) };
    if result == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.kind() == io::ErrorKind::WouldBlock || err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        return Ok(false);
    }
    Err(err)
}

#[cfg(not(unix))]
pub(crate) fn try_lock(_file: &File, _mode: LockMode) -> io::Result<bool> {
    Ok(true)
}

/// An exclusive lock on a path, held until dropped.
#[derive(Debug)]
pub(crate) struct PathLock {
    _file: Option<File>,
}

/// Block until an exclusive lock on `path` (a file or a directory) is held.
#[cfg(unix)]
pub(crate) fn lock_exclusive(path: &Path) -> io::Result<PathLock> {
    use std::os::unix::io::AsRawFd;

    let file = File::open(path)?;
    loop {
        // SAFETY: as in try_lock
        if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) } == 0 {
            return Ok(PathLock { _file: Some(file) });
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[cfg(not(unix))]
pub(crate) fn lock_exclusive(_path: &Path) -> io::Result<PathLock> {
    Ok(PathLock { _file: None })
}

#[cfg(unix)]
fn operation(mode: LockMode) -> libc::c_int {
    match mode {
        LockMode::Shared => libc::LOCK_SH,
        LockMode::Exclusive => libc::LOCK_EX,
    }
}
