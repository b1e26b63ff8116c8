//! The few libc calls the crash path needs, all async-signal-safe.

use core::ffi::{self, CStr};

use crate::error::{Error, Result};

/// Writes all of `bytes` to `fd`, retrying interrupted and short writes.
pub(crate) fn write_all(fd: i32, mut bytes: &[u8]) -> Result<(), i32> {
    while !bytes.is_empty() {
        // SAFETY: The pointer and length describe a live slice.
        let r = unsafe { libc::write(fd, bytes.as_ptr().cast(), bytes.len()) };
        if r < 0 {
            let errno = errno();
            if errno == libc::EINTR {
                continue;
            }
            return Err(errno);
        }
        if r == 0 {
            return Ok(());
        }
        bytes = &bytes[(r as usize)..];
    }
    Ok(())
}

/// Opens the crash log, truncating what a previous run left behind.
pub(crate) fn open_log(path: &CStr) -> Result<i32> {
    let flags = libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC | libc::O_APPEND;
    // SAFETY: `path` is NUL-terminated.
    let fd = unsafe { libc::open(path.as_ptr(), flags, 0o666 as ffi::c_uint) };
    if fd < 0 {
        return Err(Error::CallFailed(errno()));
    }
    Ok(fd)
}

pub(crate) fn close(fd: i32) {
    // SAFETY: Only called on descriptors we opened ourselves.
    if unsafe { libc::close(fd) } != 0 {
        trace!("failed to close fd {fd}: errno {}", errno());
    }
}

/// Terminates the process without running any user-space cleanup.
pub(crate) fn exit_now(code: i32) -> ! {
    // SAFETY: `_exit` is async-signal-safe and never returns.
    unsafe { libc::_exit(code) }
}

#[cfg(target_os = "linux")]
fn errno_location() -> *mut i32 {
    // SAFETY: Always returns the calling thread's errno.
    unsafe { libc::__errno_location() }
}

#[cfg(target_vendor = "apple")]
fn errno_location() -> *mut i32 {
    // SAFETY: Always returns the calling thread's errno.
    unsafe { libc::__error() }
}

pub(crate) fn errno() -> i32 {
    // SAFETY: The location is valid for the lifetime of the thread.
    unsafe { *errno_location() }
}

pub(crate) fn set_errno(value: i32) {
    // SAFETY: The location is valid for the lifetime of the thread.
    unsafe { *errno_location() = value };
}

/// Calls `f` with the message for `errno`. Install time only: `strerror_r`
/// is not async-signal-safe.
pub(crate) fn with_os_error_str<R>(errno: i32, f: impl FnOnce(&str) -> R) -> R {
    let mut buf: [u8; 512] = [0; 512];

    // SAFETY: Our buffer length is passed correctly.
    let error = unsafe { libc::strerror_r(errno, buf.as_mut_ptr().cast(), buf.len()) };
    if error != 0 {
        return f("<strerror_r returned an error>");
    }
    // The buffer is zero initialized, so there is a NUL even if nothing was written.
    let message = CStr::from_bytes_until_nul(&buf)
        .ok()
        .and_then(|message| message.to_str().ok())
        .unwrap_or("<error message contained invalid utf8>");
    f(message)
}
