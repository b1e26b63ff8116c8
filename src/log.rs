//! The crash log.
//!
//! Every line is built with `core::fmt` into a fixed buffer and written
//! straight to a file descriptor, so logging from a signal handler neither
//! allocates nor takes a lock.

use core::fmt::{self, Write};

use crate::arch::{RegisterList, Registers};
use crate::error::Error;
use crate::image::ImageDescriptor;
use crate::stdext;

/// Bytes buffered before a write is issued.
pub const BUFFER_SIZE: usize = 256;

/// Receives the crash report one line at a time.
pub trait CrashLog {
    /// Writes `args` followed by a newline.
    fn line(&mut self, args: fmt::Arguments<'_>);

    fn image(&mut self, image: &ImageDescriptor) {
        self.line(format_args!("[Binary:Load] {image}"));
    }

    fn frame(&mut self, ip: usize, sp: usize, fp: usize) {
        self.line(format_args!(
            "[Thread:Frame] ip: {ip:#x}, sp: {sp:#x}, fp: {fp:#x}"
        ));
    }

    /// The walk stopped at `frame` without reaching the end of the stack.
    fn unwind_failed(&mut self, frame: usize, err: Error) {
        self.line(format_args!("[Thread:Error] frame: {frame}, error: {err}"));
    }

    fn crashed(&mut self) {
        self.line(format_args!("[Thread:Crashed]"));
    }

    fn signal(&mut self, signal: i32, code: i32, address: usize, errno: i32) {
        self.line(format_args!(
            "[Signal] signal: {signal}, code: {code}, address: {address:#x}, errno: {errno}"
        ));
    }
}

/// Logs the `[Thread:State]` line for a register file.
pub fn registers<R: Registers>(log: &mut dyn CrashLog, registers: &R) {
    log.line(format_args!("[Thread:State] {}", RegisterList(registers)));
}

/// A [`CrashLog`] writing to a raw file descriptor.
pub struct FdLog {
    fd: i32,
    len: usize,
    buffer: [u8; BUFFER_SIZE],
}

impl fmt::Debug for FdLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FdLog")
            .field("fd", &self.fd)
            .field("buffered", &self.len)
            .finish()
    }
}

impl FdLog {
    pub const fn new(fd: i32) -> Self {
        Self {
            fd,
            len: 0,
            buffer: [0; BUFFER_SIZE],
        }
    }

    pub fn fd(&self) -> i32 {
        self.fd
    }

    pub fn is_valid(&self) -> bool {
        self.fd >= 0
    }

    pub fn flush(&mut self) {
        if self.len == 0 {
            return;
        }
        if let Err(errno) = stdext::write_all(self.fd, &self.buffer[..self.len]) {
            trace!("crash log write failed: errno {errno}");
        }
        self.len = 0;
    }
}

impl Write for FdLog {
    fn write_str(&mut self, mut s: &str) -> fmt::Result {
        while !s.is_empty() {
            if self.len == BUFFER_SIZE {
                self.flush();
            }
            let n = s.len().min(BUFFER_SIZE - self.len);
            self.buffer[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
            self.len += n;
            s = &s[n..];
        }
        Ok(())
    }
}

impl CrashLog for FdLog {
    fn line(&mut self, args: fmt::Arguments<'_>) {
        if !self.is_valid() {
            return;
        }
        // Our `write_str` never fails; a formatting error only truncates the line.
        let _ = self.write_fmt(args);
        let _ = self.write_str("\n");
        self.flush();
    }
}

impl Drop for FdLog {
    fn drop(&mut self) {
        self.flush();
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Keeps every line in memory.
    #[derive(Debug, Default)]
    pub(crate) struct LineLog {
        pub(crate) lines: Vec<String>,
    }

    impl LineLog {
        pub(crate) fn starting_with(&self, prefix: &str) -> Vec<&str> {
            self.lines
                .iter()
                .map(String::as_str)
                .filter(|line| line.starts_with(prefix))
                .collect()
        }
    }

    impl CrashLog for LineLog {
        fn line(&mut self, args: fmt::Arguments<'_>) {
            self.lines.push(args.to_string());
        }
    }
}
