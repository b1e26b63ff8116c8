use core::ffi::{c_int, CStr};

use crate::error::{Error, Result};
use crate::walk::DEFAULT_MAX_FRAMES;

/// Signals handled unless [`Config::with_signals`] says otherwise.
pub const DEFAULT_SIGNALS: [c_int; 5] = [
    libc::SIGBUS,
    libc::SIGABRT,
    libc::SIGILL,
    libc::SIGSEGV,
    libc::SIGSYS,
];

/// The most signals one reporter can handle.
pub const MAX_SIGNALS: usize = 16;

/// Where the crash log goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTarget {
    /// An already open descriptor. It is never closed.
    Fd(c_int),
    /// A file, created or truncated at install time.
    Path(&'static CStr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    pub log: LogTarget,
    pub max_frames: usize,
    /// Exit with `_exit(0)` after logging instead of letting the signal
    /// reach the previous handler.
    pub suppress_report_crash: bool,
    pub signals: &'static [c_int],
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log: LogTarget::Fd(libc::STDERR_FILENO),
            max_frames: DEFAULT_MAX_FRAMES,
            suppress_report_crash: false,
            signals: &DEFAULT_SIGNALS,
        }
    }
}

impl Config {
    pub fn with_log_fd(mut self, fd: c_int) -> Self {
        self.log = LogTarget::Fd(fd);
        self
    }

    pub fn with_log_path(mut self, path: &'static CStr) -> Self {
        self.log = LogTarget::Path(path);
        self
    }

    pub fn with_max_frames(mut self, max_frames: usize) -> Self {
        self.max_frames = max_frames;
        self
    }

    pub fn with_suppress_report_crash(mut self, suppress: bool) -> Self {
        self.suppress_report_crash = suppress;
        self
    }

    pub fn with_signals(mut self, signals: &'static [c_int]) -> Self {
        self.signals = signals;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_frames == 0 {
            return Err(Error::ArgumentInvalid("max_frames must be at least 1"));
        }
        if let LogTarget::Fd(fd) = self.log {
            if fd < 0 {
                return Err(Error::ArgumentInvalid("negative log fd"));
            }
        }
        if self.signals.is_empty() || self.signals.len() > MAX_SIGNALS {
            return Err(Error::ArgumentInvalid("signal set must have 1 to 16 entries"));
        }
        if self.signals.iter().any(|&signal| signal <= 0) {
            return Err(Error::ArgumentInvalid("signal numbers are positive"));
        }
        Ok(())
    }
}
