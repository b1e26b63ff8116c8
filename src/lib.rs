#![cfg_attr(not(test), no_std)]

//! A crash reporter that walks the stack from inside a signal handler.
//!
//! [`install`] captures the loaded images and hooks the fatal signals. When
//! one arrives, the crashed thread is written to the crash log as
//! `[Binary:Load]`, `[Thread:State]` and `[Thread:Frame]` lines, unwinding
//! with compact unwind info, DWARF CFI, or the frame pointer chain, whichever
//! the frame has.

#[cfg(not(target_pointer_width = "64"))]
compile_error!("crashwind only supports 64-bit targets");

extern crate alloc;

#[macro_use]
extern crate tracing;

use alloc::boxed::Box;
use core::ffi::c_int;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

pub mod arch;
pub mod compact;
pub mod config;
pub mod cursor;
pub mod dwarf;
pub mod error;
pub mod image;
pub mod log;
pub mod memory;
pub mod signal;
pub mod state;
mod stdext;
pub mod walk;

pub use arch::{Registers, Step};
pub use config::{Config, LogTarget};
pub use error::{Error, Result};
pub use image::{ImageDescriptor, ImageTable};
pub use log::{CrashLog, FdLog};
pub use state::CrashState;
pub use walk::{StepMethod, Unwinder};

use image::{ImageLocator, LocatorCache};
use memory::ProcessMemory;
use signal::SavedActions;
use state::StateCell;

static REPORTER: AtomicPtr<CrashReporter> = AtomicPtr::new(ptr::null_mut());

/// Everything the signal handler needs, set up before any crash.
#[derive(Debug)]
pub struct CrashReporter {
    pub(crate) config: Config,
    images: ImageTable,
    cache: LocatorCache,
    pub(crate) state: StateCell,
    log_fd: c_int,
    pub(crate) saved_actions: SavedActions,
}

impl CrashReporter {
    /// Captures images and opens the log, without touching signals.
    fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let log_fd = match config.log {
            LogTarget::Fd(fd) => fd,
            LogTarget::Path(path) => stdext::open_log(path)?,
        };

        let reporter = Self {
            config,
            images: ImageTable::capture(),
            cache: LocatorCache::new(),
            state: StateCell::new(),
            log_fd,
            saved_actions: SavedActions::empty(),
        };
        reporter
            .state
            .transition(CrashState::Uninitialized, CrashState::Initialized);
        Ok(reporter)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn images(&self) -> &[ImageDescriptor] {
        self.images.as_slice()
    }

    pub fn state(&self) -> CrashState {
        self.state.load()
    }

    /// A fresh writer for the crash log.
    pub fn log(&self) -> FdLog {
        FdLog::new(self.log_fd)
    }

    /// Logs one thread: its registers and every frame of its stack, then
    /// any image the walk did not need.
    ///
    /// Returns the number of frames logged.
    pub fn log_thread<R: Registers>(&self, registers: &R, crashed: bool) -> Result<usize> {
        let mut log = self.log();
        if crashed {
            log.crashed();
        }
        log::registers(&mut log, registers);

        let locator = ImageLocator::new(self.images.as_slice(), &self.cache);
        // SAFETY: Every region in the table belongs to a loaded image, and a
        // walk only reads the stack it starts on.
        let unwinder = unsafe { Unwinder::new(locator, ProcessMemory::new(), self.config.max_frames) };
        let result = unwinder.walk(registers, &mut log);

        locator.log_remaining(&mut log);
        result
    }
}

impl Drop for CrashReporter {
    fn drop(&mut self) {
        // Only a reporter that never got published is dropped.
        if let LogTarget::Path(_) = self.config.log {
            stdext::close(self.log_fd);
        }
    }
}

/// The installed reporter, if any.
pub fn reporter() -> Option<&'static CrashReporter> {
    // SAFETY: Only ever set to a leaked box, which is never freed.
    unsafe { REPORTER.load(Ordering::Acquire).as_ref() }
}

/// Sets up the process-wide reporter and hooks `config.signals`.
///
/// Can only be done once per process.
pub fn install(config: Config) -> Result<&'static CrashReporter> {
    if reporter().is_some() {
        return Err(Error::ArgumentInvalid("crash reporter already installed"));
    }

    let reporter = Box::into_raw(Box::new(prepare(config)?));
    if let Err(existing) =
        REPORTER.compare_exchange(ptr::null_mut(), reporter, Ordering::AcqRel, Ordering::Acquire)
    {
        // SAFETY: Never published, so this is still the only pointer.
        let reporter = unsafe { Box::from_raw(reporter) };
        // Lost a race with another install. Its handlers are the ones we
        // saved, so putting them back leaves it in charge.
        reporter.saved_actions.restore();
        warn!("crash reporter already installed at {existing:p}");
        return Err(Error::ArgumentInvalid("crash reporter already installed"));
    }
    // SAFETY: Published, and from now on never freed.
    let reporter: &'static CrashReporter = unsafe { &*reporter };

    info!(
        "crash reporter installed, {} images, log fd {}",
        reporter.images.len(),
        reporter.log_fd
    );
    Ok(reporter)
}

/// A reporter with its handlers installed, not yet published. Dropping it
/// on failure closes a log file it opened.
fn prepare(config: Config) -> Result<CrashReporter> {
    let mut reporter = CrashReporter::new(config)?;
    reporter.saved_actions = signal::install(config.signals)?;
    Ok(reporter)
}

/// Logs the calling thread's stack to the installed reporter's crash log.
#[inline(always)]
pub fn log_current_thread() -> Result<usize> {
    let reporter = reporter().ok_or(Error::ArgumentInvalid("crash reporter not installed"))?;
    let registers = arch::capture_context();
    reporter.log_thread(&registers, false)
}
