//! Fatal signal handling.
//!
//! Our handler is installed with `SA_RESETHAND | SA_NODEFER`: a second fault
//! of the same kind, including one raised by the handler itself, goes to the
//! default action instead of looping back into us. The first thing the
//! handler does is put the previous handlers back, so when it returns the
//! faulting instruction runs again and whoever was installed before us gets
//! to see the crash too.

use core::ffi::{c_int, c_void};
use core::{mem, ptr};

use crate::arch::NativeRegisters;
use crate::config::MAX_SIGNALS;
use crate::error::{Error, Result};
use crate::log::CrashLog;
use crate::state::CrashState;
use crate::stdext;

/// The actions that were in place before ours.
pub struct SavedActions {
    signals: &'static [c_int],
    actions: [libc::sigaction; MAX_SIGNALS],
}

impl core::fmt::Debug for SavedActions {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SavedActions")
            .field("signals", &self.signals)
            .finish_non_exhaustive()
    }
}

/// Installs [`handle_signal`] for every signal in `signals`.
///
/// Every signal is attempted even when an earlier one fails. On failure the
/// ones that succeeded are restored before returning.
pub fn install(signals: &'static [c_int]) -> Result<SavedActions> {
    if signals.len() > MAX_SIGNALS {
        return Err(Error::ArgumentInvalid("too many signals"));
    }

    // SAFETY: `sigaction` is plain old data; all zeroes is a valid value.
    let mut saved = SavedActions {
        signals,
        actions: unsafe { mem::zeroed() },
    };
    // SAFETY: As above.
    let mut action: libc::sigaction = unsafe { mem::zeroed() };
    action.sa_sigaction = handler_address();
    action.sa_flags = libc::SA_SIGINFO | libc::SA_RESETHAND | libc::SA_NODEFER;
    // SAFETY: `sa_mask` is a valid signal set.
    unsafe { libc::sigemptyset(&mut action.sa_mask) };

    let mut failure = None;
    for (&signal, previous) in signals.iter().zip(&mut saved.actions) {
        // SAFETY: Both pointers are valid for the duration of the call.
        if unsafe { libc::sigaction(signal, &action, previous) } != 0 {
            let errno = stdext::errno();
            stdext::with_os_error_str(errno, |message| {
                warn!("unable to install handler for signal {signal}: {message}");
            });
            // Leave a default action to restore into rather than garbage.
            previous.sa_sigaction = libc::SIG_DFL;
            failure.get_or_insert(Error::CallFailed(errno));
        } else {
            debug!("installed handler for signal {signal}");
        }
    }

    match failure {
        Some(err) => {
            saved.restore();
            Err(err)
        }
        None => Ok(saved),
    }
}

impl SavedActions {
    /// Restores nothing.
    pub fn empty() -> Self {
        Self {
            signals: &[],
            // SAFETY: `sigaction` is plain old data; all zeroes is a valid value.
            actions: unsafe { mem::zeroed() },
        }
    }

    /// Puts the previous handlers back. A signal whose previous handler
    /// cannot be restored gets the default action instead.
    pub fn restore(&self) {
        for (&signal, action) in self.signals.iter().zip(&self.actions) {
            // SAFETY: `action` came out of `sigaction` or is zeroed.
            if unsafe { libc::sigaction(signal, action, ptr::null_mut()) } != 0 {
                trace!("failed to restore the handler for signal {signal}");
                reset_to_default(signal);
            }
        }
    }
}

/// The address `sigaction` is given for [`handle_signal`].
fn handler_address() -> libc::sighandler_t {
    let handler: extern "C" fn(c_int, *mut libc::siginfo_t, *mut c_void) = handle_signal;
    handler as *const () as libc::sighandler_t
}

fn reset_to_default(signal: c_int) {
    // SAFETY: All zeroes with `SIG_DFL` is a valid action.
    unsafe {
        let mut action: libc::sigaction = mem::zeroed();
        action.sa_sigaction = libc::SIG_DFL;
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(signal, &action, ptr::null_mut());
    }
}

/// Writes the `[Signal]` line. `info` may be null.
pub(crate) fn log_signal(log: &mut dyn CrashLog, signal: c_int, info: *const libc::siginfo_t) {
    // SAFETY: The kernel hands the handler a valid `siginfo_t` or null.
    let Some(info) = (unsafe { info.as_ref() }) else {
        log.signal(signal, 0, 0, 0);
        return;
    };

    #[cfg(target_os = "linux")]
    // SAFETY: Reading the fault address out of a valid `siginfo_t`.
    let address = unsafe { info.si_addr() }.addr();
    #[cfg(not(target_os = "linux"))]
    let address = info.si_addr.addr();

    log.signal(signal, info.si_code, address, info.si_errno);
}

/// The `SA_SIGINFO` handler.
///
/// Only async-signal-safe calls from here on: no allocation, no locks, and
/// the crash log goes straight to its descriptor.
pub extern "C" fn handle_signal(signal: c_int, info: *mut libc::siginfo_t, context: *mut c_void) {
    let saved_errno = stdext::errno();

    let Some(reporter) = crate::reporter() else {
        // Installed but not yet published, nothing to report into.
        reset_to_default(signal);
        return;
    };

    reporter.saved_actions.restore();

    let mut log = reporter.log();
    log_signal(&mut log, signal, info);

    reporter.state.transition(CrashState::Initialized, CrashState::Signal);

    // SAFETY: The kernel hands a `SA_SIGINFO` handler its `ucontext_t`, or null.
    match unsafe { context.cast::<libc::ucontext_t>().as_ref() } {
        Some(context) => {
            // SAFETY: As above.
            let registers = unsafe { NativeRegisters::from_ucontext(context) };
            if let Err(err) = reporter.log_thread(&registers, true) {
                trace!("crashed thread walk ended early: {err}");
            }
        }
        None => trace!("no context for signal {signal}"),
    }

    reporter.state.transition(CrashState::Signal, CrashState::SignalHandled);

    if reporter.config.suppress_report_crash {
        stdext::exit_now(0);
    }

    stdext::set_errno(saved_errno);
}
