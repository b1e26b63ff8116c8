//! The process-wide crash state.
//!
//! A crash can arrive on any thread, while another crash is being handled,
//! or from inside the handler itself. Every change of state is a single
//! compare-and-swap; one that does not start from the expected state means
//! the process is too far gone to report anything, so it exits right away.

use core::sync::atomic::{AtomicU8, Ordering};

use crate::stdext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CrashState {
    Uninitialized = 0,
    Initialized,
    Signal,
    SignalHandled,
}

impl CrashState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Initialized,
            2 => Self::Signal,
            3 => Self::SignalHandled,
            _ => Self::Uninitialized,
        }
    }
}

#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl StateCell {
    pub const fn new() -> Self {
        Self(AtomicU8::new(CrashState::Uninitialized as u8))
    }

    pub fn load(&self) -> CrashState {
        CrashState::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Moves from `from` to `to`, or returns the state actually found.
    pub fn try_transition(&self, from: CrashState, to: CrashState) -> Result<(), CrashState> {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| trace!("crash state {from:?} -> {to:?}"))
            .map_err(CrashState::from_u8)
    }

    /// Like [`Self::try_transition`], but a mismatch terminates the process
    /// with `_exit(1)`.
    pub fn transition(&self, from: CrashState, to: CrashState) {
        if let Err(found) = self.try_transition(from, to) {
            trace!("crash state transition {from:?} -> {to:?} failed, found {found:?}");
            stdext::exit_now(1);
        }
    }
}
