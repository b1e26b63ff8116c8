//! Failure taxonomy shared by every decoder and stepper.
//!
//! All payloads are `Copy` so that building an error inside a signal handler
//! never allocates.

use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// An address failed the crash-safety check and was never dereferenced.
    #[error("pointer {0:#x} is outside the user address range")]
    PointerInvalid(usize),
    /// Malformed caller input, such as a register number the architecture
    /// does not have.
    #[error("invalid argument: {0}")]
    ArgumentInvalid(&'static str),
    /// The bytes decode, but they break a structural rule of the format.
    #[error("inconsistent data: {0}")]
    InconsistentData(&'static str),
    /// A recognized path that is deliberately not handled.
    #[error("unimplemented: {0}")]
    Unimplemented(&'static str),
    /// A call frame instruction outside the supported subset.
    #[error("unsupported call frame instruction {0:#04x}")]
    UnsupportedOpcode(u8),
    /// A byte that makes the rest of the entry impossible to interpret.
    #[error("unexpected byte {0:#04x}")]
    UnexpectedData(u8),
    /// The function has no unwind info. This is expected for some system
    /// library functions and is not a sign of corruption.
    #[error("function has no unwind info")]
    MissingUnwindInfo,
    /// A guarded load was rejected by the memory reader.
    #[error("failed to read memory at {0:#x}")]
    MemoryReadFailed(usize),
    /// A read would have crossed the end of its span.
    #[error("read past the end of the data")]
    EndOfData,
    /// No loaded image contains the address.
    #[error("no loaded image contains {0:#x}")]
    ImageNotFound(usize),
    /// A libc call failed with the given `errno`.
    #[error("system call failed with errno {0}")]
    CallFailed(i32),
    /// The walk hit the frame cap before reaching the end of the stack.
    #[error("gave up after {0} frames")]
    FrameLimit(usize),
}

pub type Result<T, E = Error> = core::result::Result<T, E>;
