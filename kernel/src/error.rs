//! Error type shared by every fallible core operation.
//!
//! Recoverable failures (exhaustion, not-found, refusals) travel back to the
//! caller as [`Error`]; the syscall layer turns them into negative errno
//! values. Invariant violations are not errors: they `panic!`.

use core::fmt;

use crate::fs::FsError;
use crate::fs::elf::ElfError;
use crate::memory::MemoryError;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Every thread id up to the pool maximum is in use.
    ThreadIdsExhausted,
    /// Every process id up to the pool maximum is in use.
    ProcessIdsExhausted,
    /// The process already runs its maximum number of user threads.
    UserStacksExhausted,
    /// The VM collaborator could not clone the calling address space.
    AddressSpaceClone,
    /// Kernel memory (stack or page) allocation failed.
    OutOfMemory,
    /// A user pointer does not reference mapped memory.
    BadAddress,
    /// Path does not exist (or names a directory where a file is needed).
    NotFound,
    /// The filesystem returned fewer bytes than it reported.
    ReadError,
    /// The filesystem refuses to write.
    ReadOnly,
    /// The image is not a loadable executable.
    BadExecutable(ElfError),
    /// Argument strings do not fit in a user stack slot.
    ArgumentsTooLarge,
    /// `wait` named a pid that is neither a live nor an exited child.
    NoSuchChild,
    /// `wait(0)` with no children at all.
    NoChildren,
    /// Another thread of this process is already blocked in `wait`.
    AlreadyWaiting,
    /// The operation is restricted to single-threaded processes.
    MultiThreaded,
    /// The calling thread is not attached to a process.
    NoProcess,
    /// Only user threads (with a saved user frame) can fork.
    NotUserThread,
    /// The root kernel process cannot exit.
    NotPermitted,
    /// Unknown syscall number or malformed argument.
    InvalidArgument,
    /// A boot configuration value is unusable.
    InvalidConfig(&'static str),
}

impl Error {
    /// Negative errno returned to user mode.
    pub fn errno(&self) -> isize {
        match self {
            Error::NotFound => -2,
            Error::ReadError => -5,
            Error::NoChildren | Error::NoSuchChild => -10,
            Error::ThreadIdsExhausted
            | Error::ProcessIdsExhausted
            | Error::UserStacksExhausted
            | Error::AddressSpaceClone => -11,
            Error::OutOfMemory => -12,
            Error::BadAddress => -14,
            Error::AlreadyWaiting | Error::MultiThreaded => -16,
            Error::NotPermitted | Error::NotUserThread | Error::NoProcess => -1,
            Error::BadExecutable(_) => -8,
            Error::ArgumentsTooLarge => -7,
            Error::ReadOnly => -30,
            Error::InvalidArgument | Error::InvalidConfig(_) => -22,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ThreadIdsExhausted => f.write_str("thread ids exhausted"),
            Error::ProcessIdsExhausted => f.write_str("process ids exhausted"),
            Error::UserStacksExhausted => f.write_str("user stack slots exhausted"),
            Error::AddressSpaceClone => f.write_str("address space clone failed"),
            Error::OutOfMemory => f.write_str("out of memory"),
            Error::BadAddress => f.write_str("bad user address"),
            Error::NotFound => f.write_str("no such file"),
            Error::ReadError => f.write_str("read error"),
            Error::ReadOnly => f.write_str("read-only filesystem"),
            Error::BadExecutable(err) => write!(f, "bad executable: {:?}", err),
            Error::ArgumentsTooLarge => f.write_str("arguments do not fit on the user stack"),
            Error::NoSuchChild => f.write_str("no such child process"),
            Error::NoChildren => f.write_str("no child processes"),
            Error::AlreadyWaiting => f.write_str("another thread is already waiting"),
            Error::MultiThreaded => f.write_str("process has more than one thread"),
            Error::NoProcess => f.write_str("thread has no process"),
            Error::NotUserThread => f.write_str("not a user thread"),
            Error::NotPermitted => f.write_str("operation not permitted"),
            Error::InvalidArgument => f.write_str("invalid argument"),
            Error::InvalidConfig(why) => write!(f, "invalid config: {}", why),
        }
    }
}

impl From<FsError> for Error {
    fn from(err: FsError) -> Self {
        match err {
            FsError::NotFound | FsError::IsADirectory | FsError::NotADirectory => Error::NotFound,
            FsError::Io => Error::ReadError,
            FsError::ReadOnly => Error::ReadOnly,
        }
    }
}

impl From<ElfError> for Error {
    fn from(err: ElfError) -> Self {
        match err {
            ElfError::Map(MemoryError::OutOfMemory) => Error::OutOfMemory,
            other => Error::BadExecutable(other),
        }
    }
}

impl From<MemoryError> for Error {
    fn from(err: MemoryError) -> Self {
        match err {
            MemoryError::OutOfMemory => Error::OutOfMemory,
            MemoryError::NotMapped => Error::BadAddress,
        }
    }
}
