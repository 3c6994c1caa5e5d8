//! The two error kinds of a sampling run.
//!
//! [`Error`] is fatal: the run aborts, the exit code is non-zero. A
//! [`SampleError`] only loses the in-flight sample; repeated sampling logs
//! it and keeps going, and a single-sample run still exits zero.

use crate::elf::ElfError;
use crate::maps::MapsError;
use crate::ptrace::{Pid, PtraceError};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Ptrace(#[from] PtraceError),
    #[error(transparent)]
    Maps(#[from] MapsError),
    #[error(transparent)]
    Elf(#[from] ElfError),
    #[error("Failed to read /proc/{pid}/exe: {source}")]
    Exe { pid: Pid, source: std::io::Error },
    #[error("Failed to find _PyThreadState_Current for PID {pid}")]
    SymbolNotFound { pid: Pid },
}

/// A walk that could not complete, usually because the interpreter was
/// caught mid-transition and a pointer led somewhere unreadable.
#[derive(Debug, thiserror::Error)]
pub enum SampleError {
    #[error(transparent)]
    Ptrace(#[from] PtraceError),
    #[error("Interpreter has no current thread state")]
    NoThreadState,
    #[error("Implausible size {size} for interpreter string at {addr:#x}")]
    BadString { addr: usize, size: isize },
}
