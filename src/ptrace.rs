//! Attaching to the target and reading its address space.
//!
//! All access to the target goes through [`TracedProcess`], which owns the
//! ptrace attachment: constructing it stops the target, dropping it lets the
//! target resume. Reads are word-sized `PTRACE_PEEKDATA` round-trips.

use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::wait::{self, WaitPidFlag};

pub type Pid = libc::pid_t;

const WORD_SIZE: usize = std::mem::size_of::<libc::c_long>();

#[derive(Debug, thiserror::Error)]
pub enum PtraceError {
    #[error("Failed to attach to PID {pid}: {source}")]
    Attach { pid: Pid, source: Errno },
    #[error("Failed to wait on PID {pid}: {source}")]
    Wait { pid: Pid, source: Errno },
    #[error("Failed to detach PID {pid}: {source}")]
    Detach { pid: Pid, source: Errno },
    #[error("Failed to PTRACE_PEEKDATA at {addr:#x}: {source}")]
    Peek { addr: usize, source: Errno },
}

/// An attached, stopped target process.
///
/// The attachment is released when [`detach`](Self::detach) is called or the
/// value is dropped, so every attach is paired with a detach on all
/// control-flow paths.
#[derive(Debug)]
pub struct TracedProcess {
    pid: nix::unistd::Pid,
    detached: bool,
}

impl TracedProcess {
    /// Stops `pid` and places the caller in the debugger role. Blocks until
    /// the kernel confirms the target has stopped.
    pub fn attach(pid: Pid) -> Result<Self, PtraceError> {
        let nix_pid = nix::unistd::Pid::from_raw(pid);
        ptrace::attach(nix_pid).map_err(|source| PtraceError::Attach { pid, source })?;
        loop {
            match wait::waitpid(nix_pid, Some(WaitPidFlag::__WALL)) {
                Ok(_) => break,
                Err(Errno::EINTR) => continue,
                Err(source) => {
                    // Leaving the target stopped on an error path would wedge
                    // it, so detach before reporting the wait failure.
                    let _ = ptrace::detach(nix_pid, None);
                    return Err(PtraceError::Wait { pid, source });
                }
            }
        }
        Ok(TracedProcess {
            pid: nix_pid,
            detached: false,
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid.as_raw()
    }

    /// Releases the target, allowing it to resume.
    pub fn detach(mut self) -> Result<(), PtraceError> {
        self.detached = true;
        ptrace::detach(self.pid, None).map_err(|source| PtraceError::Detach {
            pid: self.pid.as_raw(),
            source,
        })
    }

    /// Reads one machine word from the target at `addr`.
    ///
    /// `addr` is assumed to be word-aligned; on x86-64 the kernel also
    /// accepts unaligned addresses. A `-1` word is a legitimate value, not
    /// an error; nix reports failures out of band.
    pub fn peek_word(&self, addr: usize) -> Result<usize, PtraceError> {
        ptrace::read(self.pid, addr as ptrace::AddressType)
            .map(|word| word as usize)
            .map_err(|source| PtraceError::Peek { addr, source })
    }

    /// Reads a NUL-terminated string starting at `addr`, one word at a time,
    /// returning the bytes before the first zero byte.
    pub fn peek_string(&self, addr: usize) -> Result<String, PtraceError> {
        let mut bytes = Vec::new();
        let mut off = 0;
        loop {
            let word = self.peek_word(addr + off)?;
            let chunk = word.to_ne_bytes();
            match chunk.iter().position(|&b| b == 0) {
                Some(nul) => {
                    bytes.extend_from_slice(&chunk[..nul]);
                    break;
                }
                None => bytes.extend_from_slice(&chunk),
            }
            off += WORD_SIZE;
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Reads `nbytes` bytes starting at `addr`, rounded up to a word
    /// multiple. The returned buffer has the rounded length; bytes past the
    /// requested count are whatever the target had there.
    pub fn peek_bytes(&self, addr: usize, nbytes: usize) -> Result<Vec<u8>, PtraceError> {
        let rounded = nbytes.div_ceil(WORD_SIZE) * WORD_SIZE;
        let mut bytes = Vec::with_capacity(rounded);
        let mut off = 0;
        while off < rounded {
            let word = self.peek_word(addr + off)?;
            bytes.extend_from_slice(&word.to_ne_bytes());
            off += WORD_SIZE;
        }
        Ok(bytes)
    }
}

impl Drop for TracedProcess {
    fn drop(&mut self) {
        // Always release the target, even on error paths that skipped the
        // explicit detach. An undetached target stays stopped forever.
        if !self.detached {
            let _ = ptrace::detach(self.pid, None);
        }
    }
}
