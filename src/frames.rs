//! Locating the thread state and walking the frame chain.

use std::fmt;

use crate::elf::ElfImage;
use crate::errors::{Error, SampleError};
use crate::maps::{self, LibraryLocation};
use crate::ptrace::{Pid, TracedProcess};
use crate::python;

/// Substring that identifies the interpreter shared library in the target's
/// memory map, e.g. in `/usr/lib64/libpython3.6m.so.1.0`.
pub const INTERPRETER_HINT: &str = "libpython";

/// Exported slot holding the interpreter's current thread state pointer.
const THREAD_STATE_SYMBOL: &str = "_PyThreadState_Current";

/// Longest filename the walker will accept from a code object. Anything
/// larger means we are not looking at a real string object.
const MAX_FILENAME_LEN: isize = 4096;

/// One Python call frame of the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    file: String,
    line: u32,
}

impl Frame {
    pub fn new(file: String, line: u32) -> Self {
        Frame { file, line }
    }

    pub fn file(&self) -> &str {
        &self.file
    }

    pub fn line(&self) -> u32 {
        self.line
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// Computes the runtime address of the `_PyThreadState_Current` slot in the
/// target.
///
/// The symbol usually lives in the libpython shared library, whose ASLR load
/// base comes from the memory map. A statically linked interpreter keeps it
/// in the main executable instead, at the link-time address. When the
/// primary image does not export the symbol at all, its direct `DT_NEEDED`
/// dependencies are tried in order; the search does not recurse further.
pub fn thread_state_addr(tracee: &TracedProcess) -> Result<usize, Error> {
    let pid = tracee.pid();
    let primary = match maps::locate_library(pid, INTERPRETER_HINT)? {
        Some(loc) => {
            log::debug!("interpreter library {} loaded at {:#x}", loc.path, loc.load_base);
            loc
        }
        None => {
            let exe = std::fs::read_link(format!("/proc/{pid}/exe"))
                .map_err(|source| Error::Exe { pid, source })?;
            log::debug!("no {INTERPRETER_HINT} mapping, falling back to {}", exe.display());
            LibraryLocation {
                load_base: 0,
                path: exe.to_string_lossy().into_owned(),
            }
        }
    };

    let image = ElfImage::open(&primary.path)?;
    let sections = image.parse()?;
    if let Some(value) = sections.resolve_symbol(THREAD_STATE_SYMBOL)? {
        return Ok(value as usize + primary.load_base);
    }

    for lib in sections.needed_libs()? {
        log::debug!(
            "{THREAD_STATE_SYMBOL} not in {}, trying {lib}",
            image.path().display()
        );
        // A dependency that cannot be located or parsed only disqualifies
        // itself; the remaining candidates still get their turn.
        match try_library(pid, &lib) {
            Ok(Some(addr)) => return Ok(addr),
            Ok(None) => {}
            Err(err) => log::warn!("skipping {lib}: {err}"),
        }
    }
    Err(Error::SymbolNotFound { pid })
}

/// Probes one dependency for the thread-state symbol. `Ok(None)` when the
/// library is not mapped into the target or does not export it.
fn try_library(pid: Pid, lib: &str) -> Result<Option<usize>, Error> {
    let Some(loc) = maps::locate_library(pid, lib)? else {
        return Ok(None);
    };
    let image = ElfImage::open(&loc.path)?;
    Ok(image
        .parse()?
        .resolve_symbol(THREAD_STATE_SYMBOL)?
        .map(|value| value as usize + loc.load_base))
}

/// Walks the frame linked list of the target's current thread.
///
/// `addr` is the runtime address of the thread-state-pointer slot from
/// [`thread_state_addr`]. The traversal starts at the tip and follows the
/// back-pointers outward, but the returned stack is ordered oldest frame
/// first; the caller reverses for display, most recent frame on top.
pub fn get_stack(tracee: &TracedProcess, addr: usize) -> Result<Vec<Frame>, SampleError> {
    let thread_state = tracee.peek_word(addr)?;
    if thread_state == 0 {
        // NULL whenever the GIL is released, e.g. during blocking I/O.
        return Err(SampleError::NoThreadState);
    }

    let mut frame = tracee.peek_word(python::thread_state_frame(thread_state))?;
    let mut stack = Vec::new();
    while frame != 0 {
        let code = tracee.peek_word(python::frame_code(frame))?;
        // f_lineno is a 32-bit field; the low half of the word is the value
        // on little-endian targets.
        let line = tracee.peek_word(python::frame_lineno(frame))? as u32;
        let filename = tracee.peek_word(python::code_filename(code))?;

        let size = tracee.peek_word(python::string_size(filename))? as isize;
        if size < 1 || size > MAX_FILENAME_LEN {
            return Err(SampleError::BadString {
                addr: filename,
                size,
            });
        }
        let file = tracee.peek_string(python::string_data(filename))?;
        stack.push(Frame::new(file, line));

        frame = tracee.peek_word(python::frame_back(frame))?;
    }
    // The walk visits newest-to-oldest; flip so callers hold the stack in
    // call order.
    stack.reverse();
    Ok(stack)
}
