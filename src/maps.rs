//! Locating the interpreter image in the target's memory map.
//!
//! `/proc/<pid>/maps` lines look like
//!
//! ```text
//! 7f5e3a863000-7f5e3aa52000 r-xp 00000000 fd:01 926127  /usr/lib64/libpython3.6m.so.1.0
//! ```
//!
//! The first `r-xp` entry whose line contains the caller's hint is taken to
//! be the interpreter's code segment; its start address is the ASLR load
//! base to add to unrelocated symbol values.

use std::fs::File;
use std::io::{BufRead, BufReader};

use crate::ptrace::Pid;

#[derive(Debug, thiserror::Error)]
pub enum MapsError {
    #[error("Failed to open {path}: {source}")]
    Open {
        path: String,
        source: std::io::Error,
    },
    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("Did not find absolute path in maps entry: {line}")]
    MissingPath { line: String },
    #[error("Did not find address range in maps entry: {line}")]
    MissingRange { line: String },
    #[error("Invalid load address in maps entry: {line}")]
    BadAddress { line: String },
}

/// A shared library found in the target's address space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryLocation {
    /// Runtime address the code segment is mapped at.
    pub load_base: usize,
    /// Absolute path of the backing file on disk.
    pub path: String,
}

/// Scans `/proc/<pid>/maps` for the first executable mapping whose line
/// contains `hint`. Returns `None` when nothing matches, which callers treat
/// as "not a separate shared library" and fall back to the main executable.
pub fn locate_library(pid: Pid, hint: &str) -> Result<Option<LibraryLocation>, MapsError> {
    let path = format!("/proc/{pid}/maps");
    let file = File::open(&path).map_err(|source| MapsError::Open {
        path: path.clone(),
        source,
    })?;
    find_in_maps(BufReader::new(file), hint, &path)
}

fn find_in_maps<R: BufRead>(
    reader: R,
    hint: &str,
    path: &str,
) -> Result<Option<LibraryLocation>, MapsError> {
    for line in reader.lines() {
        let line = line.map_err(|source| MapsError::Read {
            path: path.to_owned(),
            source,
        })?;
        if !line.contains(hint) || !line.contains(" r-xp ") {
            continue;
        }
        log::debug!("matched maps entry: {line}");
        let lib_path = match line.find('/') {
            Some(pos) => line[pos..].to_owned(),
            None => return Err(MapsError::MissingPath { line }),
        };
        let range_end = match line.find('-') {
            Some(pos) => pos,
            None => return Err(MapsError::MissingRange { line }),
        };
        let load_base = usize::from_str_radix(&line[..range_end], 16)
            .map_err(|_| MapsError::BadAddress { line: line.clone() })?;
        return Ok(Some(LibraryLocation {
            load_base,
            path: lib_path,
        }));
    }
    Ok(None)
}
