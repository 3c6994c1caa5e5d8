//! On-disk ELF-64 inspection.
//!
//! The interpreter image is mapped read-only into our own address space and
//! parsed just far enough to answer two questions: which shared libraries
//! does it need (`DT_NEEDED`), and at what unrelocated address does it export
//! `_PyThreadState_Current`. Only the dynamic linking sections are resolved;
//! everything else in the file is ignored.

use std::fs::File;
use std::path::{Path, PathBuf};

use goblin::elf::dynamic::DT_NEEDED;
use goblin::elf::header::{EI_CLASS, ELFCLASS64, ELFMAG, SELFMAG};
use goblin::elf::section_header::{SHT_DYNAMIC, SHT_DYNSYM, SHT_STRTAB};
use goblin::elf64::dynamic::Dyn;
use goblin::elf64::header::Header;
use goblin::elf64::section_header::SectionHeader;
use goblin::elf64::sym::Sym;
use memmap2::Mmap;
use scroll::Pread;

#[derive(Debug, thiserror::Error)]
pub enum ElfError {
    #[error("Failed to open target {}: {source}", path.display())]
    Open { path: PathBuf, source: std::io::Error },
    #[error("Failed to mmap {}: {source}", path.display())]
    Mmap { path: PathBuf, source: std::io::Error },
    #[error("File {} does not have correct ELF magic header", path.display())]
    BadMagic { path: PathBuf },
    #[error("Currently only 64-bit ELF files are supported")]
    UnsupportedClass,
    #[error("Failed to find section {name}")]
    MissingSection { name: &'static str },
    #[error("Malformed ELF file {}: {what}", path.display())]
    Malformed { path: PathBuf, what: String },
    #[error(transparent)]
    Parse(#[from] scroll::Error),
    #[error(transparent)]
    Goblin(#[from] goblin::error::Error),
}

/// An ELF-64 file mapped read-only into the sampler's address space.
///
/// The mapping is released when the value drops; rebinding a variable to a
/// newly opened image releases the previous mapping the same way.
#[derive(Debug)]
pub struct ElfImage {
    path: PathBuf,
    data: Mmap,
}

/// The three dynamic-linking sections of a parsed image.
#[derive(Debug)]
pub struct DynamicSections<'elf> {
    image: &'elf ElfImage,
    dynamic: SectionHeader,
    dynstr: SectionHeader,
    dynsym: SectionHeader,
}

impl ElfImage {
    /// Maps `path` and validates the ELF identifier.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ElfError> {
        let path = path.as_ref().to_owned();
        let file = File::open(&path).map_err(|source| ElfError::Open {
            path: path.clone(),
            source,
        })?;
        // Safety: the mapping is PROT_READ and we never hand out mutable
        // views. A concurrent writer truncating the file could still fault
        // us, the same hazard the mmap(2) approach always has.
        let data = unsafe { Mmap::map(&file) }.map_err(|source| ElfError::Mmap {
            path: path.clone(),
            source,
        })?;
        drop(file);

        if data.len() < SELFMAG || data[..SELFMAG] != ELFMAG[..] {
            return Err(ElfError::BadMagic { path });
        }
        if data.get(EI_CLASS).copied() != Some(ELFCLASS64) {
            return Err(ElfError::UnsupportedClass);
        }
        Ok(ElfImage { path, data })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Walks the section headers and resolves `.dynamic`, `.dynstr` and
    /// `.dynsym`. Index 0 is reserved (`SHT_NULL`) and skipped.
    pub fn parse(&self) -> Result<DynamicSections<'_>, ElfError> {
        let header: Header = self.data.pread_with(0, scroll::LE)?;
        let shstrtab = self.section_header(&header, header.e_shstrndx)?;

        let mut dynamic = None;
        let mut dynstr = None;
        let mut dynsym = None;
        for idx in 1..header.e_shnum {
            let section = self.section_header(&header, idx)?;
            match section.sh_type {
                SHT_STRTAB => {
                    if self.str_at(&shstrtab, section.sh_name as u64)? == ".dynstr" {
                        dynstr = Some(section);
                    }
                }
                SHT_DYNSYM => dynsym = Some(section),
                SHT_DYNAMIC => dynamic = Some(section),
                _ => {}
            }
        }

        let dynamic = dynamic.ok_or(ElfError::MissingSection { name: ".dynamic" })?;
        let dynstr = dynstr.ok_or(ElfError::MissingSection { name: ".dynstr" })?;
        let dynsym = dynsym.ok_or(ElfError::MissingSection { name: ".dynsym" })?;
        Ok(DynamicSections {
            image: self,
            dynamic,
            dynstr,
            dynsym,
        })
    }

    fn section_header(&self, header: &Header, idx: u16) -> Result<SectionHeader, ElfError> {
        let offset = header.e_shoff as usize + idx as usize * header.e_shentsize as usize;
        Ok(self.data.pread_with(offset, scroll::LE)?)
    }

    /// Reads the NUL-terminated string at `offset` inside a string-table
    /// section.
    fn str_at(&self, strings: &SectionHeader, offset: u64) -> Result<&str, ElfError> {
        if offset >= strings.sh_size {
            return Err(self.malformed(format!(
                "string offset {offset:#x} out of section bounds"
            )));
        }
        let start = strings.sh_offset as usize + offset as usize;
        let end = strings.sh_offset as usize + strings.sh_size as usize;
        let table = self
            .data
            .get(start..end.min(self.data.len()))
            .ok_or_else(|| self.malformed("string table outside the file"))?;
        let nul = table
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| self.malformed("unterminated string in string table"))?;
        std::str::from_utf8(&table[..nul])
            .map_err(|_| self.malformed("non-UTF-8 name in string table"))
    }

    fn entries(&self, section: &SectionHeader) -> Result<impl Iterator<Item = usize>, ElfError> {
        if section.sh_entsize == 0 {
            return Err(self.malformed("section with zero sh_entsize"));
        }
        let base = section.sh_offset as usize;
        let entsize = section.sh_entsize as usize;
        let count = (section.sh_size / section.sh_entsize) as usize;
        Ok((0..count).map(move |i| base + i * entsize))
    }

    fn malformed(&self, what: impl Into<String>) -> ElfError {
        ElfError::Malformed {
            path: self.path.clone(),
            what: what.into(),
        }
    }
}

impl DynamicSections<'_> {
    /// Names of the `DT_NEEDED` entries, in table order. The same list
    /// `ldd(1)` prints as direct dependencies.
    pub fn needed_libs(&self) -> Result<Vec<String>, ElfError> {
        let mut needed = Vec::new();
        for offset in self.image.entries(&self.dynamic)? {
            let entry: Dyn = self.image.data.pread_with(offset, scroll::LE)?;
            if entry.d_tag == DT_NEEDED {
                needed.push(self.image.str_at(&self.dynstr, entry.d_val)?.to_owned());
            }
        }
        Ok(needed)
    }

    /// Looks `name` up in the dynamic symbol table. The returned value is
    /// the link-time virtual address; the caller adds the runtime load base.
    /// `None` when the image does not export the symbol.
    pub fn resolve_symbol(&self, name: &str) -> Result<Option<u64>, ElfError> {
        for offset in self.image.entries(&self.dynsym)? {
            let sym: Sym = self.image.data.pread_with(offset, scroll::LE)?;
            if self.image.str_at(&self.dynstr, sym.st_name as u64)? == name {
                return Ok(Some(sym.st_value));
            }
        }
        Ok(None)
    }
}
