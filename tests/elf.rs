//! ELF inspector tests against synthesised images.
//!
//! Small ELF-64 files are built in memory with the same goblin raw structs
//! the parser reads, written to disk, and fed through `ElfImage`. No binary
//! fixtures are checked in.

use goblin::elf::dynamic::{DT_NEEDED, DT_NULL};
use goblin::elf::header::{ELFCLASS32, ELFCLASS64, ELFDATA2LSB, ELFMAG, EM_X86_64, ET_DYN, EV_CURRENT};
use goblin::elf::section_header::{SHT_DYNAMIC, SHT_DYNSYM, SHT_STRTAB};
use goblin::elf64::dynamic::{Dyn, SIZEOF_DYN};
use goblin::elf64::header::{Header, SIZEOF_EHDR};
use goblin::elf64::section_header::{SectionHeader, SIZEOF_SHDR};
use goblin::elf64::sym::{Sym, SIZEOF_SYM};
use scroll::Pwrite;
use std::io::Write;

use pystack::elf::{ElfError, ElfImage};

/// Accumulates strings, handing out string-table offsets.
struct StringTable {
    data: Vec<u8>,
}

impl StringTable {
    fn new() -> Self {
        // Offset zero is the empty string by convention.
        StringTable { data: vec![0] }
    }

    fn add(&mut self, s: &str) -> u64 {
        let offset = self.data.len() as u64;
        self.data.extend_from_slice(s.as_bytes());
        self.data.push(0);
        offset
    }
}

struct TestElf<'a> {
    /// (name, st_value) pairs for `.dynsym`.
    symbols: &'a [(&'a str, u64)],
    /// `DT_NEEDED` names for `.dynamic`, in order.
    needed: &'a [&'a str],
    /// Leave out the `.dynamic` section entirely.
    omit_dynamic: bool,
}

fn align8(n: usize) -> usize {
    n.div_ceil(8) * 8
}

fn build_elf(elf: &TestElf<'_>) -> Vec<u8> {
    let mut dynstr = StringTable::new();
    let mut shstrtab = StringTable::new();

    let mut syms = vec![Sym::default()];
    for (name, value) in elf.symbols {
        syms.push(Sym {
            st_name: dynstr.add(name) as u32,
            st_value: *value,
            ..Sym::default()
        });
    }

    let mut dyns = Vec::new();
    for name in elf.needed {
        dyns.push(Dyn {
            d_tag: DT_NEEDED,
            d_val: dynstr.add(name),
        });
    }
    dyns.push(Dyn {
        d_tag: DT_NULL,
        d_val: 0,
    });

    let dynstr_name = shstrtab.add(".dynstr");
    let dynsym_name = shstrtab.add(".dynsym");
    let dynamic_name = shstrtab.add(".dynamic");
    let shstrtab_name = shstrtab.add(".shstrtab");

    let dynstr_off = SIZEOF_EHDR;
    let dynsym_off = align8(dynstr_off + dynstr.data.len());
    let dynamic_off = align8(dynsym_off + syms.len() * SIZEOF_SYM);
    let shstrtab_off = dynamic_off + dyns.len() * SIZEOF_DYN;
    let shdr_off = align8(shstrtab_off + shstrtab.data.len());

    let mut sections = vec![
        SectionHeader::default(),
        SectionHeader {
            sh_name: dynstr_name as u32,
            sh_type: SHT_STRTAB,
            sh_offset: dynstr_off as u64,
            sh_size: dynstr.data.len() as u64,
            ..SectionHeader::default()
        },
        SectionHeader {
            sh_name: dynsym_name as u32,
            sh_type: SHT_DYNSYM,
            sh_offset: dynsym_off as u64,
            sh_size: (syms.len() * SIZEOF_SYM) as u64,
            sh_entsize: SIZEOF_SYM as u64,
            sh_link: 1,
            ..SectionHeader::default()
        },
    ];
    if !elf.omit_dynamic {
        sections.push(SectionHeader {
            sh_name: dynamic_name as u32,
            sh_type: SHT_DYNAMIC,
            sh_offset: dynamic_off as u64,
            sh_size: (dyns.len() * SIZEOF_DYN) as u64,
            sh_entsize: SIZEOF_DYN as u64,
            sh_link: 1,
            ..SectionHeader::default()
        });
    }
    sections.push(SectionHeader {
        sh_name: shstrtab_name as u32,
        sh_type: SHT_STRTAB,
        sh_offset: shstrtab_off as u64,
        sh_size: shstrtab.data.len() as u64,
        ..SectionHeader::default()
    });

    let mut ident = [0u8; 16];
    ident[..4].copy_from_slice(&ELFMAG[..]);
    ident[4] = ELFCLASS64;
    ident[5] = ELFDATA2LSB;
    ident[6] = EV_CURRENT;
    let header = Header {
        e_ident: ident,
        e_type: ET_DYN,
        e_machine: EM_X86_64,
        e_version: EV_CURRENT as u32,
        e_shoff: shdr_off as u64,
        e_ehsize: SIZEOF_EHDR as u16,
        e_shentsize: SIZEOF_SHDR as u16,
        e_shnum: sections.len() as u16,
        e_shstrndx: (sections.len() - 1) as u16,
        ..Header::default()
    };

    let total = shdr_off + sections.len() * SIZEOF_SHDR;
    let mut image = vec![0u8; total];
    image.pwrite_with(header, 0, scroll::LE).unwrap();
    image[dynstr_off..dynstr_off + dynstr.data.len()].copy_from_slice(&dynstr.data);
    for (i, sym) in syms.iter().enumerate() {
        image
            .pwrite_with(*sym, dynsym_off + i * SIZEOF_SYM, scroll::LE)
            .unwrap();
    }
    for (i, dyn_) in dyns.iter().enumerate() {
        image
            .pwrite_with(*dyn_, dynamic_off + i * SIZEOF_DYN, scroll::LE)
            .unwrap();
    }
    image[shstrtab_off..shstrtab_off + shstrtab.data.len()].copy_from_slice(&shstrtab.data);
    for (i, section) in sections.iter().enumerate() {
        image
            .pwrite_with(*section, shdr_off + i * SIZEOF_SHDR, scroll::LE)
            .unwrap();
    }
    image
}

fn write_image(bytes: &[u8]) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(bytes).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn resolves_thread_state_symbol() {
    let image = build_elf(&TestElf {
        symbols: &[("PyEval_EvalFrameEx", 0x1000), ("_PyThreadState_Current", 0x2f4f60)],
        needed: &["libc.so.6"],
        omit_dynamic: false,
    });
    let file = write_image(&image);

    let elf = ElfImage::open(file.path()).unwrap();
    let sections = elf.parse().unwrap();
    assert_eq!(
        sections.resolve_symbol("_PyThreadState_Current").unwrap(),
        Some(0x2f4f60)
    );
}

#[test]
fn absent_symbol_is_none() {
    let image = build_elf(&TestElf {
        symbols: &[("PyEval_EvalFrameEx", 0x1000)],
        needed: &[],
        omit_dynamic: false,
    });
    let file = write_image(&image);

    let elf = ElfImage::open(file.path()).unwrap();
    let sections = elf.parse().unwrap();
    assert_eq!(sections.resolve_symbol("_PyThreadState_Current").unwrap(), None);
}

#[test]
fn needed_libs_preserve_order() {
    let image = build_elf(&TestElf {
        symbols: &[],
        needed: &["libpython3.6m.so.1.0", "libpthread.so.0", "libc.so.6"],
        omit_dynamic: false,
    });
    let file = write_image(&image);

    let elf = ElfImage::open(file.path()).unwrap();
    let sections = elf.parse().unwrap();
    assert_eq!(
        sections.needed_libs().unwrap(),
        vec!["libpython3.6m.so.1.0", "libpthread.so.0", "libc.so.6"]
    );
}

#[test]
fn missing_dynamic_section_is_reported() {
    let image = build_elf(&TestElf {
        symbols: &[("_PyThreadState_Current", 0x2f4f60)],
        needed: &[],
        omit_dynamic: true,
    });
    let file = write_image(&image);

    let elf = ElfImage::open(file.path()).unwrap();
    let err = elf.parse().unwrap_err();
    assert!(matches!(err, ElfError::MissingSection { name: ".dynamic" }));
    assert_eq!(err.to_string(), "Failed to find section .dynamic");
}

#[test]
fn rejects_bad_magic() {
    let file = write_image(b"\x7fFLE this is not an elf file at all");
    let err = ElfImage::open(file.path()).unwrap_err();
    assert!(matches!(err, ElfError::BadMagic { .. }));
    assert!(err.to_string().contains("does not have correct ELF magic header"));
}

#[test]
fn rejects_32bit_class() {
    let mut image = build_elf(&TestElf {
        symbols: &[],
        needed: &[],
        omit_dynamic: false,
    });
    image[4] = ELFCLASS32;
    let file = write_image(&image);

    let err = ElfImage::open(file.path()).unwrap_err();
    assert!(matches!(err, ElfError::UnsupportedClass));
    assert_eq!(
        err.to_string(),
        "Currently only 64-bit ELF files are supported"
    );
}
