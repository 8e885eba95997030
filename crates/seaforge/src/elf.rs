//! ELF resource injection.
//!
//! The runtime finds its blob by walking the program headers of the loaded
//! image for a `PT_NOTE` whose note name equals the resource name, so the
//! note has to be mapped. Nothing existing is moved; instead one region is
//! appended at the end of the file:
//!
//! ```text
//! +-------------------------+  <- new PT_LOAD (read-only), page aligned
//! | program header table    |     old entries + PT_LOAD + PT_NOTE
//! | note (name, payload)    |  <- new PT_NOTE / SHT_NOTE section
//! +-------------------------+
//! | .shstrtab copy + name   |  (not loaded)
//! | section header table    |  old entries + note section
//! +-------------------------+
//! ```
//!
//! `e_phoff`, `e_phnum`, `PT_PHDR`, `e_shoff`, `e_shnum` and the `.shstrtab`
//! header are updated to point at the relocated tables.

use crate::constants::{ELF_PAGE_SIZE, PF_R, PT_LOAD, PT_NOTE, PT_PHDR, SHF_ALLOC, SHT_NOTE};
use crate::image::{align_to, read_u16, read_u32, read_u64, slice, write_u16, write_u32, write_u64};
use crate::{Error, Result};
use goblin::elf::Elf;

const EI_CLASS: usize = 4;
const EI_DATA: usize = 5;
const ELFCLASS32: u8 = 1;
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const ELFDATA2MSB: u8 = 2;

/// e_shnum values at or above this use the extended numbering scheme.
const SHN_LORESERVE: u16 = 0xff00;

/// Note type of the injected resource.
const NOTE_TYPE: u32 = 0;

/// Class and byte order of an ELF file, plus its header fields.
#[derive(Debug, Clone, Copy)]
struct ElfHeader {
    is_64: bool,
    big_endian: bool,
    phoff: u64,
    phentsize: u16,
    phnum: u16,
    shoff: u64,
    shentsize: u16,
    shnum: u16,
    shstrndx: u16,
}

impl ElfHeader {
    fn parse(data: &[u8]) -> Result<Self> {
        let is_64 = match slice(data, EI_CLASS, 1)?[0] {
            ELFCLASS32 => false,
            ELFCLASS64 => true,
            other => {
                return Err(Error::MalformedImage(format!("unknown ELF class {other}")))
            }
        };
        let big_endian = match slice(data, EI_DATA, 1)?[0] {
            ELFDATA2LSB => false,
            ELFDATA2MSB => true,
            other => {
                return Err(Error::MalformedImage(format!("unknown ELF data encoding {other}")))
            }
        };

        let be = big_endian;
        let header = if is_64 {
            ElfHeader {
                is_64,
                big_endian,
                phoff: read_u64(data, 32, be)?,
                shoff: read_u64(data, 40, be)?,
                phentsize: read_u16(data, 54, be)?,
                phnum: read_u16(data, 56, be)?,
                shentsize: read_u16(data, 58, be)?,
                shnum: read_u16(data, 60, be)?,
                shstrndx: read_u16(data, 62, be)?,
            }
        } else {
            ElfHeader {
                is_64,
                big_endian,
                phoff: read_u32(data, 28, be)? as u64,
                shoff: read_u32(data, 32, be)? as u64,
                phentsize: read_u16(data, 42, be)?,
                phnum: read_u16(data, 44, be)?,
                shentsize: read_u16(data, 46, be)?,
                shnum: read_u16(data, 48, be)?,
                shstrndx: read_u16(data, 50, be)?,
            }
        };

        let (ph_size, sh_size) = if is_64 { (56, 64) } else { (32, 40) };
        if header.phnum > 0 && header.phentsize != ph_size {
            return Err(Error::MalformedImage(format!(
                "unexpected program header size {}",
                header.phentsize
            )));
        }
        if header.shnum > 0 && header.shentsize != sh_size {
            return Err(Error::MalformedImage(format!(
                "unexpected section header size {}",
                header.shentsize
            )));
        }
        if header.shnum >= SHN_LORESERVE || header.shstrndx >= SHN_LORESERVE {
            return Err(Error::InsufficientSpace(
                "extended section numbering is not supported".into(),
            ));
        }

        Ok(header)
    }

    fn ph_size(&self) -> usize {
        if self.is_64 {
            56
        } else {
            32
        }
    }

    fn sh_size(&self) -> usize {
        if self.is_64 {
            64
        } else {
            40
        }
    }

    /// Store the header fields that injection changes.
    fn write(&self, data: &mut [u8]) -> Result<()> {
        let be = self.big_endian;
        if self.is_64 {
            write_u64(data, 32, self.phoff, be)?;
            write_u64(data, 40, self.shoff, be)?;
            write_u16(data, 56, self.phnum, be)?;
            write_u16(data, 60, self.shnum, be)
        } else {
            write_u32(data, 28, narrow(self.phoff)?, be)?;
            write_u32(data, 32, narrow(self.shoff)?, be)?;
            write_u16(data, 44, self.phnum, be)?;
            write_u16(data, 48, self.shnum, be)
        }
    }
}

fn narrow(value: u64) -> Result<u32> {
    u32::try_from(value).map_err(|_| {
        Error::InsufficientSpace(format!("offset {value:#x} does not fit an ELF32 field"))
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ProgramHeader {
    p_type: u32,
    p_flags: u32,
    p_offset: u64,
    p_vaddr: u64,
    p_paddr: u64,
    p_filesz: u64,
    p_memsz: u64,
    p_align: u64,
}

impl ProgramHeader {
    fn read(data: &[u8], at: usize, hdr: &ElfHeader) -> Result<Self> {
        let be = hdr.big_endian;
        if hdr.is_64 {
            Ok(Self {
                p_type: read_u32(data, at, be)?,
                p_flags: read_u32(data, at + 4, be)?,
                p_offset: read_u64(data, at + 8, be)?,
                p_vaddr: read_u64(data, at + 16, be)?,
                p_paddr: read_u64(data, at + 24, be)?,
                p_filesz: read_u64(data, at + 32, be)?,
                p_memsz: read_u64(data, at + 40, be)?,
                p_align: read_u64(data, at + 48, be)?,
            })
        } else {
            Ok(Self {
                p_type: read_u32(data, at, be)?,
                p_offset: read_u32(data, at + 4, be)? as u64,
                p_vaddr: read_u32(data, at + 8, be)? as u64,
                p_paddr: read_u32(data, at + 12, be)? as u64,
                p_filesz: read_u32(data, at + 16, be)? as u64,
                p_memsz: read_u32(data, at + 20, be)? as u64,
                p_flags: read_u32(data, at + 24, be)?,
                p_align: read_u32(data, at + 28, be)? as u64,
            })
        }
    }

    fn write(&self, data: &mut [u8], at: usize, hdr: &ElfHeader) -> Result<()> {
        let be = hdr.big_endian;
        if hdr.is_64 {
            write_u32(data, at, self.p_type, be)?;
            write_u32(data, at + 4, self.p_flags, be)?;
            write_u64(data, at + 8, self.p_offset, be)?;
            write_u64(data, at + 16, self.p_vaddr, be)?;
            write_u64(data, at + 24, self.p_paddr, be)?;
            write_u64(data, at + 32, self.p_filesz, be)?;
            write_u64(data, at + 40, self.p_memsz, be)?;
            write_u64(data, at + 48, self.p_align, be)
        } else {
            write_u32(data, at, self.p_type, be)?;
            write_u32(data, at + 4, narrow(self.p_offset)?, be)?;
            write_u32(data, at + 8, narrow(self.p_vaddr)?, be)?;
            write_u32(data, at + 12, narrow(self.p_paddr)?, be)?;
            write_u32(data, at + 16, narrow(self.p_filesz)?, be)?;
            write_u32(data, at + 20, narrow(self.p_memsz)?, be)?;
            write_u32(data, at + 24, self.p_flags, be)?;
            write_u32(data, at + 28, narrow(self.p_align)?, be)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SectionHeader {
    sh_name: u32,
    sh_type: u32,
    sh_flags: u64,
    sh_addr: u64,
    sh_offset: u64,
    sh_size: u64,
    sh_link: u32,
    sh_info: u32,
    sh_addralign: u64,
    sh_entsize: u64,
}

impl SectionHeader {
    fn read(data: &[u8], at: usize, hdr: &ElfHeader) -> Result<Self> {
        let be = hdr.big_endian;
        if hdr.is_64 {
            Ok(Self {
                sh_name: read_u32(data, at, be)?,
                sh_type: read_u32(data, at + 4, be)?,
                sh_flags: read_u64(data, at + 8, be)?,
                sh_addr: read_u64(data, at + 16, be)?,
                sh_offset: read_u64(data, at + 24, be)?,
                sh_size: read_u64(data, at + 32, be)?,
                sh_link: read_u32(data, at + 40, be)?,
                sh_info: read_u32(data, at + 44, be)?,
                sh_addralign: read_u64(data, at + 48, be)?,
                sh_entsize: read_u64(data, at + 56, be)?,
            })
        } else {
            Ok(Self {
                sh_name: read_u32(data, at, be)?,
                sh_type: read_u32(data, at + 4, be)?,
                sh_flags: read_u32(data, at + 8, be)? as u64,
                sh_addr: read_u32(data, at + 12, be)? as u64,
                sh_offset: read_u32(data, at + 16, be)? as u64,
                sh_size: read_u32(data, at + 20, be)? as u64,
                sh_link: read_u32(data, at + 24, be)?,
                sh_info: read_u32(data, at + 28, be)?,
                sh_addralign: read_u32(data, at + 32, be)? as u64,
                sh_entsize: read_u32(data, at + 36, be)? as u64,
            })
        }
    }

    fn write(&self, data: &mut [u8], at: usize, hdr: &ElfHeader) -> Result<()> {
        let be = hdr.big_endian;
        if hdr.is_64 {
            write_u32(data, at, self.sh_name, be)?;
            write_u32(data, at + 4, self.sh_type, be)?;
            write_u64(data, at + 8, self.sh_flags, be)?;
            write_u64(data, at + 16, self.sh_addr, be)?;
            write_u64(data, at + 24, self.sh_offset, be)?;
            write_u64(data, at + 32, self.sh_size, be)?;
            write_u32(data, at + 40, self.sh_link, be)?;
            write_u32(data, at + 44, self.sh_info, be)?;
            write_u64(data, at + 48, self.sh_addralign, be)?;
            write_u64(data, at + 56, self.sh_entsize, be)
        } else {
            write_u32(data, at, self.sh_name, be)?;
            write_u32(data, at + 4, self.sh_type, be)?;
            write_u32(data, at + 8, narrow(self.sh_flags)?, be)?;
            write_u32(data, at + 12, narrow(self.sh_addr)?, be)?;
            write_u32(data, at + 16, narrow(self.sh_offset)?, be)?;
            write_u32(data, at + 20, narrow(self.sh_size)?, be)?;
            write_u32(data, at + 24, self.sh_link, be)?;
            write_u32(data, at + 28, self.sh_info, be)?;
            write_u32(data, at + 32, narrow(self.sh_addralign)?, be)?;
            write_u32(data, at + 36, narrow(self.sh_entsize)?, be)
        }
    }
}

/// A parsed ELF file: header plus both header tables.
struct ElfFile {
    header: ElfHeader,
    program_headers: Vec<ProgramHeader>,
    section_headers: Vec<SectionHeader>,
}

impl ElfFile {
    fn parse(data: &[u8]) -> Result<Self> {
        Elf::parse(data).map_err(|e| Error::MalformedImage(format!("Failed to parse ELF: {}", e)))?;

        let header = ElfHeader::parse(data)?;
        let mut program_headers = Vec::with_capacity(header.phnum as usize);
        for i in 0..header.phnum as usize {
            let at = header.phoff as usize + i * header.ph_size();
            program_headers.push(ProgramHeader::read(data, at, &header)?);
        }
        let mut section_headers = Vec::with_capacity(header.shnum as usize);
        if header.shoff != 0 {
            for i in 0..header.shnum as usize {
                let at = header.shoff as usize + i * header.sh_size();
                section_headers.push(SectionHeader::read(data, at, &header)?);
            }
        }

        Ok(Self {
            header,
            program_headers,
            section_headers,
        })
    }

    /// Iterate `(name, desc, desc_file_offset)` over every note in PT_NOTE segments.
    fn notes<'a>(&self, data: &'a [u8]) -> Result<Vec<(&'a [u8], &'a [u8], u64)>> {
        let be = self.header.big_endian;
        let mut notes = Vec::new();
        for ph in self.program_headers.iter().filter(|p| p.p_type == PT_NOTE) {
            let start = ph.p_offset as usize;
            let end = start + slice(data, start, ph.p_filesz as usize)?.len();

            let mut at = start;
            while at + 12 <= end {
                let namesz = read_u32(data, at, be)? as usize;
                let descsz = read_u32(data, at + 4, be)? as usize;
                let name_at = at + 12;
                let desc_at = name_at + align_to(namesz as u64, 4) as usize;
                let next = desc_at + align_to(descsz as u64, 4) as usize;
                if desc_at + descsz > end {
                    return Err(Error::MalformedImage(format!(
                        "note at {at:#x} runs past its segment"
                    )));
                }
                let name = slice(data, name_at, namesz)?;
                let name = name.strip_suffix(&[0]).unwrap_or(name);
                notes.push((name, slice(data, desc_at, descsz)?, desc_at as u64));
                at = next;
            }
        }
        Ok(notes)
    }
}

/// Check that the headers parse; ELF carries no platform signature.
pub fn validate(data: &[u8]) -> Result<()> {
    ElfFile::parse(data).map(|_| ())
}

/// Read back the note named `name`.
pub fn read_resource(data: &[u8], name: &str) -> Result<Option<Vec<u8>>> {
    let elf = ElfFile::parse(data)?;
    Ok(elf
        .notes(data)?
        .into_iter()
        .find(|(n, _, _)| *n == name.as_bytes())
        .map(|(_, desc, _)| desc.to_vec()))
}

/// Whether a note named `name` is already mapped.
pub fn has_resource(data: &[u8], name: &str) -> Result<bool> {
    let elf = ElfFile::parse(data)?;
    Ok(elf.notes(data)?.iter().any(|(n, _, _)| *n == name.as_bytes()))
}

/// Encode an ELF note record.
fn build_note(name: &str, payload: &[u8], big_endian: bool) -> Result<Vec<u8>> {
    let namesz = name.len() as u32 + 1;
    let descsz = u32::try_from(payload.len()).map_err(|_| {
        Error::InsufficientSpace("payload does not fit in an ELF note".into())
    })?;

    let mut note = vec![0u8; 12];
    write_u32(&mut note, 0, namesz, big_endian)?;
    write_u32(&mut note, 4, descsz, big_endian)?;
    write_u32(&mut note, 8, NOTE_TYPE, big_endian)?;
    note.extend_from_slice(name.as_bytes());
    note.push(0);
    note.resize(align_to(note.len() as u64, 4) as usize, 0);
    note.extend_from_slice(payload);
    note.resize(align_to(note.len() as u64, 4) as usize, 0);
    Ok(note)
}

/// Injects `payload` as a mapped note named `name`.
///
/// Returns the rebuilt image and the file offset of the payload. The input is
/// never modified.
///
/// # Errors
///
/// - [`Error::DuplicateResource`] if a note with that name is already mapped
/// - [`Error::InsufficientSpace`] if header counts or ELF32 fields overflow
/// - [`Error::MalformedImage`] if the headers are corrupt
pub fn inject_resource(data: &[u8], name: &str, payload: &[u8]) -> Result<(Vec<u8>, u64)> {
    if has_resource(data, name)? {
        return Err(Error::DuplicateResource(format!("ELF note {name} already exists")));
    }
    let elf = ElfFile::parse(data)?;
    let mut header = elf.header;

    let loads: Vec<&ProgramHeader> = elf
        .program_headers
        .iter()
        .filter(|p| p.p_type == PT_LOAD)
        .collect();
    if loads.is_empty() {
        return Err(Error::MalformedImage("no PT_LOAD segment to extend".into()));
    }
    let page = loads
        .iter()
        .map(|p| p.p_align)
        .fold(ELF_PAGE_SIZE, u64::max);
    let vm_end = loads.iter().map(|p| p.p_vaddr + p.p_memsz).max().unwrap_or(0);

    let phnum = header
        .phnum
        .checked_add(2)
        .ok_or_else(|| Error::InsufficientSpace("too many program headers".into()))?;
    let ph_size = header.ph_size();

    // Region layout
    let region = align_to(data.len() as u64, page);
    let table_len = phnum as u64 * ph_size as u64;
    let note = build_note(name, payload, header.big_endian)?;
    let note_offset = region + align_to(table_len, 8);
    let payload_offset = note_offset + 12 + align_to(name.len() as u64 + 1, 4);
    let load_len = note_offset + note.len() as u64 - region;
    let load_vaddr = align_to(vm_end, page);
    let note_vaddr = load_vaddr + (note_offset - region);

    // Program headers: new PT_LOAD after the last existing one keeps them
    // sorted by address; the note goes last.
    let new_load = ProgramHeader {
        p_type: PT_LOAD,
        p_flags: PF_R,
        p_offset: region,
        p_vaddr: load_vaddr,
        p_paddr: load_vaddr,
        p_filesz: load_len,
        p_memsz: load_len,
        p_align: page,
    };
    let new_note = ProgramHeader {
        p_type: PT_NOTE,
        p_flags: PF_R,
        p_offset: note_offset,
        p_vaddr: note_vaddr,
        p_paddr: note_vaddr,
        p_filesz: note.len() as u64,
        p_memsz: note.len() as u64,
        p_align: 4,
    };
    let last_load = elf
        .program_headers
        .iter()
        .rposition(|p| p.p_type == PT_LOAD)
        .unwrap_or(elf.program_headers.len() - 1);
    let mut program_headers = elf.program_headers.clone();
    program_headers.insert(last_load + 1, new_load);
    program_headers.push(new_note);
    for ph in program_headers.iter_mut().filter(|p| p.p_type == PT_PHDR) {
        ph.p_offset = region;
        ph.p_vaddr = load_vaddr;
        ph.p_paddr = load_vaddr;
        ph.p_filesz = table_len;
        ph.p_memsz = table_len;
    }

    let mut out = data.to_vec();
    out.resize((note_offset + note.len() as u64) as usize, 0);
    for (i, ph) in program_headers.iter().enumerate() {
        ph.write(&mut out, region as usize + i * ph_size, &header)?;
    }
    out[note_offset as usize..].copy_from_slice(&note);
    header.phoff = region;
    header.phnum = phnum;

    if !elf.section_headers.is_empty() {
        let strndx = header.shstrndx as usize;
        let strtab = elf.section_headers.get(strndx).ok_or_else(|| {
            Error::MalformedImage(format!("e_shstrndx {strndx} is out of range"))
        })?;

        let strtab_offset = out.len() as u64;
        let name_index = strtab.sh_size;
        out.extend_from_slice(slice(data, strtab.sh_offset as usize, strtab.sh_size as usize)?);
        out.extend_from_slice(name.as_bytes());
        out.push(0);
        let strtab_len = out.len() as u64 - strtab_offset;

        let mut section_headers = elf.section_headers.clone();
        section_headers[strndx].sh_offset = strtab_offset;
        section_headers[strndx].sh_size = strtab_len;
        section_headers.push(SectionHeader {
            sh_name: u32::try_from(name_index)
                .map_err(|_| Error::InsufficientSpace("section name table is too large".into()))?,
            sh_type: SHT_NOTE,
            sh_flags: SHF_ALLOC,
            sh_addr: note_vaddr,
            sh_offset: note_offset,
            sh_size: note.len() as u64,
            sh_link: 0,
            sh_info: 0,
            sh_addralign: 4,
            sh_entsize: 0,
        });

        let shoff = align_to(out.len() as u64, 8);
        let sh_size = header.sh_size();
        out.resize(shoff as usize + section_headers.len() * sh_size, 0);
        for (i, sh) in section_headers.iter().enumerate() {
            sh.write(&mut out, shoff as usize + i * sh_size, &header)?;
        }
        header.shoff = shoff;
        header.shnum = section_headers.len() as u16;
        if header.shnum >= SHN_LORESERVE {
            return Err(Error::InsufficientSpace("too many section headers".into()));
        }
    }

    header.write(&mut out)?;
    Ok((out, payload_offset))
}
