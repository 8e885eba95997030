//! Minimal host images for unit tests.
//!
//! Each builder lays out a tiny but structurally valid executable carrying an
//! unarmed sentinel, so the format writers and the pipeline can be exercised
//! without a real runtime binary on disk.

use crate::constants::SENTINEL_FUSE;
use crate::image::{write_u16, write_u32, write_u64};
use crate::pe::parser::update_checksum;

/// Fuse plus an unarmed flag.
pub fn unarmed_sentinel() -> Vec<u8> {
    format!("{SENTINEL_FUSE}:0").into_bytes()
}

// =============================================================================
// PE
// =============================================================================

/// Bytes of the icon leaf in the fixture's `.rsrc`.
pub const PE_ICON_DATA: &[u8; 8] = b"ICONDATA";

/// RVA of [`PE_ICON_DATA`].
pub const PE_ICON_RVA: u32 = 0x2080;

/// File offset of the sentinel inside `.text`.
pub const PE_SENTINEL_OFFSET: usize = 0x220;

#[derive(Debug, Clone)]
pub struct PeFixture {
    /// Append a 16-byte certificate table after the last section.
    pub signed: bool,
    /// Populate `.rsrc` with an `RT_ICON / 1 / 0x409` leaf.
    pub with_resources: bool,
    pub sentinel: bool,
}

impl Default for PeFixture {
    fn default() -> Self {
        Self {
            signed: false,
            with_resources: true,
            sentinel: true,
        }
    }
}

/// Build a PE32+ image with `.text` and `.rsrc` and one free section slot.
pub fn pe_image(fixture: &PeFixture) -> Vec<u8> {
    let mut data = vec![0u8; 0x600];

    // DOS header
    data[0..2].copy_from_slice(b"MZ");
    write_u32(&mut data, 0x3c, 0x80, false).unwrap();
    data[0x80..0x84].copy_from_slice(b"PE\0\0");

    // COFF header
    let coff = 0x84;
    write_u16(&mut data, coff, 0x8664, false).unwrap();
    write_u16(&mut data, coff + 2, 2, false).unwrap();
    write_u16(&mut data, coff + 16, 0xf0, false).unwrap();
    write_u16(&mut data, coff + 18, 0x22, false).unwrap();

    // Optional header (PE32+)
    let opt = 0x98;
    write_u16(&mut data, opt, 0x20b, false).unwrap();
    write_u32(&mut data, opt + 4, 0x200, false).unwrap(); // SizeOfCode
    write_u32(&mut data, opt + 8, 0x200, false).unwrap(); // SizeOfInitializedData
    write_u32(&mut data, opt + 16, 0x1000, false).unwrap(); // AddressOfEntryPoint
    write_u32(&mut data, opt + 20, 0x1000, false).unwrap(); // BaseOfCode
    write_u64(&mut data, opt + 24, 0x1_4000_0000, false).unwrap();
    write_u32(&mut data, opt + 32, 0x1000, false).unwrap();
    write_u32(&mut data, opt + 36, 0x200, false).unwrap();
    write_u16(&mut data, opt + 40, 6, false).unwrap();
    write_u16(&mut data, opt + 48, 6, false).unwrap();
    write_u32(&mut data, opt + 56, 0x3000, false).unwrap();
    write_u32(&mut data, opt + 60, 0x200, false).unwrap();
    write_u16(&mut data, opt + 68, 3, false).unwrap();
    write_u16(&mut data, opt + 70, 0x8160, false).unwrap();
    write_u64(&mut data, opt + 72, 0x10_0000, false).unwrap();
    write_u64(&mut data, opt + 80, 0x1000, false).unwrap();
    write_u64(&mut data, opt + 88, 0x10_0000, false).unwrap();
    write_u64(&mut data, opt + 96, 0x1000, false).unwrap();
    write_u32(&mut data, opt + 108, 16, false).unwrap();

    // Section table
    let sections = opt + 0xf0;
    let table: [(&[u8; 8], u32, u32, u32, u32, u32); 2] = [
        (b".text\0\0\0", 0x100, 0x1000, 0x200, 0x200, 0x6000_0020),
        (b".rsrc\0\0\0", 0x100, 0x2000, 0x200, 0x400, 0x4000_0040),
    ];
    for (i, (name, vsize, va, raw_size, raw_ptr, chars)) in table.iter().enumerate() {
        let at = sections + i * 40;
        data[at..at + 8].copy_from_slice(*name);
        write_u32(&mut data, at + 8, *vsize, false).unwrap();
        write_u32(&mut data, at + 12, *va, false).unwrap();
        write_u32(&mut data, at + 16, *raw_size, false).unwrap();
        write_u32(&mut data, at + 20, *raw_ptr, false).unwrap();
        write_u32(&mut data, at + 36, *chars, false).unwrap();
    }

    // .text: a ret followed by the fuse
    data[0x200] = 0xc3;
    if fixture.sentinel {
        let fuse = unarmed_sentinel();
        data[PE_SENTINEL_OFFSET..PE_SENTINEL_OFFSET + fuse.len()].copy_from_slice(&fuse);
    }

    if fixture.with_resources {
        let rsrc = 0x400;
        // root -> type 3
        write_u16(&mut data, rsrc + 14, 1, false).unwrap();
        write_u32(&mut data, rsrc + 16, 3, false).unwrap();
        write_u32(&mut data, rsrc + 20, 0x8000_0000 | 24, false).unwrap();
        // type 3 -> id 1
        write_u16(&mut data, rsrc + 24 + 14, 1, false).unwrap();
        write_u32(&mut data, rsrc + 40, 1, false).unwrap();
        write_u32(&mut data, rsrc + 44, 0x8000_0000 | 48, false).unwrap();
        // id 1 -> language 0x409
        write_u16(&mut data, rsrc + 48 + 14, 1, false).unwrap();
        write_u32(&mut data, rsrc + 64, 0x409, false).unwrap();
        write_u32(&mut data, rsrc + 68, 72, false).unwrap();
        // data entry
        write_u32(&mut data, rsrc + 72, PE_ICON_RVA, false).unwrap();
        write_u32(&mut data, rsrc + 76, PE_ICON_DATA.len() as u32, false).unwrap();
        data[rsrc + 0x80..rsrc + 0x88].copy_from_slice(PE_ICON_DATA);

        write_u32(&mut data, opt + 112 + 16, 0x2000, false).unwrap();
        write_u32(&mut data, opt + 112 + 20, 0x88, false).unwrap();
    }

    if fixture.signed {
        // WIN_CERTIFICATE: length, revision 2.0, PKCS#7 signed data
        let mut cert = vec![0u8; 16];
        write_u32(&mut cert, 0, 16, false).unwrap();
        write_u16(&mut cert, 4, 0x0200, false).unwrap();
        write_u16(&mut cert, 6, 0x0002, false).unwrap();
        cert[8..].copy_from_slice(&[0x30, 0x82, 0, 4, 1, 2, 3, 4]);
        data.extend_from_slice(&cert);

        write_u32(&mut data, opt + 112 + 32, 0x600, false).unwrap();
        write_u32(&mut data, opt + 112 + 36, 16, false).unwrap();
    }

    update_checksum(&mut data).unwrap();
    data
}

// =============================================================================
// ELF
// =============================================================================

#[derive(Debug, Clone)]
pub struct ElfFixture {
    pub is_64: bool,
    pub big_endian: bool,
    pub sentinel: bool,
}

impl Default for ElfFixture {
    fn default() -> Self {
        Self {
            is_64: true,
            big_endian: false,
            sentinel: true,
        }
    }
}

/// File offset of the sentinel inside `.text`.
pub const ELF_SENTINEL_OFFSET: usize = 0x140;

const ELF_SHSTRTAB: &[u8] = b"\0.text\0.shstrtab\0.note.gnu.build-id\0";

/// Writes a class-sized word.
fn word(data: &mut [u8], offset: usize, value: u64, is_64: bool, be: bool) {
    if is_64 {
        write_u64(data, offset, value, be).unwrap();
    } else {
        write_u32(data, offset, value as u32, be).unwrap();
    }
}

/// Build an executable with PT_PHDR, one PT_LOAD, and a GNU build-id note.
pub fn elf_image(fixture: &ElfFixture) -> Vec<u8> {
    let is_64 = fixture.is_64;
    let be = fixture.big_endian;
    let (ehsize, ph_size, sh_size) = if is_64 { (64, 56, 64) } else { (52, 32, 40) };
    let base: u64 = if is_64 { 0x40_0000 } else { 0x804_8000 };

    let shstrtab_offset = 0x180;
    let shoff = (shstrtab_offset + ELF_SHSTRTAB.len()).div_ceil(8) * 8;
    let mut data = vec![0u8; shoff + 4 * sh_size];

    // Identification
    data[0..4].copy_from_slice(b"\x7fELF");
    data[4] = if is_64 { 2 } else { 1 };
    data[5] = if be { 2 } else { 1 };
    data[6] = 1;

    let machine = match (is_64, be) {
        (true, false) => 0x3e,
        (true, true) => 0x15,
        (false, false) => 0x03,
        (false, true) => 0x14,
    };
    write_u16(&mut data, 16, 2, be).unwrap(); // ET_EXEC
    write_u16(&mut data, 18, machine, be).unwrap();
    write_u32(&mut data, 20, 1, be).unwrap();

    let w = if is_64 { 8 } else { 4 };
    word(&mut data, 24, base + 0x120, is_64, be); // e_entry
    word(&mut data, 24 + w, ehsize as u64, is_64, be); // e_phoff
    word(&mut data, 24 + 2 * w, shoff as u64, is_64, be); // e_shoff
    let tail = 24 + 3 * w + 4;
    write_u16(&mut data, tail, ehsize as u16, be).unwrap();
    write_u16(&mut data, tail + 2, ph_size as u16, be).unwrap();
    write_u16(&mut data, tail + 4, 3, be).unwrap();
    write_u16(&mut data, tail + 6, sh_size as u16, be).unwrap();
    write_u16(&mut data, tail + 8, 4, be).unwrap();
    write_u16(&mut data, tail + 10, 3, be).unwrap();

    // Program headers: (type, flags, offset, vaddr, filesz, align)
    let phdrs: [(u32, u32, u64, u64, u64, u64); 3] = [
        (6, 4, ehsize as u64, base + ehsize as u64, 3 * ph_size as u64, 8),
        (1, 5, 0, base, 0x180, 0x1000),
        (4, 4, 0x100, base + 0x100, 24, 4),
    ];
    for (i, (p_type, flags, offset, vaddr, size, align)) in phdrs.iter().enumerate() {
        let at = ehsize + i * ph_size;
        write_u32(&mut data, at, *p_type, be).unwrap();
        if is_64 {
            write_u32(&mut data, at + 4, *flags, be).unwrap();
            write_u64(&mut data, at + 8, *offset, be).unwrap();
            write_u64(&mut data, at + 16, *vaddr, be).unwrap();
            write_u64(&mut data, at + 24, *vaddr, be).unwrap();
            write_u64(&mut data, at + 32, *size, be).unwrap();
            write_u64(&mut data, at + 40, *size, be).unwrap();
            write_u64(&mut data, at + 48, *align, be).unwrap();
        } else {
            write_u32(&mut data, at + 4, *offset as u32, be).unwrap();
            write_u32(&mut data, at + 8, *vaddr as u32, be).unwrap();
            write_u32(&mut data, at + 12, *vaddr as u32, be).unwrap();
            write_u32(&mut data, at + 16, *size as u32, be).unwrap();
            write_u32(&mut data, at + 20, *size as u32, be).unwrap();
            write_u32(&mut data, at + 24, *flags, be).unwrap();
            write_u32(&mut data, at + 28, *align as u32, be).unwrap();
        }
    }

    // GNU build-id note
    write_u32(&mut data, 0x100, 4, be).unwrap();
    write_u32(&mut data, 0x104, 8, be).unwrap();
    write_u32(&mut data, 0x108, 3, be).unwrap();
    data[0x10c..0x110].copy_from_slice(b"GNU\0");
    data[0x110..0x118].copy_from_slice(&[0xde, 0xad, 0xbe, 0xef, 0x01, 0x02, 0x03, 0x04]);

    // .text
    data[0x120] = 0xc3;
    if fixture.sentinel {
        let fuse = unarmed_sentinel();
        data[ELF_SENTINEL_OFFSET..ELF_SENTINEL_OFFSET + fuse.len()].copy_from_slice(&fuse);
    }

    data[shstrtab_offset..shstrtab_offset + ELF_SHSTRTAB.len()].copy_from_slice(ELF_SHSTRTAB);

    // Section headers: (name, type, flags, addr, offset, size, align)
    let shdrs: [(u32, u32, u64, u64, u64, u64, u64); 4] = [
        (0, 0, 0, 0, 0, 0, 0),
        (17, 7, 2, base + 0x100, 0x100, 24, 4),
        (1, 1, 6, base + 0x120, 0x120, 0x60, 16),
        (7, 3, 0, 0, shstrtab_offset as u64, ELF_SHSTRTAB.len() as u64, 1),
    ];
    for (i, (name, sh_type, flags, addr, offset, size, align)) in shdrs.iter().enumerate() {
        let at = shoff + i * sh_size;
        write_u32(&mut data, at, *name, be).unwrap();
        write_u32(&mut data, at + 4, *sh_type, be).unwrap();
        word(&mut data, at + 8, *flags, is_64, be);
        word(&mut data, at + 8 + w, *addr, is_64, be);
        word(&mut data, at + 8 + 2 * w, *offset, is_64, be);
        word(&mut data, at + 8 + 3 * w, *size, is_64, be);
        word(&mut data, at + 16 + 4 * w, *align, is_64, be);
    }

    data
}

// =============================================================================
// Mach-O
// =============================================================================

/// File offset of `__LINKEDIT` in the thin fixture.
pub const MACHO_LINKEDIT_OFFSET: u64 = 0x4000;

const MACHO_TEXT_VMADDR: u64 = 0x1_0000_0000;

#[derive(Debug, Clone)]
pub struct MachOFixture {
    /// Add LC_CODE_SIGNATURE with its blob at the end of `__LINKEDIT`.
    pub signed: bool,
    /// Zero bytes between the load commands and `__text`.
    pub header_padding: usize,
    pub sentinel: bool,
}

impl Default for MachOFixture {
    fn default() -> Self {
        Self {
            signed: false,
            header_padding: 0x200,
            sentinel: true,
        }
    }
}

/// Build a thin little-endian arm64 executable.
pub fn macho_image(fixture: &MachOFixture) -> Vec<u8> {
    let linkedit = MACHO_LINKEDIT_OFFSET as usize;
    let signature_size = 0x40;
    let linkedit_size = if fixture.signed { 0x20 + signature_size } else { 0x20 };

    let mut sizeofcmds = 72 + 152 + 72 + 24;
    let mut ncmds = 4;
    if fixture.signed {
        sizeofcmds += 16;
        ncmds += 1;
    }
    let text_offset = 32 + sizeofcmds + fixture.header_padding;

    let mut data = vec![0u8; linkedit + linkedit_size];

    // mach_header_64
    write_u32(&mut data, 0, 0xfeed_facf, false).unwrap();
    write_u32(&mut data, 4, 0x0100_000c, false).unwrap();
    write_u32(&mut data, 12, 2, false).unwrap(); // MH_EXECUTE
    write_u32(&mut data, 16, ncmds, false).unwrap();
    write_u32(&mut data, 20, sizeofcmds as u32, false).unwrap();
    write_u32(&mut data, 24, 0x85, false).unwrap();

    let mut at = 32;
    let segment = |data: &mut Vec<u8>,
                       at: &mut usize,
                       name: &str,
                       vmaddr: u64,
                       vmsize: u64,
                       fileoff: u64,
                       filesize: u64,
                       prot: u32,
                       nsects: u32| {
        let cmdsize = 72 + 80 * nsects as usize;
        write_u32(data, *at, 0x19, false).unwrap();
        write_u32(data, *at + 4, cmdsize as u32, false).unwrap();
        data[*at + 8..*at + 8 + name.len()].copy_from_slice(name.as_bytes());
        write_u64(data, *at + 24, vmaddr, false).unwrap();
        write_u64(data, *at + 32, vmsize, false).unwrap();
        write_u64(data, *at + 40, fileoff, false).unwrap();
        write_u64(data, *at + 48, filesize, false).unwrap();
        write_u32(data, *at + 56, prot, false).unwrap();
        write_u32(data, *at + 60, prot, false).unwrap();
        write_u32(data, *at + 64, nsects, false).unwrap();
        let start = *at;
        *at += cmdsize;
        start
    };

    segment(&mut data, &mut at, "__PAGEZERO", 0, MACHO_TEXT_VMADDR, 0, 0, 0, 0);
    let text = segment(
        &mut data,
        &mut at,
        "__TEXT",
        MACHO_TEXT_VMADDR,
        MACHO_LINKEDIT_OFFSET,
        0,
        MACHO_LINKEDIT_OFFSET,
        5,
        1,
    );
    // section_64 __text
    let sect = text + 72;
    data[sect..sect + 6].copy_from_slice(b"__text");
    data[sect + 16..sect + 22].copy_from_slice(b"__TEXT");
    write_u64(&mut data, sect + 32, MACHO_TEXT_VMADDR + text_offset as u64, false).unwrap();
    write_u64(&mut data, sect + 40, 0x100, false).unwrap();
    write_u32(&mut data, sect + 48, text_offset as u32, false).unwrap();
    write_u32(&mut data, sect + 52, 2, false).unwrap();
    write_u32(&mut data, sect + 64, 0x8000_0400, false).unwrap();

    segment(
        &mut data,
        &mut at,
        "__LINKEDIT",
        MACHO_TEXT_VMADDR + MACHO_LINKEDIT_OFFSET,
        MACHO_LINKEDIT_OFFSET,
        MACHO_LINKEDIT_OFFSET,
        linkedit_size as u64,
        1,
        0,
    );

    // LC_SYMTAB: one symbol, 16-byte string table
    write_u32(&mut data, at, 0x2, false).unwrap();
    write_u32(&mut data, at + 4, 24, false).unwrap();
    write_u32(&mut data, at + 8, linkedit as u32, false).unwrap();
    write_u32(&mut data, at + 12, 1, false).unwrap();
    write_u32(&mut data, at + 16, linkedit as u32 + 0x10, false).unwrap();
    write_u32(&mut data, at + 20, 0x10, false).unwrap();
    at += 24;

    if fixture.signed {
        write_u32(&mut data, at, 0x1d, false).unwrap();
        write_u32(&mut data, at + 4, 16, false).unwrap();
        write_u32(&mut data, at + 8, linkedit as u32 + 0x20, false).unwrap();
        write_u32(&mut data, at + 12, signature_size as u32, false).unwrap();

        // Empty embedded signature superblob (big-endian)
        let blob = linkedit + 0x20;
        data[blob..blob + 4].copy_from_slice(&0xfade_0cc0u32.to_be_bytes());
        data[blob + 4..blob + 8].copy_from_slice(&(signature_size as u32).to_be_bytes());
    }

    // __text: a ret followed by the fuse
    data[text_offset..text_offset + 4].copy_from_slice(&0xd65f_03c0u32.to_le_bytes());
    if fixture.sentinel {
        let fuse = unarmed_sentinel();
        data[text_offset + 0x10..text_offset + 0x10 + fuse.len()].copy_from_slice(&fuse);
    }

    // nlist_64 for _main, then the string table
    write_u32(&mut data, linkedit, 1, false).unwrap();
    data[linkedit + 4] = 0x0f;
    data[linkedit + 5] = 1;
    write_u64(&mut data, linkedit + 8, MACHO_TEXT_VMADDR + text_offset as u64, false).unwrap();
    data[linkedit + 0x10..linkedit + 0x17].copy_from_slice(b"\0_main\0");

    data
}

/// Wrap thin images in a FAT container with page-aligned slices.
pub fn fat_image(slices: &[Vec<u8>]) -> Vec<u8> {
    let mut data = vec![0u8; 8 + 20 * slices.len()];
    data[0..4].copy_from_slice(&0xcafe_babeu32.to_be_bytes());
    data[4..8].copy_from_slice(&(slices.len() as u32).to_be_bytes());

    for (i, slice) in slices.iter().enumerate() {
        let offset = data.len().div_ceil(0x4000) * 0x4000;
        data.resize(offset, 0);
        data.extend_from_slice(slice);

        let entry = 8 + 20 * i;
        let cputype = u32::from_le_bytes([slice[4], slice[5], slice[6], slice[7]]);
        let cpusubtype = u32::from_le_bytes([slice[8], slice[9], slice[10], slice[11]]);
        data[entry..entry + 4].copy_from_slice(&cputype.to_be_bytes());
        data[entry + 4..entry + 8].copy_from_slice(&cpusubtype.to_be_bytes());
        data[entry + 8..entry + 12].copy_from_slice(&(offset as u32).to_be_bytes());
        data[entry + 12..entry + 16].copy_from_slice(&(slice.len() as u32).to_be_bytes());
        data[entry + 16..entry + 20].copy_from_slice(&14u32.to_be_bytes());
    }

    data
}
