//! Mach-O file parsing using goblin

use crate::constants::{SECTION_64_SIZE, SEGMENT_COMMAND_64_SIZE};
use crate::image::{name_matches, read_u32, read_u64, slice};
use crate::{Error, Result};
use goblin::mach::header::{MH_CIGAM_64, MH_MAGIC_64};
use goblin::mach::load_command::CommandVariant;
use goblin::mach::{Mach, MachO};

/// Largest slice alignment (as a power of two) accepted in a fat header.
pub const MAX_FAT_ALIGN: u32 = 15;

/// Represents a parsed Mach-O file
pub struct MachOFile<'a> {
    /// Raw file data
    data: &'a [u8],
    /// Is FAT binary
    is_fat: bool,
    /// Architecture slices
    slices: Vec<ArchSlice>,
}

/// A single architecture slice
#[derive(Debug, Clone)]
pub struct ArchSlice {
    /// Offset in file
    pub offset: usize,
    /// Size of slice
    pub size: usize,
    /// CPU type
    pub cpu_type: u32,
    /// CPU subtype (FAT slices only)
    pub cpu_subtype: u32,
    /// log2 alignment of the slice in a FAT file
    pub align: u32,
    /// Is 64-bit
    pub is_64: bool,
    /// Code signature (dataoff, datasize) relative to the slice, if signed
    pub code_signature: Option<(u32, u32)>,
}

/// A segment load command of a thin 64-bit image.
#[derive(Debug, Clone)]
pub struct Segment {
    /// Offset of the load command
    pub command_offset: usize,
    pub name: [u8; 16],
    pub vmaddr: u64,
    pub vmsize: u64,
    pub fileoff: u64,
    pub filesize: u64,
    pub sections: Vec<Section>,
}

/// A section within a [`Segment`].
#[derive(Debug, Clone)]
pub struct Section {
    pub name: [u8; 16],
    pub size: u64,
    pub offset: u32,
}

impl<'a> MachOFile<'a> {
    /// Parse Mach-O from bytes
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        let mach =
            Mach::parse(data).map_err(|e| Error::MalformedImage(format!("Failed to parse Mach-O: {}", e)))?;

        let (is_fat, slices) = match mach {
            Mach::Binary(macho) => {
                let slice = Self::parse_single(&macho, 0, data.len())?;
                (false, vec![slice])
            }
            Mach::Fat(fat) => {
                let mut slices = Vec::new();
                for (i, arch) in fat.iter_arches().enumerate() {
                    let arch = arch
                        .map_err(|e| Error::MalformedImage(format!("Fat arch {}: {}", i, e)))?;
                    if arch.align > MAX_FAT_ALIGN {
                        return Err(Error::MalformedImage(format!(
                            "Fat arch {}: alignment 2^{} exceeds 2^{}",
                            i, arch.align, MAX_FAT_ALIGN
                        )));
                    }
                    let offset = arch.offset as usize;
                    let size = arch.size as usize;
                    let slice_data = slice(data, offset, size)?;

                    let macho = MachO::parse(slice_data, 0)
                        .map_err(|e| Error::MalformedImage(format!("Slice {}: {}", i, e)))?;

                    let mut slice = Self::parse_single(&macho, offset, size)?;
                    slice.cpu_subtype = arch.cpusubtype as u32;
                    slice.align = arch.align;
                    slices.push(slice);
                }
                if slices.is_empty() {
                    return Err(Error::MalformedImage("Empty FAT binary".into()));
                }
                (true, slices)
            }
        };

        Ok(Self { data, is_fat, slices })
    }

    fn parse_single(macho: &MachO, offset: usize, size: usize) -> Result<ArchSlice> {
        let is_64 = macho.header.magic == MH_MAGIC_64 || macho.header.magic == MH_CIGAM_64;

        let code_signature = macho.load_commands.iter().find_map(|lc| match lc.command {
            CommandVariant::CodeSignature(cs) => Some((cs.dataoff, cs.datasize)),
            _ => None,
        });

        Ok(ArchSlice {
            offset,
            size,
            cpu_type: macho.header.cputype as u32,
            cpu_subtype: macho.header.cpusubtype as u32,
            align: 0,
            is_64,
            code_signature,
        })
    }

    /// Get raw data
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    /// Is FAT binary
    pub fn is_fat(&self) -> bool {
        self.is_fat
    }

    /// Get architecture slices
    pub fn slices(&self) -> &[ArchSlice] {
        &self.slices
    }

    /// Get the bytes of a slice
    pub fn slice_bytes(&self, slice: &ArchSlice) -> &'a [u8] {
        &self.data[slice.offset..slice.offset + slice.size]
    }
}

/// Whether a thin image stores its fields big-endian.
pub fn is_big_endian(data: &[u8]) -> bool {
    data.len() >= 4 && (data[0..4] == [0xfe, 0xed, 0xfa, 0xce] || data[0..4] == [0xfe, 0xed, 0xfa, 0xcf])
}

/// Load commands of a thin image as (offset, cmd, cmdsize).
pub fn load_commands(macho: &MachO, data: &[u8]) -> Result<Vec<(usize, u32, usize)>> {
    let big_endian = is_big_endian(data);
    macho
        .load_commands
        .iter()
        .map(|lc| Ok((lc.offset, read_u32(data, lc.offset, big_endian)?, lc.command.cmdsize())))
        .collect()
}

/// 64-bit segments of a thin image, with their sections.
pub fn segments(macho: &MachO, data: &[u8]) -> Result<Vec<Segment>> {
    let big_endian = is_big_endian(data);
    let mut segments = Vec::new();

    for lc in &macho.load_commands {
        let CommandVariant::Segment64(seg) = &lc.command else {
            continue;
        };

        let mut sections = Vec::with_capacity(seg.nsects as usize);
        for i in 0..seg.nsects as usize {
            let at = lc.offset + SEGMENT_COMMAND_64_SIZE + i * SECTION_64_SIZE;
            let mut name = [0u8; 16];
            name.copy_from_slice(slice(data, at, 16)?);
            sections.push(Section {
                name,
                size: read_u64(data, at + 40, big_endian)?,
                offset: read_u32(data, at + 48, big_endian)?,
            });
        }

        segments.push(Segment {
            command_offset: lc.offset,
            name: seg.segname,
            vmaddr: seg.vmaddr,
            vmsize: seg.vmsize,
            fileoff: seg.fileoff,
            filesize: seg.filesize,
            sections,
        });
    }

    Ok(segments)
}

/// Find the section `section_name` inside segment `segment_name`.
pub fn find_section<'s>(
    segments: &'s [Segment],
    segment_name: &str,
    section_name: &str,
) -> Option<&'s Section> {
    segments
        .iter()
        .filter(|s| name_matches(&s.name, segment_name))
        .flat_map(|s| s.sections.iter())
        .find(|s| name_matches(&s.name, section_name))
}
