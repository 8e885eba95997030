//! PE header layout.
//!
//! goblin validates the image as a whole; the layout here records the file
//! offsets of every header field the writer has to touch, which goblin does
//! not expose.

use crate::constants::{DOS_MAGIC, PE32_MAGIC, PE32_PLUS_MAGIC, PE_SIGNATURE};
use crate::image::{read_u16, read_u32, slice, write_u32};
use crate::{Error, Result};
use goblin::pe::PE;

/// Size of an IMAGE_SECTION_HEADER.
pub const SECTION_HEADER_SIZE: usize = 40;

/// Size of an IMAGE_DATA_DIRECTORY entry.
const DATA_DIRECTORY_SIZE: usize = 8;

/// One entry of the section table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Section {
    pub name: [u8; 8],
    pub virtual_size: u32,
    pub virtual_address: u32,
    pub size_of_raw_data: u32,
    pub pointer_to_raw_data: u32,
    pub characteristics: u32,
}

impl Section {
    /// Extent of the section in memory, falling back to raw size when
    /// `VirtualSize` is zero.
    fn mapped_size(&self) -> u32 {
        if self.virtual_size == 0 {
            self.size_of_raw_data
        } else {
            self.virtual_size
        }
    }
}

/// File offsets and values of the PE header fields used for patching.
#[derive(Debug, Clone)]
pub struct PeLayout {
    /// Offset of the COFF file header (just past "PE\0\0").
    pub coff_offset: usize,
    /// Offset of the optional header.
    pub optional_offset: usize,
    pub size_of_optional_header: usize,
    /// True for PE32+ (64-bit) images.
    pub is_plus: bool,
    pub section_alignment: u32,
    pub file_alignment: u32,
    pub size_of_headers: u32,
    pub size_of_image: u32,
    /// Offset of the first data directory entry.
    pub data_directory_offset: usize,
    pub number_of_rva_and_sizes: u32,
    /// Offset of the section table.
    pub section_table_offset: usize,
    pub sections: Vec<Section>,
}

impl PeLayout {
    /// Parse the header layout of a PE image.
    ///
    /// The image is first run through goblin so that structurally broken
    /// files are rejected before any offset is trusted.
    pub fn parse(data: &[u8]) -> Result<Self> {
        PE::parse(data).map_err(|e| Error::MalformedImage(format!("Failed to parse PE: {}", e)))?;

        if read_u16(data, 0, false)? != DOS_MAGIC {
            return Err(Error::UnsupportedFormat("missing MZ header".into()));
        }

        let pe_offset = read_u32(data, 0x3c, false)? as usize;
        if read_u32(data, pe_offset, false)? != PE_SIGNATURE {
            return Err(Error::MalformedImage(format!(
                "no PE signature at {pe_offset:#x}"
            )));
        }

        let coff_offset = pe_offset + 4;
        let number_of_sections = read_u16(data, coff_offset + 2, false)? as usize;
        let size_of_optional_header = read_u16(data, coff_offset + 16, false)? as usize;
        let optional_offset = coff_offset + 20;

        let is_plus = match read_u16(data, optional_offset, false)? {
            PE32_MAGIC => false,
            PE32_PLUS_MAGIC => true,
            other => {
                return Err(Error::MalformedImage(format!(
                    "unknown optional header magic {other:#x}"
                )))
            }
        };

        // Field offsets from here on are shared by PE32 and PE32+ up to the
        // stack reserve fields, which widen to 64 bits in PE32+.
        let section_alignment = read_u32(data, optional_offset + 32, false)?;
        let file_alignment = read_u32(data, optional_offset + 36, false)?;
        let size_of_image = read_u32(data, optional_offset + 56, false)?;
        let size_of_headers = read_u32(data, optional_offset + 60, false)?;
        let (rva_count_offset, data_directory_offset) = if is_plus {
            (optional_offset + 108, optional_offset + 112)
        } else {
            (optional_offset + 92, optional_offset + 96)
        };
        let number_of_rva_and_sizes = read_u32(data, rva_count_offset, false)?;

        if section_alignment == 0 || file_alignment == 0 {
            return Err(Error::MalformedImage("zero section or file alignment".into()));
        }

        let section_table_offset = optional_offset + size_of_optional_header;
        let mut sections = Vec::with_capacity(number_of_sections);
        for i in 0..number_of_sections {
            let at = section_table_offset + i * SECTION_HEADER_SIZE;
            let mut name = [0u8; 8];
            name.copy_from_slice(slice(data, at, 8)?);
            sections.push(Section {
                name,
                virtual_size: read_u32(data, at + 8, false)?,
                virtual_address: read_u32(data, at + 12, false)?,
                size_of_raw_data: read_u32(data, at + 16, false)?,
                pointer_to_raw_data: read_u32(data, at + 20, false)?,
                characteristics: read_u32(data, at + 36, false)?,
            });
        }

        Ok(Self {
            coff_offset,
            optional_offset,
            size_of_optional_header,
            is_plus,
            section_alignment,
            file_alignment,
            size_of_headers,
            size_of_image,
            data_directory_offset,
            number_of_rva_and_sizes,
            section_table_offset,
            sections,
        })
    }

    /// File offset of data directory `index`, if the header has room for it.
    pub fn data_directory_entry(&self, index: usize) -> Option<usize> {
        let at = self.data_directory_offset + index * DATA_DIRECTORY_SIZE;
        let header_end = self.optional_offset + self.size_of_optional_header;
        if (index as u32) < self.number_of_rva_and_sizes && at + DATA_DIRECTORY_SIZE <= header_end {
            Some(at)
        } else {
            None
        }
    }

    /// Read data directory `index` as (address, size); absent entries read as zero.
    pub fn data_directory(&self, data: &[u8], index: usize) -> Result<(u32, u32)> {
        match self.data_directory_entry(index) {
            Some(at) => Ok((read_u32(data, at, false)?, read_u32(data, at + 4, false)?)),
            None => Ok((0, 0)),
        }
    }

    /// Overwrite data directory `index`.
    pub fn set_data_directory(
        &self,
        data: &mut [u8],
        index: usize,
        address: u32,
        size: u32,
    ) -> Result<()> {
        let at = self.data_directory_entry(index).ok_or_else(|| {
            Error::InsufficientSpace(format!("optional header has no data directory {index}"))
        })?;
        write_u32(data, at, address, false)?;
        write_u32(data, at + 4, size, false)
    }

    pub fn checksum_offset(&self) -> usize {
        self.optional_offset + 64
    }

    /// End of the raw data of the last section in file order.
    pub fn raw_data_end(&self) -> u64 {
        self.sections
            .iter()
            .map(|s| s.pointer_to_raw_data as u64 + s.size_of_raw_data as u64)
            .max()
            .unwrap_or(self.size_of_headers as u64)
    }

    /// First RVA past every mapped section.
    pub fn virtual_end(&self) -> u64 {
        self.sections
            .iter()
            .map(|s| s.virtual_address as u64 + s.mapped_size() as u64)
            .max()
            .unwrap_or(self.size_of_headers as u64)
    }

    /// File offset where the first section's raw data begins.
    pub fn first_raw_data(&self) -> u64 {
        self.sections
            .iter()
            .filter(|s| s.pointer_to_raw_data != 0 && s.size_of_raw_data != 0)
            .map(|s| s.pointer_to_raw_data as u64)
            .min()
            .unwrap_or(self.size_of_headers as u64)
    }

    /// Translate an RVA range into a file offset.
    pub fn rva_to_offset(&self, rva: u32, len: u32) -> Result<usize> {
        for s in &self.sections {
            let start = s.virtual_address as u64;
            let rva64 = rva as u64;
            if rva64 >= start && rva64 + len as u64 <= start + s.size_of_raw_data as u64 {
                return Ok((s.pointer_to_raw_data as u64 + (rva64 - start)) as usize);
            }
        }
        Err(Error::MalformedImage(format!(
            "RVA {rva:#x}+{len:#x} is not backed by section data"
        )))
    }
}

/// Compute the optional-header checksum the way `CheckSumMappedFile` does.
pub fn compute_checksum(data: &[u8], checksum_offset: usize) -> u32 {
    let mut sum: u64 = 0;
    let mut i = 0;
    while i < data.len() {
        if i == checksum_offset || i == checksum_offset + 2 {
            i += 2;
            continue;
        }
        let lo = data[i] as u64;
        let hi = data.get(i + 1).copied().unwrap_or(0) as u64;
        sum += lo | (hi << 8);
        sum = (sum & 0xffff) + (sum >> 16);
        i += 2;
    }
    sum = (sum & 0xffff) + (sum >> 16);
    (sum as u32).wrapping_add(data.len() as u32)
}

/// Recompute and store the image checksum.
pub fn update_checksum(data: &mut [u8]) -> Result<()> {
    let layout = PeLayout::parse(data)?;
    let at = layout.checksum_offset();
    let checksum = compute_checksum(data, at);
    write_u32(data, at, checksum, false)
}
