//! Executable images tagged with their container format.
//!
//! [`ExecutableImage`] owns the raw bytes of a host binary together with the
//! [`Format`] detected from its magic bytes. The stripper and the injector
//! dispatch on that tag instead of re-sniffing the data.
//!
//! The bounds-checked `read_*`/`write_*` helpers at the bottom are used by
//! every format module: a header field pointing outside the buffer becomes
//! [`Error::MalformedImage`] rather than a panic.

use crate::constants::{
    DOS_MAGIC, ELF_MAGIC, FAT_CIGAM, FAT_MAGIC, MH_CIGAM, MH_CIGAM_64, MH_MAGIC, MH_MAGIC_64,
    SENTINEL_FUSE,
};
use crate::{Error, Result};
use std::fmt;
use std::fs;
use std::path::Path;

/// Executable container formats the patcher understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// Windows Portable Executable.
    Pe,
    /// ELF, 32 or 64 bit, either byte order.
    Elf,
    /// Mach-O, thin or fat (universal).
    MachO,
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Format::Pe => "PE",
            Format::Elf => "ELF",
            Format::MachO => "Mach-O",
        })
    }
}

/// Identify the container format from the leading magic bytes.
pub fn detect_format(data: &[u8]) -> Option<Format> {
    if data.len() >= 4 && &data[..4] == ELF_MAGIC {
        return Some(Format::Elf);
    }
    if data.len() >= 2 && u16::from_le_bytes([data[0], data[1]]) == DOS_MAGIC {
        return Some(Format::Pe);
    }
    if data.len() >= 4 {
        let magic = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        if matches!(
            magic,
            MH_MAGIC | MH_CIGAM | MH_MAGIC_64 | MH_CIGAM_64 | FAT_MAGIC | FAT_CIGAM
        ) {
            return Some(Format::MachO);
        }
    }
    None
}

/// Smallest image that can hold the sentinel and its flag.
pub fn min_image_len() -> usize {
    SENTINEL_FUSE.len() + 2
}

/// A host binary loaded into memory for patching.
#[derive(Clone)]
pub struct ExecutableImage {
    data: Vec<u8>,
    format: Format,
}

impl fmt::Debug for ExecutableImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutableImage")
            .field("format", &self.format)
            .field("len", &self.data.len())
            .finish()
    }
}

impl ExecutableImage {
    /// Read and classify an executable from disk.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let data = fs::read(path.as_ref())?;
        Self::parse(data)
    }

    /// Classify an in-memory executable.
    ///
    /// # Errors
    ///
    /// - [`Error::MalformedImage`] if the data is shorter than the sentinel
    /// - [`Error::UnsupportedFormat`] if the magic is not PE, ELF, or Mach-O
    pub fn parse(data: Vec<u8>) -> Result<Self> {
        if data.len() < min_image_len() {
            return Err(Error::MalformedImage(format!(
                "image is {} bytes, smaller than the {}-byte sentinel",
                data.len(),
                min_image_len()
            )));
        }

        let format = detect_format(&data).ok_or_else(|| {
            Error::UnsupportedFormat("ELF, PE, or Mach-O expected".into())
        })?;

        Ok(Self { data, format })
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Write the image to `path`, replacing any existing file.
    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::write(path.as_ref(), &self.data)?;
        Ok(())
    }

    pub(crate) fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Swap in a rebuilt buffer. The format never changes across a patch.
    pub(crate) fn replace(&mut self, data: Vec<u8>) {
        self.data = data;
    }
}

// =============================================================================
// Bounds-checked field access
// =============================================================================

/// Borrow `len` bytes at `offset`.
pub(crate) fn slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8]> {
    offset
        .checked_add(len)
        .and_then(|end| data.get(offset..end))
        .ok_or_else(|| {
            Error::MalformedImage(format!(
                "read of {len} bytes at {offset:#x} exceeds image size {:#x}",
                data.len()
            ))
        })
}

fn slice_mut(data: &mut [u8], offset: usize, len: usize) -> Result<&mut [u8]> {
    let size = data.len();
    offset
        .checked_add(len)
        .and_then(|end| data.get_mut(offset..end))
        .ok_or_else(|| {
            Error::MalformedImage(format!(
                "write of {len} bytes at {offset:#x} exceeds image size {size:#x}"
            ))
        })
}

fn array<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N]> {
    let mut out = [0u8; N];
    out.copy_from_slice(slice(data, offset, N)?);
    Ok(out)
}

pub(crate) fn read_u16(data: &[u8], offset: usize, big_endian: bool) -> Result<u16> {
    let bytes: [u8; 2] = array(data, offset)?;
    Ok(if big_endian {
        u16::from_be_bytes(bytes)
    } else {
        u16::from_le_bytes(bytes)
    })
}

pub(crate) fn read_u32(data: &[u8], offset: usize, big_endian: bool) -> Result<u32> {
    let bytes: [u8; 4] = array(data, offset)?;
    Ok(if big_endian {
        u32::from_be_bytes(bytes)
    } else {
        u32::from_le_bytes(bytes)
    })
}

pub(crate) fn read_u64(data: &[u8], offset: usize, big_endian: bool) -> Result<u64> {
    let bytes: [u8; 8] = array(data, offset)?;
    Ok(if big_endian {
        u64::from_be_bytes(bytes)
    } else {
        u64::from_le_bytes(bytes)
    })
}

pub(crate) fn write_u16(data: &mut [u8], offset: usize, value: u16, big_endian: bool) -> Result<()> {
    let bytes = if big_endian {
        value.to_be_bytes()
    } else {
        value.to_le_bytes()
    };
    slice_mut(data, offset, 2)?.copy_from_slice(&bytes);
    Ok(())
}

pub(crate) fn write_u32(data: &mut [u8], offset: usize, value: u32, big_endian: bool) -> Result<()> {
    let bytes = if big_endian {
        value.to_be_bytes()
    } else {
        value.to_le_bytes()
    };
    slice_mut(data, offset, 4)?.copy_from_slice(&bytes);
    Ok(())
}

pub(crate) fn write_u64(data: &mut [u8], offset: usize, value: u64, big_endian: bool) -> Result<()> {
    let bytes = if big_endian {
        value.to_be_bytes()
    } else {
        value.to_le_bytes()
    };
    slice_mut(data, offset, 8)?.copy_from_slice(&bytes);
    Ok(())
}

/// Copy `src` into `data` at `offset`.
pub(crate) fn write_bytes(data: &mut [u8], offset: usize, src: &[u8]) -> Result<()> {
    slice_mut(data, offset, src.len())?.copy_from_slice(src);
    Ok(())
}

/// Rounds `value` up to a multiple of `alignment` (which must be non-zero).
pub(crate) fn align_to(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

/// Narrow a computed size or offset to a 32-bit header field.
pub(crate) fn to_u32(value: u64, what: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| {
        Error::InsufficientSpace(format!("{what} {value:#x} does not fit in 32 bits"))
    })
}

/// Fixed-width, NUL-padded name field as used by PE sections and Mach-O segments.
pub(crate) fn fixed_name<const N: usize>(name: &str) -> [u8; N] {
    let mut out = [0u8; N];
    let len = name.len().min(N);
    out[..len].copy_from_slice(&name.as_bytes()[..len]);
    out
}

/// Compare a NUL-padded field against `name`.
pub(crate) fn name_matches(field: &[u8], name: &str) -> bool {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    &field[..end] == name.as_bytes()
}
