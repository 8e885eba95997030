//! Resource injection and read-back.
//!
//! [`inject`] is the only entry point that writes a blob into an image. It
//! builds the patched image in a scratch buffer and swaps it into the caller's
//! [`ExecutableImage`] only after every step succeeded, so a failed injection
//! leaves the image byte-for-byte unchanged.

use crate::constants::MACHO_SEGMENT_NAME;
use crate::image::{ExecutableImage, Format};
use crate::pe::parser::update_checksum;
use crate::sentinel::{self, SentinelState};
use crate::{elf, macho, pe, Error, Result};

/// A resource written into an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRecord {
    pub name: String,
    /// File offset of the payload's first byte (first slice for universal Mach-O).
    pub offset: u64,
    pub len: usize,
}

/// Embed `payload` as resource `name` and arm the sentinel.
///
/// # Errors
///
/// - [`Error::SentinelNotFound`] if the fuse is missing or ambiguous
/// - [`Error::DuplicateResource`] if `name` already exists or the sentinel is armed
/// - [`Error::InsufficientSpace`] if the headers have no room for the new entry
/// - [`Error::MalformedImage`] / [`Error::UnsupportedFormat`] from the format writers
pub fn inject(image: &mut ExecutableImage, name: &str, payload: &[u8]) -> Result<ResourceRecord> {
    let sentinels = sentinel::locate_all(image)?;
    if sentinels.iter().any(|s| s.state == SentinelState::Armed) {
        return Err(Error::DuplicateResource(format!(
            "sentinel is already armed; {name} was injected before"
        )));
    }
    if has_resource(image, name)? {
        return Err(Error::DuplicateResource(format!("resource {name} already exists")));
    }

    let (data, offset) = match image.format() {
        Format::Pe => pe::inject_resource(image.data(), name, payload)?,
        Format::Elf => elf::inject_resource(image.data(), name, payload)?,
        Format::MachO => macho::inject_resource(image.data(), MACHO_SEGMENT_NAME, name, payload)?,
    };

    // Universal binaries rebuild their slice layout, so look the fuse up again.
    let mut patched = ExecutableImage::parse(data)?;
    for sentinel in sentinel::locate_all(&patched)? {
        sentinel::arm(patched.data_mut(), &sentinel)?;
    }
    if patched.format() == Format::Pe {
        update_checksum(patched.data_mut())?;
    }

    image.replace(patched.into_data());

    Ok(ResourceRecord {
        name: name.to_string(),
        offset,
        len: payload.len(),
    })
}

/// Read back resource `name` the way the runtime looks it up.
pub fn read_resource(image: &ExecutableImage, name: &str) -> Result<Option<Vec<u8>>> {
    match image.format() {
        Format::Pe => pe::read_resource(image.data(), name),
        Format::Elf => elf::read_resource(image.data(), name),
        Format::MachO => macho::read_resource(image.data(), MACHO_SEGMENT_NAME, name),
    }
}

/// Whether resource `name` is already present.
pub fn has_resource(image: &ExecutableImage, name: &str) -> Result<bool> {
    match image.format() {
        Format::Pe => pe::has_resource(image.data(), name),
        Format::Elf => elf::has_resource(image.data(), name),
        Format::MachO => macho::has_resource(image.data(), MACHO_SEGMENT_NAME, name),
    }
}

/// Whether the image still carries a platform code signature.
pub fn has_signature(image: &ExecutableImage) -> Result<bool> {
    match image.format() {
        Format::Pe => pe::has_signature(image.data()),
        Format::MachO => macho::has_signature(image.data()),
        Format::Elf => elf::validate(image.data()).map(|_| false),
    }
}
