//! Sentinel fuse lookup and arming.
//!
//! Injectable host binaries carry the string `<SENTINEL_FUSE>:0` in their
//! read-only data. The runtime checks the flag byte at startup, so arming it
//! (`:0` → `:1`) is what makes it look for the embedded blob.

use crate::constants::{FAT_CIGAM, FAT_MAGIC, SENTINEL_ARMED, SENTINEL_FUSE, SENTINEL_UNARMED};
use crate::image::{ExecutableImage, Format};
use crate::macho::MachOFile;
use crate::{Error, Result};

/// Whether the sentinel flag announces an embedded blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentinelState {
    Unarmed,
    Armed,
}

/// The single sentinel occurrence in an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sentinel {
    /// File offset of the fuse's first byte.
    pub offset: usize,
    pub state: SentinelState,
}

impl Sentinel {
    /// File offset of the flag byte.
    pub fn flag_offset(&self) -> usize {
        self.offset + SENTINEL_FUSE.len() + 1
    }
}

/// Find every occurrence of `needle` in `haystack`.
fn find_all(haystack: &[u8], needle: &[u8]) -> Vec<usize> {
    let mut hits = Vec::new();
    if needle.is_empty() || haystack.len() < needle.len() {
        return hits;
    }
    let first = needle[0];
    let last_start = haystack.len() - needle.len();
    let mut i = 0;
    while i <= last_start {
        if haystack[i] == first && &haystack[i..i + needle.len()] == needle {
            hits.push(i);
            i += needle.len();
        } else {
            i += 1;
        }
    }
    hits
}

/// Locate the sentinel, requiring exactly one occurrence.
///
/// # Errors
///
/// - [`Error::SentinelNotFound`] when the fuse is missing or appears more than once
/// - [`Error::MalformedImage`] when the fuse is not followed by `:0` or `:1`
pub fn locate(data: &[u8]) -> Result<Sentinel> {
    let hits = find_all(data, SENTINEL_FUSE.as_bytes());
    let offset = match hits.as_slice() {
        [] => {
            return Err(Error::SentinelNotFound(
                "host executable was not built with injection support".into(),
            ))
        }
        [one] => *one,
        many => {
            return Err(Error::SentinelNotFound(format!(
                "fuse occurs {} times, expected exactly one",
                many.len()
            )))
        }
    };

    let suffix = offset + SENTINEL_FUSE.len();
    let state = match data.get(suffix..suffix + 2) {
        Some([b':', SENTINEL_UNARMED]) => SentinelState::Unarmed,
        Some([b':', SENTINEL_ARMED]) => SentinelState::Armed,
        _ => {
            return Err(Error::MalformedImage(format!(
                "sentinel at {offset:#x} has no ':0' or ':1' flag"
            )))
        }
    };

    Ok(Sentinel { offset, state })
}

/// Overwrite the flag byte in place; the image length never changes.
pub fn arm(data: &mut [u8], sentinel: &Sentinel) -> Result<()> {
    let flag = data.get_mut(sentinel.flag_offset()).ok_or_else(|| {
        Error::MalformedImage("sentinel flag lies past the end of the image".into())
    })?;
    *flag = SENTINEL_ARMED;
    Ok(())
}

/// Locate the sentinel of every architecture in an image.
///
/// A universal Mach-O carries one copy of the runtime per slice, so the fuse
/// must occur exactly once inside each slice rather than once in the file.
/// Every other image yields a single sentinel.
pub fn locate_all(image: &ExecutableImage) -> Result<Vec<Sentinel>> {
    if image.format() != Format::MachO || !is_fat(image.data()) {
        return Ok(vec![locate(image.data())?]);
    }

    let file = MachOFile::parse(image.data())?;
    file.slices()
        .iter()
        .map(|slice| {
            let found = locate(file.slice_bytes(slice))?;
            Ok(Sentinel {
                offset: slice.offset + found.offset,
                state: found.state,
            })
        })
        .collect()
}

fn is_fat(data: &[u8]) -> bool {
    data.len() >= 4
        && matches!(
            u32::from_be_bytes([data[0], data[1], data[2], data[3]]),
            FAT_MAGIC | FAT_CIGAM
        )
}

/// Report the sentinel state of an image.
///
/// A universal binary reads as armed once any slice is armed.
pub fn sentinel_state(image: &ExecutableImage) -> Result<SentinelState> {
    let sentinels = locate_all(image)?;
    if sentinels.iter().any(|s| s.state == SentinelState::Armed) {
        Ok(SentinelState::Armed)
    } else {
        Ok(SentinelState::Unarmed)
    }
}
