//! Code signature removal.

use crate::image::{ExecutableImage, Format};
use crate::{elf, macho, pe, Result};

/// Remove the platform code signature from `image`.
///
/// Returns `true` if a signature was found and removed. ELF has no platform
/// signature, so it is always left untouched.
pub fn strip_signature(image: &mut ExecutableImage) -> Result<bool> {
    let stripped = match image.format() {
        Format::Pe => {
            let mut data = image.data().to_vec();
            let stripped = pe::strip_signature(&mut data)?;
            if stripped {
                image.replace(data);
            }
            stripped
        }
        Format::MachO => match macho::strip_signature(image.data())? {
            Some(data) => {
                image.replace(data);
                true
            }
            None => false,
        },
        Format::Elf => {
            elf::validate(image.data())?;
            false
        }
    };

    Ok(stripped)
}
