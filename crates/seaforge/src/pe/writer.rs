//! PE signature removal and resource injection.
//!
//! Injection rebuilds the resource tree into a new section appended after the
//! last section's raw data:
//! 1. Parse the existing tree (data directory 2), if any
//! 2. Add `RT_RCDATA / <NAME> / 0` pointing at the payload
//! 3. Serialize the tree and payload into a new `.sea` section
//! 4. Shift overlay bytes (usually the Authenticode blob) and fix the
//!    certificate directory offset in lock-step
//! 5. Update section count, image size, and data directory 2

use super::parser::{update_checksum, PeLayout, SECTION_HEADER_SIZE};
use super::resource::{
    DataLocation, ResourceData, ResourceDirectory, ResourceEntry, ResourceId, ResourceNode,
};
use crate::constants::{
    IMAGE_DIRECTORY_ENTRY_RESOURCE, IMAGE_DIRECTORY_ENTRY_SECURITY, IMAGE_SCN_CNT_INITIALIZED_DATA,
    IMAGE_SCN_MEM_READ, PE_RESOURCE_SECTION_NAME, RT_RCDATA,
};
use crate::image::{align_to, read_u16, read_u32, slice, to_u32, write_bytes, write_u16, write_u32};
use crate::{Error, Result};

/// Language id of the injected leaf (LANG_NEUTRAL).
const NEUTRAL_LANGUAGE: u32 = 0;

/// Remove the Authenticode signature.
///
/// Trailing certificate data is truncated; a certificate embedded before
/// other overlay data is zeroed instead. Returns whether a signature existed.
pub fn strip_signature(data: &mut Vec<u8>) -> Result<bool> {
    let layout = PeLayout::parse(data)?;
    let (offset, size) = layout.data_directory(data, IMAGE_DIRECTORY_ENTRY_SECURITY)?;
    if size == 0 {
        return Ok(false);
    }

    let start = offset as usize;
    let end = start + size as usize;
    if end > data.len() || (start as u64) < layout.raw_data_end() {
        return Err(Error::MalformedImage(format!(
            "certificate table {start:#x}..{end:#x} lies outside the overlay"
        )));
    }

    layout.set_data_directory(data, IMAGE_DIRECTORY_ENTRY_SECURITY, 0, 0)?;
    if end == data.len() {
        data.truncate(start);
    } else {
        data[start..end].fill(0);
    }
    update_checksum(data)?;

    Ok(true)
}

/// Whether the certificate directory references any data.
pub fn has_signature(data: &[u8]) -> Result<bool> {
    let layout = PeLayout::parse(data)?;
    let (_, size) = layout.data_directory(data, IMAGE_DIRECTORY_ENTRY_SECURITY)?;
    Ok(size != 0)
}

fn load_tree(data: &[u8], layout: &PeLayout) -> Result<ResourceDirectory> {
    let (rva, size) = layout.data_directory(data, IMAGE_DIRECTORY_ENTRY_RESOURCE)?;
    if rva == 0 || size == 0 {
        return Ok(ResourceDirectory::default());
    }
    let root = layout.rva_to_offset(rva, 16)?;
    ResourceDirectory::parse(data, root)
}

/// Locate the leaf of `RT_RCDATA / name / *`.
fn find_leaf<'a>(tree: &'a ResourceDirectory, name: &str) -> Option<&'a ResourceData> {
    let ResourceNode::Directory(rcdata) = &tree.find(&ResourceId::Id(RT_RCDATA))?.node else {
        return None;
    };
    match &rcdata.find(&ResourceId::name(name))?.node {
        ResourceNode::Data(leaf) => Some(leaf),
        ResourceNode::Directory(langs) => langs.entries.iter().find_map(|e| match &e.node {
            ResourceNode::Data(leaf) => Some(leaf),
            ResourceNode::Directory(_) => None,
        }),
    }
}

/// Whether an RCDATA resource named `name` exists.
pub fn has_resource(data: &[u8], name: &str) -> Result<bool> {
    let layout = PeLayout::parse(data)?;
    let tree = load_tree(data, &layout)?;
    Ok(find_leaf(&tree, name).is_some())
}

/// Read back the RCDATA resource named `name`.
pub fn read_resource(data: &[u8], name: &str) -> Result<Option<Vec<u8>>> {
    let layout = PeLayout::parse(data)?;
    let tree = load_tree(data, &layout)?;
    match find_leaf(&tree, name).map(|leaf| &leaf.location) {
        Some(DataLocation::Rva { rva, size }) => {
            let at = layout.rva_to_offset(*rva, *size)?;
            Ok(Some(slice(data, at, *size as usize)?.to_vec()))
        }
        Some(DataLocation::Inline(bytes)) => Ok(Some(bytes.clone())),
        None => Ok(None),
    }
}

/// Injects `payload` as the RCDATA resource `name`.
///
/// Returns the rebuilt image and the file offset of the payload. The input is
/// never modified.
///
/// # Errors
///
/// - [`Error::DuplicateResource`] if the resource already exists
/// - [`Error::InsufficientSpace`] if the header cannot take another section
/// - [`Error::MalformedImage`] if the headers or the resource tree are corrupt
pub fn inject_resource(data: &[u8], name: &str, payload: &[u8]) -> Result<(Vec<u8>, u64)> {
    let layout = PeLayout::parse(data)?;
    let mut tree = load_tree(data, &layout)?;
    if find_leaf(&tree, name).is_some() {
        return Err(Error::DuplicateResource(format!(
            "RCDATA resource {} already exists",
            name.to_ascii_uppercase()
        )));
    }

    // The new section header goes right after the existing table.
    let header_at = layout.section_table_offset + layout.sections.len() * SECTION_HEADER_SIZE;
    let header_end = (header_at + SECTION_HEADER_SIZE) as u64;
    if header_end > layout.size_of_headers as u64 || header_end > layout.first_raw_data() {
        return Err(Error::InsufficientSpace(
            "no room for another section header".into(),
        ));
    }
    if slice(data, header_at, SECTION_HEADER_SIZE)?.iter().any(|&b| b != 0) {
        return Err(Error::InsufficientSpace(
            "bytes after the section table are in use".into(),
        ));
    }

    tree.subdirectory_mut(ResourceId::Id(RT_RCDATA))?
        .subdirectory_mut(ResourceId::name(name))?
        .entries
        .push(ResourceEntry {
            id: ResourceId::Id(NEUTRAL_LANGUAGE),
            node: ResourceNode::Data(ResourceData {
                location: DataLocation::Inline(payload.to_vec()),
                code_page: 0,
            }),
        });

    let section_rva = align_to(layout.virtual_end(), layout.section_alignment as u64);
    let section_rva32 = to_u32(section_rva, "resource section RVA")?;
    let tree_bytes = tree.build(section_rva32)?;
    let payload_offset_in_section = tree_bytes.len() - payload.len();

    let insert_at = layout.raw_data_end();
    if insert_at > data.len() as u64 {
        return Err(Error::MalformedImage(format!(
            "section data ends at {insert_at:#x}, past the end of the file"
        )));
    }
    let raw_pointer = align_to(insert_at, layout.file_alignment as u64);
    let raw_size = align_to(tree_bytes.len() as u64, layout.file_alignment as u64);
    // Overlay data keeps 8-byte alignment (the certificate table requires it).
    let shift = align_to(raw_pointer - insert_at + raw_size, 8);

    let insert_at = insert_at as usize;
    let mut out = Vec::with_capacity(data.len() + shift as usize);
    out.extend_from_slice(&data[..insert_at]);
    out.resize(raw_pointer as usize, 0);
    out.extend_from_slice(&tree_bytes);
    out.resize(insert_at + shift as usize, 0);
    out.extend_from_slice(&data[insert_at..]);

    // Section header
    let mut header = [0u8; SECTION_HEADER_SIZE];
    header[..8].copy_from_slice(PE_RESOURCE_SECTION_NAME);
    header[8..12].copy_from_slice(&to_u32(tree_bytes.len() as u64, "section size")?.to_le_bytes());
    header[12..16].copy_from_slice(&section_rva32.to_le_bytes());
    header[16..20].copy_from_slice(&to_u32(raw_size, "section raw size")?.to_le_bytes());
    header[20..24].copy_from_slice(&to_u32(raw_pointer, "section file offset")?.to_le_bytes());
    header[36..40].copy_from_slice(
        &(IMAGE_SCN_CNT_INITIALIZED_DATA | IMAGE_SCN_MEM_READ).to_le_bytes(),
    );
    write_bytes(&mut out, header_at, &header)?;

    // COFF and optional header fields
    let sections_at = layout.coff_offset + 2;
    let count = read_u16(&out, sections_at, false)?;
    write_u16(&mut out, sections_at, count + 1, false)?;

    let image_size = align_to(
        section_rva + tree_bytes.len() as u64,
        layout.section_alignment as u64,
    );
    write_u32(
        &mut out,
        layout.optional_offset + 56,
        to_u32(image_size, "image size")?,
        false,
    )?;

    let initialized_at = layout.optional_offset + 8;
    let initialized = read_u32(&out, initialized_at, false)?;
    write_u32(
        &mut out,
        initialized_at,
        initialized.wrapping_add(raw_size as u32),
        false,
    )?;

    layout.set_data_directory(
        &mut out,
        IMAGE_DIRECTORY_ENTRY_RESOURCE,
        section_rva32,
        to_u32(tree_bytes.len() as u64, "resource directory size")?,
    )?;

    let (cert_offset, cert_size) = layout.data_directory(data, IMAGE_DIRECTORY_ENTRY_SECURITY)?;
    if cert_size != 0 && cert_offset as usize >= insert_at {
        let moved = to_u32(cert_offset as u64 + shift, "certificate offset")?;
        layout.set_data_directory(&mut out, IMAGE_DIRECTORY_ENTRY_SECURITY, moved, cert_size)?;
    }

    update_checksum(&mut out)?;

    Ok((out, raw_pointer + payload_offset_in_section as u64))
}
