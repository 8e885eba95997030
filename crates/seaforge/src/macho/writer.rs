//! Mach-O binary writer for resource injection and signature removal.
//!
//! This module modifies Mach-O binaries in two ways:
//! - Removing LC_CODE_SIGNATURE and the signature bytes at the end of __LINKEDIT
//! - Adding a segment with a single section that holds the resource payload
//!
//! The payload is placed where __LINKEDIT used to start and __LINKEDIT moves up
//! by a page-aligned delta, so __LINKEDIT stays the last segment in the file.
//! Every load command that stores a file offset into __LINKEDIT is shifted by
//! the same delta. FAT/Universal binaries are patched per slice and rebuilt.

use crate::constants::{
    LC_CODE_SIGNATURE, LC_DYLD_INFO, LC_DYLD_INFO_ONLY, LC_DYSYMTAB, LC_SEGMENT_64, LC_SYMTAB,
    LINKEDIT_DATA_COMMANDS, MACHO_PAGE_SIZE, MACH_HEADER_64_SIZE, SECTION_64_SIZE,
    SEGMENT_COMMAND_64_SIZE, VM_PROT_READ,
};
use crate::image::{
    align_to, fixed_name, name_matches, read_u32, read_u64, slice, to_u32, write_bytes, write_u32,
    write_u64,
};
use crate::{Error, Result};
use goblin::mach::MachO;

use super::parser::{find_section, is_big_endian, load_commands, segments, ArchSlice, MachOFile};

/// LC_NOTE: (data_owner[16], offset u64, size u64)
const LC_NOTE: u32 = 0x31;

/// Size of the load command added for the resource segment.
const RESOURCE_COMMAND_SIZE: usize = SEGMENT_COMMAND_64_SIZE + SECTION_64_SIZE;

/// Mach-O section name for a resource, following the `__name` convention.
pub fn section_name(resource_name: &str) -> String {
    format!("__{resource_name}")
}

/// Removes the code signature from every slice.
///
/// Returns `None` when no slice was signed.
pub fn strip_signature(data: &[u8]) -> Result<Option<Vec<u8>>> {
    let file = MachOFile::parse(data)?;
    if file.slices().iter().all(|s| s.code_signature.is_none()) {
        return Ok(None);
    }

    if !file.is_fat() {
        return strip_signature_single(data).map(Some);
    }

    let mut rebuilt = Vec::with_capacity(file.slices().len());
    for slice in file.slices() {
        let bytes = file.slice_bytes(slice);
        if slice.code_signature.is_some() {
            rebuilt.push(strip_signature_single(bytes)?);
        } else {
            rebuilt.push(bytes.to_vec());
        }
    }
    let layout = fat_layout(file.slices(), &rebuilt)?;
    Ok(Some(rebuild_fat(file.slices(), &rebuilt, &layout)))
}

/// Removes LC_CODE_SIGNATURE from a single-architecture binary.
fn strip_signature_single(data: &[u8]) -> Result<Vec<u8>> {
    let macho = parse_thin(data)?;
    let big_endian = is_big_endian(data);
    let commands = load_commands(&macho, data)?;

    let (cs_offset, _, cs_size) = *commands
        .iter()
        .find(|(_, cmd, _)| *cmd == LC_CODE_SIGNATURE)
        .ok_or_else(|| Error::MalformedImage("no LC_CODE_SIGNATURE".into()))?;
    let dataoff = read_u32(data, cs_offset + 8, big_endian)? as usize;
    let datasize = read_u32(data, cs_offset + 12, big_endian)? as usize;
    slice(data, dataoff, datasize)?;

    let sizeofcmds = read_u32(data, 20, big_endian)? as usize;
    let commands_end = MACH_HEADER_64_SIZE + sizeofcmds;
    let linkedit = segments(&macho, data)?
        .into_iter()
        .find(|s| name_matches(&s.name, "__LINKEDIT"));

    let mut output = data.to_vec();

    // Signature bytes: truncated when trailing, zeroed otherwise.
    if dataoff + datasize == output.len() {
        output.truncate(dataoff);
    } else {
        output[dataoff..dataoff + datasize].fill(0);
    }

    // Update __LINKEDIT to end where the signature started
    if let Some(seg) = &linkedit {
        if seg.fileoff + seg.filesize == (dataoff + datasize) as u64 && dataoff as u64 >= seg.fileoff {
            let new_filesize = dataoff as u64 - seg.fileoff;
            update_segment_sizes(&mut output, seg.command_offset, new_filesize, big_endian)?;
        }
    }

    // Drop the load command and close the gap
    output.copy_within(cs_offset + cs_size..commands_end, cs_offset);
    output[commands_end - cs_size..commands_end].fill(0);

    let ncmds = read_u32(&output, 16, big_endian)?;
    write_u32(&mut output, 16, ncmds - 1, big_endian)?;
    write_u32(&mut output, 20, (sizeofcmds - cs_size) as u32, big_endian)?;

    Ok(output)
}

/// Updates a segment's filesize and page-aligned vmsize.
fn update_segment_sizes(data: &mut [u8], offset: usize, new_filesize: u64, big_endian: bool) -> Result<()> {
    // Segment64 structure:
    // u32 cmd (0)
    // u32 cmdsize (4)
    // char[16] segname (8)
    // u64 vmaddr (24)
    // u64 vmsize (32)
    // u64 fileoff (40)
    // u64 filesize (48)
    // ...
    write_u64(data, offset + 48, new_filesize, big_endian)?;
    write_u64(data, offset + 32, align_to(new_filesize, MACHO_PAGE_SIZE), big_endian)
}

/// Whether any slice carries a code signature.
pub fn has_signature(data: &[u8]) -> Result<bool> {
    let file = MachOFile::parse(data)?;
    Ok(file.slices().iter().any(|s| s.code_signature.is_some()))
}

/// Whether any slice already carries the resource section.
pub fn has_resource(data: &[u8], segment_name: &str, resource_name: &str) -> Result<bool> {
    let file = MachOFile::parse(data)?;
    for slice in file.slices() {
        let bytes = file.slice_bytes(slice);
        let macho = parse_thin(bytes)?;
        let segs = segments(&macho, bytes)?;
        if find_section(&segs, segment_name, &section_name(resource_name)).is_some() {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Reads the resource section from the first slice.
pub fn read_resource(data: &[u8], segment_name: &str, resource_name: &str) -> Result<Option<Vec<u8>>> {
    let file = MachOFile::parse(data)?;
    let slice_info = &file.slices()[0];
    let bytes = file.slice_bytes(slice_info);
    let macho = parse_thin(bytes)?;
    let segs = segments(&macho, bytes)?;

    match find_section(&segs, segment_name, &section_name(resource_name)) {
        Some(section) => Ok(Some(
            slice(bytes, section.offset as usize, section.size as usize)?.to_vec(),
        )),
        None => Ok(None),
    }
}

/// Injects `payload` as section `__<resource_name>` in segment `segment_name`.
///
/// Returns the rebuilt binary and the file offset of the payload in the first
/// slice. The input is never modified.
///
/// # Errors
///
/// - [`Error::DuplicateResource`] if a slice already has the segment
/// - [`Error::InsufficientSpace`] if the load command area is full
/// - [`Error::UnsupportedFormat`] for 32-bit slices
pub fn inject_resource(
    data: &[u8],
    segment_name: &str,
    resource_name: &str,
    payload: &[u8],
) -> Result<(Vec<u8>, u64)> {
    let file = MachOFile::parse(data)?;

    if !file.is_fat() {
        return inject_single(data, segment_name, resource_name, payload);
    }

    let mut rebuilt = Vec::with_capacity(file.slices().len());
    let mut payload_offsets = Vec::with_capacity(file.slices().len());
    for slice in file.slices() {
        let (bytes, offset) =
            inject_single(file.slice_bytes(slice), segment_name, resource_name, payload)?;
        rebuilt.push(bytes);
        payload_offsets.push(offset);
    }

    let layout = fat_layout(file.slices(), &rebuilt)?;
    let output = rebuild_fat(file.slices(), &rebuilt, &layout);
    let first_offset = u64::from(layout[0].0) + payload_offsets[0];
    Ok((output, first_offset))
}

fn parse_thin(data: &[u8]) -> Result<MachO<'_>> {
    let macho = MachO::parse(data, 0)
        .map_err(|e| Error::MalformedImage(format!("Failed to parse Mach-O: {}", e)))?;
    if !macho.is_64 {
        return Err(Error::UnsupportedFormat(
            "32-bit Mach-O binaries not supported".into(),
        ));
    }
    Ok(macho)
}

/// Injects into a single-architecture Mach-O binary.
fn inject_single(
    data: &[u8],
    segment_name: &str,
    resource_name: &str,
    payload: &[u8],
) -> Result<(Vec<u8>, u64)> {
    let macho = parse_thin(data)?;
    let big_endian = is_big_endian(data);
    let commands = load_commands(&macho, data)?;
    let segs = segments(&macho, data)?;

    if segs.iter().any(|s| name_matches(&s.name, segment_name)) {
        return Err(Error::DuplicateResource(format!(
            "segment {segment_name} already exists"
        )));
    }

    // Room for the new load command before the first section's data
    let commands_end = commands
        .iter()
        .map(|(offset, _, size)| offset + size)
        .max()
        .unwrap_or(MACH_HEADER_64_SIZE);
    let first_data = find_first_data_offset(&segs, data.len());
    if commands_end + RESOURCE_COMMAND_SIZE > first_data {
        return Err(Error::InsufficientSpace(
            "No space for resource segment in load commands area".into(),
        ));
    }
    if slice(data, commands_end, RESOURCE_COMMAND_SIZE)?.iter().any(|&b| b != 0) {
        return Err(Error::InsufficientSpace(
            "load command padding is not empty".into(),
        ));
    }

    let linkedit = segs.iter().find(|s| name_matches(&s.name, "__LINKEDIT"));
    let segment_size = align_to(payload.len() as u64, MACHO_PAGE_SIZE).max(MACHO_PAGE_SIZE);
    let (insert_at, vmaddr) = match linkedit {
        Some(seg) => (seg.fileoff, seg.vmaddr),
        None => {
            let vm_end = segs.iter().map(|s| s.vmaddr + s.vmsize).max().unwrap_or(0);
            (
                align_to(data.len() as u64, MACHO_PAGE_SIZE),
                align_to(vm_end, MACHO_PAGE_SIZE),
            )
        }
    };
    let insert_at_usize = insert_at as usize;
    if linkedit.is_some() && insert_at_usize > data.len() {
        return Err(Error::MalformedImage(
            "__LINKEDIT starts past the end of the file".into(),
        ));
    }

    // Create output buffer: code + payload segment + linkedit
    let mut output = Vec::with_capacity(data.len() + segment_size as usize);
    output.extend_from_slice(&data[..insert_at_usize.min(data.len())]);
    output.resize(insert_at_usize, 0);
    output.extend_from_slice(payload);
    output.resize(insert_at_usize + segment_size as usize, 0);
    if insert_at_usize < data.len() {
        output.extend_from_slice(&data[insert_at_usize..]);
    }

    // Shift __LINKEDIT and every offset that points into it
    if let Some(seg) = linkedit {
        write_u64(&mut output, seg.command_offset + 24, seg.vmaddr + segment_size, big_endian)?;
        write_u64(&mut output, seg.command_offset + 40, seg.fileoff + segment_size, big_endian)?;
        for &(offset, cmd, _) in &commands {
            shift_linkedit_offsets(&mut output, offset, cmd, insert_at, segment_size, big_endian)?;
        }
    }

    // Append the resource segment command
    let command = build_segment_command(
        segment_name,
        &section_name(resource_name),
        vmaddr,
        segment_size,
        insert_at,
        payload.len() as u64,
        big_endian,
    )?;
    write_bytes(&mut output, commands_end, &command)?;

    // Update header's ncmds and sizeofcmds
    // For 64-bit: ncmds at offset 16, sizeofcmds at offset 20
    let ncmds = read_u32(&output, 16, big_endian)?;
    let sizeofcmds = read_u32(&output, 20, big_endian)?;
    write_u32(&mut output, 16, ncmds + 1, big_endian)?;
    write_u32(&mut output, 20, sizeofcmds + RESOURCE_COMMAND_SIZE as u32, big_endian)?;

    Ok((output, insert_at))
}

/// Adds `delta` to every linkedit file offset stored in the command at `offset`.
fn shift_linkedit_offsets(
    data: &mut [u8],
    offset: usize,
    cmd: u32,
    insert_at: u64,
    delta: u64,
    big_endian: bool,
) -> Result<()> {
    let fields: &[usize] = match cmd {
        // symoff, stroff
        LC_SYMTAB => &[8, 16],
        // tocoff, modtaboff, extrefsymoff, indirectsymoff, extreloff, locreloff
        LC_DYSYMTAB => &[32, 40, 48, 56, 64, 72],
        // rebase, bind, weak_bind, lazy_bind, export
        LC_DYLD_INFO | LC_DYLD_INFO_ONLY => &[8, 16, 24, 32, 40],
        // dataoff
        c if LINKEDIT_DATA_COMMANDS.contains(&c) => &[8],
        LC_NOTE => {
            let value = read_u64(data, offset + 24, big_endian)?;
            if value != 0 && value >= insert_at {
                write_u64(data, offset + 24, value + delta, big_endian)?;
            }
            return Ok(());
        }
        _ => &[],
    };

    for &field in fields {
        let value = read_u32(data, offset + field, big_endian)? as u64;
        if value != 0 && value >= insert_at {
            let moved = to_u32(value + delta, "linkedit offset")?;
            write_u32(data, offset + field, moved, big_endian)?;
        }
    }
    Ok(())
}

/// Encodes an LC_SEGMENT_64 with one section spanning the payload.
fn build_segment_command(
    segment_name: &str,
    section_name: &str,
    vmaddr: u64,
    segment_size: u64,
    fileoff: u64,
    payload_size: u64,
    big_endian: bool,
) -> Result<Vec<u8>> {
    let mut cmd = vec![0u8; RESOURCE_COMMAND_SIZE];
    let segname: [u8; 16] = fixed_name(segment_name);

    write_u32(&mut cmd, 0, LC_SEGMENT_64, big_endian)?;
    write_u32(&mut cmd, 4, RESOURCE_COMMAND_SIZE as u32, big_endian)?;
    write_bytes(&mut cmd, 8, &segname)?;
    write_u64(&mut cmd, 24, vmaddr, big_endian)?;
    write_u64(&mut cmd, 32, segment_size, big_endian)?;
    write_u64(&mut cmd, 40, fileoff, big_endian)?;
    write_u64(&mut cmd, 48, segment_size, big_endian)?;
    write_u32(&mut cmd, 56, VM_PROT_READ, big_endian)?; // maxprot
    write_u32(&mut cmd, 60, VM_PROT_READ, big_endian)?; // initprot
    write_u32(&mut cmd, 64, 1, big_endian)?; // nsects

    // section_64 follows the segment command
    let sect = SEGMENT_COMMAND_64_SIZE;
    let sectname: [u8; 16] = fixed_name(section_name);
    write_bytes(&mut cmd, sect, &sectname)?;
    write_bytes(&mut cmd, sect + 16, &segname)?;
    write_u64(&mut cmd, sect + 32, vmaddr, big_endian)?;
    write_u64(&mut cmd, sect + 40, payload_size, big_endian)?;
    write_u32(&mut cmd, sect + 48, to_u32(fileoff, "section offset")?, big_endian)?;

    Ok(cmd)
}

/// Finds the file offset where the first section or segment data begins
/// (where load commands must end).
fn find_first_data_offset(segs: &[super::parser::Segment], file_size: usize) -> usize {
    let mut min_offset: u64 = u64::MAX;

    for seg in segs {
        if seg.fileoff > 0 && seg.filesize > 0 && seg.fileoff < min_offset {
            min_offset = seg.fileoff;
        }
        for section in &seg.sections {
            if section.offset > 0 && section.size > 0 && (section.offset as u64) < min_offset {
                min_offset = section.offset as u64;
            }
        }
    }

    if min_offset == u64::MAX {
        file_size
    } else {
        min_offset as usize
    }
}

/// Computes (offset, size) of each rebuilt slice in a FAT file.
fn fat_layout(arches: &[ArchSlice], slices: &[Vec<u8>]) -> Result<Vec<(u32, u32)>> {
    // FAT header: 8 bytes + (20 bytes per arch)
    let fat_header_size = 8 + (arches.len() as u64 * 20);

    // Start slices after header, aligned to page boundary
    let mut current_offset = align_to(fat_header_size, MACHO_PAGE_SIZE);
    let mut offsets = Vec::with_capacity(arches.len());

    for (arch, slice_data) in arches.iter().zip(slices) {
        // Align to the arch's specified alignment (usually page size)
        let alignment = 1u64.checked_shl(arch.align).ok_or_else(|| {
            Error::MalformedImage(format!("fat slice alignment 2^{} is out of range", arch.align))
        })?;
        current_offset = align_to(current_offset, alignment);

        let size = slice_data.len() as u64;
        offsets.push((
            to_u32(current_offset, "fat slice offset")?,
            to_u32(size, "fat slice size")?,
        ));
        current_offset += size;
    }

    to_u32(current_offset, "fat image size")?;
    Ok(offsets)
}

/// Builds a FAT binary from patched slices placed at the offsets from [`fat_layout`].
fn rebuild_fat(arches: &[ArchSlice], slices: &[Vec<u8>], offsets: &[(u32, u32)]) -> Vec<u8> {
    let total_size = offsets
        .last()
        .map(|(offset, size)| *offset as usize + *size as usize)
        .unwrap_or(0);
    let mut output = vec![0u8; total_size];

    // Write FAT header (always big-endian)
    // Magic: 0xCAFEBABE
    output[0..4].copy_from_slice(&0xCAFEBABEu32.to_be_bytes());
    // Number of architectures
    output[4..8].copy_from_slice(&(arches.len() as u32).to_be_bytes());

    // Write fat_arch entries
    for (i, arch) in arches.iter().enumerate() {
        let entry_offset = 8 + (i * 20);
        let (new_offset, new_size) = offsets[i];

        write_u32_be(&mut output, entry_offset, arch.cpu_type);
        write_u32_be(&mut output, entry_offset + 4, arch.cpu_subtype);
        write_u32_be(&mut output, entry_offset + 8, new_offset);
        write_u32_be(&mut output, entry_offset + 12, new_size);
        write_u32_be(&mut output, entry_offset + 16, arch.align);
    }

    // Write each slice at its new offset
    for (slice_data, (offset, _)) in slices.iter().zip(offsets.iter()) {
        let offset = *offset as usize;
        output[offset..offset + slice_data.len()].copy_from_slice(slice_data);
    }

    output
}

/// Writes a u32 in big-endian format.
fn write_u32_be(data: &mut [u8], offset: usize, value: u32) {
    data[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}
