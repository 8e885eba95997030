//! In-memory model of the PE resource directory tree.
//!
//! The tree is parsed from the image's existing resource directory, extended
//! with a new leaf, and serialized into a fresh section. Existing leaves keep
//! pointing at their original data RVAs, so the old `.rsrc` bytes are never
//! moved.
//!
//! Serialized layout (offsets relative to the start of the new section):
//!
//! ```text
//! directories (breadth first) | name strings | data entries | inline payloads
//! ```

use crate::image::{read_u16, read_u32, to_u32};
use crate::{Error, Result};

/// High bit of an entry's name/offset field.
const HIGH_BIT: u32 = 0x8000_0000;

/// Guard against cyclic or absurdly deep trees in corrupt images.
const MAX_DEPTH: usize = 8;

const DIRECTORY_HEADER_SIZE: usize = 16;
const DIRECTORY_ENTRY_SIZE: usize = 8;
const DATA_ENTRY_SIZE: usize = 16;

/// Identifier of a resource directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceId {
    Id(u32),
    /// UTF-16 name.
    Name(Vec<u16>),
}

impl ResourceId {
    /// Named identifier; resource names are stored and matched upper-case.
    pub fn name(name: &str) -> Self {
        ResourceId::Name(name.to_ascii_uppercase().encode_utf16().collect())
    }

    fn matches(&self, other: &ResourceId) -> bool {
        match (self, other) {
            (ResourceId::Id(a), ResourceId::Id(b)) => a == b,
            (ResourceId::Name(a), ResourceId::Name(b)) => {
                a.len() == b.len()
                    && a.iter().zip(b).all(|(x, y)| upper_u16(*x) == upper_u16(*y))
            }
            _ => false,
        }
    }
}

fn upper_u16(c: u16) -> u16 {
    if (b'a' as u16..=b'z' as u16).contains(&c) {
        c - 32
    } else {
        c
    }
}

/// Where a leaf's bytes live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataLocation {
    /// Already present in the image.
    Rva { rva: u32, size: u32 },
    /// Written into the new section on serialization.
    Inline(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceData {
    pub location: DataLocation,
    pub code_page: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceNode {
    Directory(ResourceDirectory),
    Data(ResourceData),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceEntry {
    pub id: ResourceId,
    pub node: ResourceNode,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceDirectory {
    pub characteristics: u32,
    pub time_date_stamp: u32,
    pub major_version: u16,
    pub minor_version: u16,
    pub entries: Vec<ResourceEntry>,
}

impl ResourceDirectory {
    /// Parse the tree whose root directory sits at file offset `root`.
    pub fn parse(data: &[u8], root: usize) -> Result<Self> {
        parse_directory(data, root, 0, 0)
    }

    pub fn find(&self, id: &ResourceId) -> Option<&ResourceEntry> {
        self.entries.iter().find(|e| e.id.matches(id))
    }

    /// Child directory `id`, created if missing.
    pub fn subdirectory_mut(&mut self, id: ResourceId) -> Result<&mut ResourceDirectory> {
        let index = match self.entries.iter().position(|e| e.id.matches(&id)) {
            Some(i) => i,
            None => {
                self.entries.push(ResourceEntry {
                    id,
                    node: ResourceNode::Directory(ResourceDirectory::default()),
                });
                self.entries.len() - 1
            }
        };
        match &mut self.entries[index].node {
            ResourceNode::Directory(dir) => Ok(dir),
            ResourceNode::Data(_) => Err(Error::MalformedImage(
                "resource leaf found where a directory was expected".into(),
            )),
        }
    }

    /// Entries in on-disk order: named entries first, then ids ascending.
    fn sorted_entries(&self) -> Vec<&ResourceEntry> {
        let mut named: Vec<&ResourceEntry> = self
            .entries
            .iter()
            .filter(|e| matches!(e.id, ResourceId::Name(_)))
            .collect();
        let mut ids: Vec<&ResourceEntry> = self
            .entries
            .iter()
            .filter(|e| matches!(e.id, ResourceId::Id(_)))
            .collect();
        named.sort_by(|a, b| match (&a.id, &b.id) {
            (ResourceId::Name(x), ResourceId::Name(y)) => {
                let x: Vec<u16> = x.iter().map(|c| upper_u16(*c)).collect();
                let y: Vec<u16> = y.iter().map(|c| upper_u16(*c)).collect();
                x.cmp(&y)
            }
            _ => std::cmp::Ordering::Equal,
        });
        ids.sort_by_key(|e| match e.id {
            ResourceId::Id(id) => id,
            ResourceId::Name(_) => 0,
        });
        named.extend(ids);
        named
    }

    /// Serialize the tree for a section mapped at `section_rva`.
    pub fn build(&self, section_rva: u32) -> Result<Vec<u8>> {
        // Breadth-first order fixes the offset of every directory up front.
        let mut dirs: Vec<&ResourceDirectory> = vec![self];
        let mut i = 0;
        while i < dirs.len() {
            for entry in dirs[i].sorted_entries() {
                if let ResourceNode::Directory(child) = &entry.node {
                    dirs.push(child);
                }
            }
            i += 1;
        }

        let mut dir_offsets = Vec::with_capacity(dirs.len());
        let mut cursor = 0usize;
        for dir in &dirs {
            dir_offsets.push(cursor);
            cursor += DIRECTORY_HEADER_SIZE + DIRECTORY_ENTRY_SIZE * dir.entries.len();
        }

        let mut out = vec![0u8; cursor];
        let mut pending_names: Vec<(usize, &[u16])> = Vec::new();
        let mut pending_leaves: Vec<(usize, &ResourceData)> = Vec::new();
        let mut next_child = 1;

        for (dir, &base) in dirs.iter().zip(&dir_offsets) {
            let entries = dir.sorted_entries();
            let named = entries
                .iter()
                .filter(|e| matches!(e.id, ResourceId::Name(_)))
                .count();
            put_u32(&mut out, base, dir.characteristics);
            put_u32(&mut out, base + 4, dir.time_date_stamp);
            put_u16(&mut out, base + 8, dir.major_version);
            put_u16(&mut out, base + 10, dir.minor_version);
            put_u16(&mut out, base + 12, named as u16);
            put_u16(&mut out, base + 14, (entries.len() - named) as u16);

            for (j, entry) in entries.iter().enumerate() {
                let at = base + DIRECTORY_HEADER_SIZE + DIRECTORY_ENTRY_SIZE * j;
                match &entry.id {
                    ResourceId::Id(id) => put_u32(&mut out, at, *id),
                    ResourceId::Name(name) => pending_names.push((at, name)),
                }
                match &entry.node {
                    ResourceNode::Directory(_) => {
                        put_u32(&mut out, at + 4, dir_offsets[next_child] as u32 | HIGH_BIT);
                        next_child += 1;
                    }
                    ResourceNode::Data(leaf) => pending_leaves.push((at + 4, leaf)),
                }
            }
        }

        for (at, name) in pending_names {
            let offset = out.len() as u32;
            out.extend_from_slice(&(name.len() as u16).to_le_bytes());
            for c in name {
                out.extend_from_slice(&c.to_le_bytes());
            }
            put_u32(&mut out, at, offset | HIGH_BIT);
        }
        pad_to(&mut out, 4);

        let mut inline: Vec<(usize, &[u8])> = Vec::new();
        for (at, leaf) in pending_leaves {
            let entry = out.len();
            out.resize(entry + DATA_ENTRY_SIZE, 0);
            put_u32(&mut out, at, entry as u32);
            match &leaf.location {
                DataLocation::Rva { rva, size } => {
                    put_u32(&mut out, entry, *rva);
                    put_u32(&mut out, entry + 4, *size);
                }
                DataLocation::Inline(bytes) => inline.push((entry, bytes)),
            }
            put_u32(&mut out, entry + 8, leaf.code_page);
        }

        for (entry, bytes) in inline {
            pad_to(&mut out, 8);
            let rva = section_rva as u64 + out.len() as u64;
            put_u32(&mut out, entry, to_u32(rva, "resource data RVA")?);
            put_u32(&mut out, entry + 4, to_u32(bytes.len() as u64, "resource size")?);
            out.extend_from_slice(bytes);
        }

        Ok(out)
    }
}

fn parse_directory(data: &[u8], root: usize, offset: usize, depth: usize) -> Result<ResourceDirectory> {
    if depth > MAX_DEPTH {
        return Err(Error::MalformedImage("resource tree is nested too deeply".into()));
    }

    let at = root + offset;
    let named = read_u16(data, at + 12, false)? as usize;
    let ids = read_u16(data, at + 14, false)? as usize;
    let mut dir = ResourceDirectory {
        characteristics: read_u32(data, at, false)?,
        time_date_stamp: read_u32(data, at + 4, false)?,
        major_version: read_u16(data, at + 8, false)?,
        minor_version: read_u16(data, at + 10, false)?,
        entries: Vec::with_capacity(named + ids),
    };

    for j in 0..named + ids {
        let entry_at = at + DIRECTORY_HEADER_SIZE + DIRECTORY_ENTRY_SIZE * j;
        let name_field = read_u32(data, entry_at, false)?;
        let target = read_u32(data, entry_at + 4, false)?;

        let id = if name_field & HIGH_BIT != 0 {
            let name_at = root + (name_field & !HIGH_BIT) as usize;
            let len = read_u16(data, name_at, false)? as usize;
            let mut name = Vec::with_capacity(len);
            for k in 0..len {
                name.push(read_u16(data, name_at + 2 + 2 * k, false)?);
            }
            ResourceId::Name(name)
        } else {
            ResourceId::Id(name_field)
        };

        let node = if target & HIGH_BIT != 0 {
            ResourceNode::Directory(parse_directory(
                data,
                root,
                (target & !HIGH_BIT) as usize,
                depth + 1,
            )?)
        } else {
            let leaf_at = root + target as usize;
            ResourceNode::Data(ResourceData {
                location: DataLocation::Rva {
                    rva: read_u32(data, leaf_at, false)?,
                    size: read_u32(data, leaf_at + 4, false)?,
                },
                code_page: read_u32(data, leaf_at + 8, false)?,
            })
        };

        dir.entries.push(ResourceEntry { id, node });
    }

    Ok(dir)
}

fn put_u16(out: &mut [u8], at: usize, value: u16) {
    out[at..at + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(out: &mut [u8], at: usize, value: u32) {
    out[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

fn pad_to(out: &mut Vec<u8>, alignment: usize) {
    let len = out.len().div_ceil(alignment) * alignment;
    out.resize(len, 0);
}
