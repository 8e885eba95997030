//! Protocol constants shared with the host runtime.
//!
//! These must match what the runtime looks for at startup byte-for-byte;
//! none of them are configurable.

// =============================================================================
// Injection protocol
// =============================================================================

/// Name of the embedded blob resource.
pub const RESOURCE_NAME: &str = "NODE_SEA_BLOB";

/// Sentinel fuse compiled into injectable host binaries.
///
/// The fuse is immediately followed by `:` and a flag byte.
pub const SENTINEL_FUSE: &str = "NODE_SEA_FUSE_fce680ab2cc467b6e072b8b5df1996b2";

/// Segment that carries the resource in Mach-O images.
pub const MACHO_SEGMENT_NAME: &str = "NODE_SEA";

/// Flag byte of an unarmed sentinel.
pub const SENTINEL_UNARMED: u8 = b'0';

/// Flag byte of a sentinel whose blob is present.
pub const SENTINEL_ARMED: u8 = b'1';

// =============================================================================
// Workspace layout
// =============================================================================

/// Prefix of the per-call temporary directory.
pub const WORKSPACE_PREFIX: &str = "seaforge-cache";

/// Script written into the workspace for the blob generator.
pub const INPUT_FILE_NAME: &str = "input.js";

/// Blob produced by the generator.
pub const BLOB_FILE_NAME: &str = "sea.blob";

/// Build-config document consumed by the generator.
pub const CONFIG_FILE_NAME: &str = "config.json";

// =============================================================================
// PE
// =============================================================================

/// "MZ"
pub const DOS_MAGIC: u16 = 0x5a4d;

/// "PE\0\0"
pub const PE_SIGNATURE: u32 = 0x0000_4550;

pub const PE32_MAGIC: u16 = 0x10b;
pub const PE32_PLUS_MAGIC: u16 = 0x20b;

pub const IMAGE_DIRECTORY_ENTRY_RESOURCE: usize = 2;
pub const IMAGE_DIRECTORY_ENTRY_SECURITY: usize = 4;

/// Resource type holding raw application data.
pub const RT_RCDATA: u32 = 10;

pub const IMAGE_SCN_CNT_INITIALIZED_DATA: u32 = 0x0000_0040;
pub const IMAGE_SCN_MEM_READ: u32 = 0x4000_0000;

/// Name of the section that carries the rebuilt resource tree.
pub const PE_RESOURCE_SECTION_NAME: &[u8; 8] = b".sea\0\0\0\0";

// =============================================================================
// ELF
// =============================================================================

pub const ELF_MAGIC: &[u8; 4] = b"\x7fELF";

pub const PT_LOAD: u32 = 1;
pub const PT_NOTE: u32 = 4;
pub const PT_PHDR: u32 = 6;
pub const PF_R: u32 = 4;

pub const SHT_NOTE: u32 = 7;
pub const SHF_ALLOC: u64 = 2;

/// Page size assumed for the appended ELF segment.
pub const ELF_PAGE_SIZE: u64 = 0x1000;

// =============================================================================
// Mach-O
// =============================================================================

pub const MH_MAGIC: u32 = 0xfeed_face;
pub const MH_CIGAM: u32 = 0xcefa_edfe;
pub const MH_MAGIC_64: u32 = 0xfeed_facf;
pub const MH_CIGAM_64: u32 = 0xcffa_edfe;
pub const FAT_MAGIC: u32 = 0xcafe_babe;
pub const FAT_CIGAM: u32 = 0xbeba_feca;

pub const LC_SEGMENT_64: u32 = 0x19;
pub const LC_SYMTAB: u32 = 0x2;
pub const LC_DYSYMTAB: u32 = 0xb;
pub const LC_CODE_SIGNATURE: u32 = 0x1d;
pub const LC_DYLD_INFO: u32 = 0x22;
pub const LC_DYLD_INFO_ONLY: u32 = 0x8000_0022;

/// Load commands whose payload is a `linkedit_data_command` (dataoff, datasize).
pub const LINKEDIT_DATA_COMMANDS: &[u32] = &[
    0x1d,        // LC_CODE_SIGNATURE
    0x1e,        // LC_SEGMENT_SPLIT_INFO
    0x26,        // LC_FUNCTION_STARTS
    0x29,        // LC_DATA_IN_CODE
    0x2b,        // LC_DYLIB_CODE_SIGN_DRS
    0x2e,        // LC_LINKER_OPTIMIZATION_HINT
    0x8000_0033, // LC_DYLD_EXPORTS_TRIE
    0x8000_0034, // LC_DYLD_CHAINED_FIXUPS
];

pub const MACH_HEADER_64_SIZE: usize = 32;
pub const SEGMENT_COMMAND_64_SIZE: usize = 72;
pub const SECTION_64_SIZE: usize = 80;

/// Segment alignment for arm64 and x86_64 executables.
pub const MACHO_PAGE_SIZE: u64 = 0x4000;

pub const VM_PROT_READ: u32 = 0x1;
