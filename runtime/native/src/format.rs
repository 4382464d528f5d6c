//! # 3DSX Image Format
//!
//! Fixed-layout structures found in a plugin image: the executable header
//! at the start of the stream and the plugin descriptor embedded at the
//! start of the relocated rodata segment.
//!
//! ## Stream Layout
//!
//! ```text
//! ┌──────────────────────────┐  0
//! │   Executable header      │  32 bytes (+ optional asset block)
//! ├──────────────────────────┤  header_size
//! │   Relocation counts      │  3 segments × groups × u32
//! ├──────────────────────────┤
//! │   code | rodata | data   │  data excludes the bss tail
//! ├──────────────────────────┤
//! │   Relocation runs        │  (u16 skip, u16 patch) per entry
//! └──────────────────────────┘
//! ```

use alloc::string::String;
use core::fmt;

use crate::reader::{ImageReader, ImageSource, StreamError};

// =============================================================================
// Constants
// =============================================================================

/// Executable magic: `"3DSX"`.
pub const IMAGE_MAGIC: u32 = 0x5853_4433;

/// Size of the fixed executable header.
pub const HEADER_SIZE: usize = 32;

/// Header size at which the asset block is present.
pub const EXTENDED_HEADER_SIZE: usize = 44;

/// Segment alignment in memory and in the linked address space.
pub const PAGE_SIZE: usize = 0x1000;

/// Size of one relocation-group count in the relocation header.
pub const RELOC_COUNT_SIZE: usize = 4;

/// Size of one encoded relocation entry.
pub const RELOC_ENTRY_SIZE: usize = 4;

/// Plugin descriptor magic: `"LPLG"`.
pub const PLUGIN_MAGIC: u32 = 0x474C_504C;

/// Plugin descriptor version understood by this host.
pub const PLUGIN_VERSION: u32 = 0;

/// Length of the descriptor's name field.
pub const PLUGIN_NAME_LEN: usize = 32;

/// Size of the plugin descriptor in rodata.
pub const DESCRIPTOR_SIZE: usize = 56;

/// Rounds `size` up to the next page boundary.
///
/// For sizes taken from an image use [`checked_page_align`].
pub const fn page_align(size: usize) -> usize {
    (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Rounds `size` up to the next page boundary, or `None` if that
/// overflows.
pub const fn checked_page_align(size: usize) -> Option<usize> {
    match size.checked_add(PAGE_SIZE - 1) {
        Some(end) => Some(end & !(PAGE_SIZE - 1)),
        None => None,
    }
}

// =============================================================================
// Errors
// =============================================================================

/// The image bytes do not describe a loadable plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    /// Executable magic mismatch.
    BadMagic(u32),
    /// Header size smaller than the fixed header.
    HeaderTooSmall(u16),
    /// bss larger than the data segment that contains it.
    BssOverrun { data: u32, bss: u32 },
    /// Page-aligned segments do not fit the 32-bit linked address space.
    LayoutOverflow { code: u32, rodata: u32, data: u32 },
    /// Rodata too small to hold a descriptor.
    DescriptorMissing,
    /// Descriptor magic mismatch.
    BadPluginMagic(u32),
    /// Descriptor version mismatch.
    BadPluginVersion(u32),
}

impl fmt::Display for FormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FormatError::BadMagic(m) => write!(f, "bad executable magic 0x{:08X}", m),
            FormatError::HeaderTooSmall(s) => write!(f, "header size {} is too small", s),
            FormatError::BssOverrun { data, bss } => {
                write!(f, "bss size 0x{:X} exceeds data size 0x{:X}", bss, data)
            }
            FormatError::LayoutOverflow { code, rodata, data } => write!(
                f,
                "segments 0x{:X}/0x{:X}/0x{:X} overflow the 32-bit address space",
                code, rodata, data
            ),
            FormatError::DescriptorMissing => write!(f, "rodata does not hold a plugin descriptor"),
            FormatError::BadPluginMagic(m) => write!(f, "bad plugin magic 0x{:08X}", m),
            FormatError::BadPluginVersion(v) => write!(f, "unsupported plugin version {}", v),
        }
    }
}

/// Errors raised while parsing the executable header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderError {
    Stream(StreamError),
    Format(FormatError),
}

impl From<StreamError> for HeaderError {
    fn from(e: StreamError) -> Self {
        HeaderError::Stream(e)
    }
}

impl From<FormatError> for HeaderError {
    fn from(e: FormatError) -> Self {
        HeaderError::Format(e)
    }
}

// =============================================================================
// Executable Header
// =============================================================================

/// Asset block present in extended headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssetInfo {
    pub smdh_offset: u32,
    pub smdh_size: u32,
    pub romfs_offset: u32,
}

/// Parsed executable header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutableHeader {
    /// Format tag.
    pub magic: u32,
    /// Offset of the relocation header in the stream.
    pub header_size: u16,
    /// Size of the relocation header in bytes.
    pub reloc_hdr_size: u16,
    /// Format revision.
    pub format_version: u32,
    /// Format flags.
    pub flags: u32,
    /// Code segment size.
    pub code_size: u32,
    /// Rodata segment size.
    pub rodata_size: u32,
    /// Data segment size, bss included.
    pub data_size: u32,
    /// Zero-initialized tail of the data segment.
    pub bss_size: u32,
    /// Optional asset block.
    pub assets: Option<AssetInfo>,
}

impl ExecutableHeader {
    /// Reads and validates the header from the current reader position.
    pub fn read<S: ImageSource>(reader: &mut ImageReader<S>) -> Result<Self, HeaderError> {
        let mut raw = [0u8; HEADER_SIZE];
        reader.read_exact(&mut raw)?;

        let header = Self::parse(&raw)?;

        let assets = if header.header_size as usize >= EXTENDED_HEADER_SIZE {
            Some(AssetInfo {
                smdh_offset: reader.read_u32()?,
                smdh_size: reader.read_u32()?,
                romfs_offset: reader.read_u32()?,
            })
        } else {
            None
        };

        Ok(Self { assets, ..header })
    }

    /// Parses the fixed 32-byte header.
    pub fn parse(raw: &[u8; HEADER_SIZE]) -> Result<Self, FormatError> {
        let header = Self {
            magic: le_u32(raw, 0),
            header_size: le_u16(raw, 4),
            reloc_hdr_size: le_u16(raw, 6),
            format_version: le_u32(raw, 8),
            flags: le_u32(raw, 12),
            code_size: le_u32(raw, 16),
            rodata_size: le_u32(raw, 20),
            data_size: le_u32(raw, 24),
            bss_size: le_u32(raw, 28),
            assets: None,
        };

        if header.magic != IMAGE_MAGIC {
            return Err(FormatError::BadMagic(header.magic));
        }
        if (header.header_size as usize) < HEADER_SIZE {
            return Err(FormatError::HeaderTooSmall(header.header_size));
        }
        if header.bss_size > header.data_size {
            return Err(FormatError::BssOverrun {
                data: header.data_size,
                bss: header.bss_size,
            });
        }

        header.segment_sizes()?;

        Ok(header)
    }

    /// Page-aligned code, rodata and data sizes.
    ///
    /// Fails unless all three segments, laid out back to back, fit in the
    /// 32-bit linked address space.
    pub fn segment_sizes(&self) -> Result<[u32; 3], FormatError> {
        let overflow = FormatError::LayoutOverflow {
            code: self.code_size,
            rodata: self.rodata_size,
            data: self.data_size,
        };
        let align = |size: u32| (size as u64 + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1);

        let sizes = [align(self.code_size), align(self.rodata_size), align(self.data_size)];
        if sizes.iter().sum::<u64>() > u32::MAX as u64 {
            return Err(overflow);
        }
        Ok(sizes.map(|size| size as u32))
    }

    /// Number of relocation groups declared per segment.
    pub fn reloc_groups(&self) -> usize {
        self.reloc_hdr_size as usize / RELOC_COUNT_SIZE
    }

    /// Bytes of data-segment payload present in the stream.
    pub fn data_payload(&self) -> u32 {
        self.data_size - self.bss_size
    }
}

// =============================================================================
// Plugin Descriptor
// =============================================================================

/// Plugin descriptor as it sits in relocated rodata.
///
/// Entry-point fields hold live 32-bit addresses once relocation has run;
/// zero means the entry point is absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginDescriptor {
    pub magic: u32,
    pub version: u32,
    /// Decoded name, up to the first NUL.
    pub name: String,
    /// Address of the image's syscall table.
    pub syscalls: u32,
    pub load: u32,
    pub unload: u32,
    pub tick: u32,
}

impl PluginDescriptor {
    /// Decodes the descriptor at the start of `rodata`.
    pub fn parse(rodata: &[u8]) -> Result<Self, FormatError> {
        if rodata.len() < DESCRIPTOR_SIZE {
            return Err(FormatError::DescriptorMissing);
        }

        let name_field = &rodata[8..8 + PLUGIN_NAME_LEN];
        let name_len = name_field
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(PLUGIN_NAME_LEN);

        Ok(Self {
            magic: le_u32(rodata, 0),
            version: le_u32(rodata, 4),
            name: String::from_utf8_lossy(&name_field[..name_len]).into_owned(),
            syscalls: le_u32(rodata, 40),
            load: le_u32(rodata, 44),
            unload: le_u32(rodata, 48),
            tick: le_u32(rodata, 52),
        })
    }

    /// Checks magic and version against what the host supports.
    pub fn validate(&self, magic: u32, version: u32) -> Result<(), FormatError> {
        if self.magic != magic {
            return Err(FormatError::BadPluginMagic(self.magic));
        }
        if self.version != version {
            return Err(FormatError::BadPluginVersion(self.version));
        }
        Ok(())
    }
}

fn le_u16(raw: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([raw[at], raw[at + 1]])
}

fn le_u32(raw: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]])
}
