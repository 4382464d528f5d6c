//! # Relocation Engine
//!
//! Patches address-valued 32-bit words inside a loaded segment so they
//! point at the segment buffers actually allocated for the image.
//!
//! Relocations arrive as run-length encoded `(skip, patch)` entries. The
//! engine keeps one write cursor per segment and group: `skip` words are
//! stepped over, then `patch` consecutive words are rewritten. Each raw
//! word carries a 4-bit subtype in its top nibble and a 28-bit offset into
//! the linked `code | rodata | data` address space.
//!
//! ```text
//!  31    28 27                                0
//! ┌────────┬───────────────────────────────────┐
//! │subtype │      file-relative offset         │
//! └────────┴───────────────────────────────────┘
//! ```

use core::fmt;

use crate::format::RELOC_ENTRY_SIZE;

// =============================================================================
// Types
// =============================================================================

/// Relocation encoding group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocGroup {
    /// Word receives the resolved address.
    Absolute,
    /// Word receives the displacement from itself to the resolved address.
    Relative,
}

impl RelocGroup {
    /// Maps a relocation-header group index to an interpreted group.
    ///
    /// Groups beyond the first two are reserved and return `None`.
    pub fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(RelocGroup::Absolute),
            1 => Some(RelocGroup::Relative),
            _ => None,
        }
    }
}

/// One `(skip, patch)` run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelocEntry {
    /// Words to step over.
    pub skip: u16,
    /// Words to patch after the skip.
    pub patch: u16,
}

impl RelocEntry {
    /// Decodes an entry from its stream form.
    pub fn from_bytes(raw: [u8; RELOC_ENTRY_SIZE]) -> Self {
        Self {
            skip: u16::from_le_bytes([raw[0], raw[1]]),
            patch: u16::from_le_bytes([raw[2], raw[3]]),
        }
    }

    pub fn to_bytes(self) -> [u8; RELOC_ENTRY_SIZE] {
        let mut raw = [0u8; RELOC_ENTRY_SIZE];
        raw[0..2].copy_from_slice(&self.skip.to_le_bytes());
        raw[2..4].copy_from_slice(&self.patch.to_le_bytes());
        raw
    }
}

/// Malformed relocation data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelocError {
    /// Subtype not defined for the group.
    BadSubtype {
        group: RelocGroup,
        subtype: u32,
        /// Byte offset of the offending word within its segment.
        at: usize,
    },
    /// Offset resolves past the end of its segment.
    AddressOutOfRange {
        offset: u32,
        /// Byte offset of the offending word within its segment.
        at: usize,
    },
}

impl fmt::Display for RelocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelocError::BadSubtype { group, subtype, at } => write!(
                f,
                "invalid {:?} relocation subtype {} at +0x{:X}",
                group, subtype, at
            ),
            RelocError::AddressOutOfRange { offset, at } => write!(
                f,
                "relocation offset 0x{:X} at +0x{:X} is outside the image",
                offset, at
            ),
        }
    }
}

// =============================================================================
// Address Space
// =============================================================================

/// One segment as seen by relocation: where it starts in the linked
/// address space, where it lives now, and how large it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentSpan {
    /// Offset of the segment in the linked address space.
    pub start: u32,
    /// Live 32-bit address of the segment buffer.
    pub base: u32,
    /// Allocated size in bytes.
    pub len: u32,
}

/// Ordered mapping from linked offsets to live addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressSpace {
    spans: [SegmentSpan; 3],
}

impl AddressSpace {
    /// Builds the mapping from the page-aligned linked sizes of code and
    /// rodata and the live `(base, len)` of each segment.
    pub fn new(linked: [u32; 2], live: [(u32, u32); 3]) -> Self {
        let starts = [0, linked[0], linked[0].wrapping_add(linked[1])];
        let mut spans = [SegmentSpan { start: 0, base: 0, len: 0 }; 3];
        for (i, span) in spans.iter_mut().enumerate() {
            *span = SegmentSpan {
                start: starts[i],
                base: live[i].0,
                len: live[i].1,
            };
        }
        Self { spans }
    }

    /// Span for a segment index.
    pub fn span(&self, index: usize) -> SegmentSpan {
        self.spans[index]
    }

    /// Resolves a linked offset to a live address.
    ///
    /// An offset one past the end of its segment is accepted; anything
    /// further is not.
    pub fn resolve(&self, offset: u32) -> Option<u32> {
        let span = self
            .spans
            .iter()
            .rev()
            .find(|span| offset >= span.start)?;
        let within = offset - span.start;
        if within > span.len {
            return None;
        }
        Some(span.base.wrapping_add(within))
    }
}

// =============================================================================
// Relocator
// =============================================================================

/// Applies one relocation group to one segment.
///
/// Entries may be fed in several batches; the cursor carries over between
/// calls. Once the cursor reaches the end of the segment, further entries
/// are accepted and ignored so the caller can keep draining its stream.
pub struct Relocator<'a> {
    words: &'a mut [u8],
    /// Live 32-bit address of `words[0]`.
    base: u32,
    space: &'a AddressSpace,
    group: RelocGroup,
    /// Cursor in words.
    cursor: usize,
    patched: usize,
}

impl<'a> Relocator<'a> {
    pub fn new(
        words: &'a mut [u8],
        base: u32,
        space: &'a AddressSpace,
        group: RelocGroup,
    ) -> Self {
        Self {
            words,
            base,
            space,
            group,
            cursor: 0,
            patched: 0,
        }
    }

    fn word_count(&self) -> usize {
        self.words.len() / 4
    }

    /// True once the cursor has run off the end of the segment.
    pub fn exhausted(&self) -> bool {
        self.cursor >= self.word_count()
    }

    /// Number of words patched so far.
    pub fn patched(&self) -> usize {
        self.patched
    }

    /// Applies a batch of entries.
    pub fn apply(&mut self, entries: &[RelocEntry]) -> Result<(), RelocError> {
        let end = self.word_count();

        for entry in entries {
            if self.cursor >= end {
                break;
            }
            self.cursor += entry.skip as usize;

            let mut remaining = entry.patch;
            while remaining > 0 && self.cursor < end {
                self.patch_word()?;
                self.cursor += 1;
                remaining -= 1;
            }
        }
        Ok(())
    }

    fn patch_word(&mut self) -> Result<(), RelocError> {
        let at = self.cursor * 4;
        let raw = u32::from_le_bytes([
            self.words[at],
            self.words[at + 1],
            self.words[at + 2],
            self.words[at + 3],
        ]);
        let subtype = raw >> 28;
        let offset = raw & 0x0FFF_FFFF;

        let addr = self
            .space
            .resolve(offset)
            .ok_or(RelocError::AddressOutOfRange { offset, at })?;

        let value = match (self.group, subtype) {
            (RelocGroup::Absolute, 0) => addr,
            (RelocGroup::Relative, 0) => addr.wrapping_sub(self.word_addr(at)),
            (RelocGroup::Relative, 1) => addr.wrapping_sub(self.word_addr(at)) & 0x7FFF_FFFF,
            (group, subtype) => return Err(RelocError::BadSubtype { group, subtype, at }),
        };

        self.words[at..at + 4].copy_from_slice(&value.to_le_bytes());
        self.patched += 1;
        Ok(())
    }

    fn word_addr(&self, at: usize) -> u32 {
        self.base.wrapping_add(at as u32)
    }
}
