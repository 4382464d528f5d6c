//! # Image Builder
//!
//! Assembles 3DSX plugin images in memory. Used to produce synthetic
//! images for tests and for exercising a host without a cross toolchain.
//!
//! The builder lays segments out the way the loader expects: code at linked
//! offset 0, rodata at the next page boundary, data after that. Relocation
//! entries are given per segment as `(skip, patch)` runs and written
//! verbatim.

use alloc::vec::Vec;

use crate::format::{
    page_align, DESCRIPTOR_SIZE, HEADER_SIZE, IMAGE_MAGIC, PLUGIN_MAGIC, PLUGIN_NAME_LEN,
    PLUGIN_VERSION,
};
use crate::reloc::RelocEntry;
use crate::segment::SegmentKind;

/// Word index of the `load` field inside the descriptor.
const DESCRIPTOR_LOAD_WORD: usize = 11;

/// Builder for a 3DSX image.
#[derive(Debug, Clone)]
pub struct ImageBuilder {
    code: Vec<u8>,
    rodata: Vec<u8>,
    data: Vec<u8>,
    bss: u32,
    header_padding: usize,
    extra_groups: usize,
    /// Code offsets of load / unload / tick; 0 is a null entry.
    entries: Option<[u32; 3]>,
    relocs: [[Vec<RelocEntry>; 3]; 3],
}

impl ImageBuilder {
    /// An image with empty segments and no descriptor.
    pub fn new() -> Self {
        Self {
            code: Vec::new(),
            rodata: Vec::new(),
            data: Vec::new(),
            bss: 0,
            header_padding: 0,
            extra_groups: 0,
            entries: None,
            relocs: Default::default(),
        }
    }

    /// An image whose rodata starts with a valid descriptor named `name`.
    pub fn plugin(name: &str) -> Self {
        let mut rodata = Vec::with_capacity(DESCRIPTOR_SIZE);
        rodata.extend_from_slice(&PLUGIN_MAGIC.to_le_bytes());
        rodata.extend_from_slice(&PLUGIN_VERSION.to_le_bytes());

        let mut name_field = [0u8; PLUGIN_NAME_LEN];
        let len = name.len().min(PLUGIN_NAME_LEN - 1);
        name_field[..len].copy_from_slice(&name.as_bytes()[..len]);
        rodata.extend_from_slice(&name_field);

        // syscalls, load, unload, tick
        rodata.resize(DESCRIPTOR_SIZE, 0);

        Self {
            rodata,
            ..Self::new()
        }
    }

    pub fn code(mut self, code: &[u8]) -> Self {
        self.code = code.to_vec();
        self
    }

    /// Appends bytes to rodata after whatever is already there.
    pub fn rodata(mut self, bytes: &[u8]) -> Self {
        self.rodata.extend_from_slice(bytes);
        self
    }

    /// Initialized data, excluding bss.
    pub fn data(mut self, data: &[u8]) -> Self {
        self.data = data.to_vec();
        self
    }

    pub fn bss(mut self, size: u32) -> Self {
        self.bss = size;
        self
    }

    /// Overrides the descriptor version.
    pub fn version(mut self, version: u32) -> Self {
        self.write_rodata_word(1, version);
        self
    }

    /// Overrides the descriptor magic.
    pub fn plugin_magic(mut self, magic: u32) -> Self {
        self.write_rodata_word(0, magic);
        self
    }

    /// Sets descriptor entry points as code offsets; 0 leaves one null.
    ///
    /// Non-null entries get absolute relocations so they hold live
    /// addresses after loading.
    pub fn entry_points(mut self, load: u32, unload: u32, tick: u32) -> Self {
        self.entries = Some([load, unload, tick]);
        self
    }

    /// Reserved bytes between the fixed header and the relocation counts.
    pub fn header_padding(mut self, len: usize) -> Self {
        self.header_padding = len;
        self
    }

    /// Declares `n` relocation groups beyond absolute and relative.
    pub fn extra_groups(mut self, n: usize) -> Self {
        self.extra_groups = n;
        self
    }

    pub fn absolute(mut self, kind: SegmentKind, entries: &[RelocEntry]) -> Self {
        self.relocs[kind.index()][0].extend_from_slice(entries);
        self
    }

    pub fn relative(mut self, kind: SegmentKind, entries: &[RelocEntry]) -> Self {
        self.relocs[kind.index()][1].extend_from_slice(entries);
        self
    }

    /// Entries for the first reserved group; needs `extra_groups(1)` or more.
    pub fn reserved(mut self, kind: SegmentKind, entries: &[RelocEntry]) -> Self {
        self.relocs[kind.index()][2].extend_from_slice(entries);
        self
    }

    /// Linked offset of the data segment.
    pub fn data_offset(&self) -> u32 {
        (page_align(self.code.len()) + page_align(self.rodata.len())) as u32
    }

    /// Serializes the image.
    pub fn build(&self) -> Vec<u8> {
        let mut rodata = self.rodata.clone();
        let mut rodata_abs = Vec::new();

        if let Some(entries) = self.entries {
            if rodata.len() < DESCRIPTOR_SIZE {
                rodata.resize(DESCRIPTOR_SIZE, 0);
            }
            let mut cursor = 0;
            for (i, &offset) in entries.iter().enumerate() {
                if offset == 0 {
                    continue;
                }
                let word = DESCRIPTOR_LOAD_WORD + i;
                rodata[word * 4..word * 4 + 4].copy_from_slice(&offset.to_le_bytes());
                rodata_abs.push(RelocEntry {
                    skip: (word - cursor) as u16,
                    patch: 1,
                });
                cursor = word + 1;
            }
        }
        rodata_abs.extend_from_slice(&self.relocs[SegmentKind::ReadOnlyData.index()][0]);

        let groups = 2 + self.extra_groups;

        let header_size = HEADER_SIZE + self.header_padding;
        let mut out = Vec::new();
        out.extend_from_slice(&IMAGE_MAGIC.to_le_bytes());
        out.extend_from_slice(&(header_size as u16).to_le_bytes());
        out.extend_from_slice(&((groups * 4) as u16).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&(self.code.len() as u32).to_le_bytes());
        out.extend_from_slice(&(rodata.len() as u32).to_le_bytes());
        out.extend_from_slice(&(self.data.len() as u32 + self.bss).to_le_bytes());
        out.extend_from_slice(&self.bss.to_le_bytes());
        out.resize(header_size, 0);

        for seg in 0..3 {
            for group in 0..groups {
                let count = self.group_entries(&rodata_abs, seg, group).len() as u32;
                out.extend_from_slice(&count.to_le_bytes());
            }
        }

        out.extend_from_slice(&self.code);
        out.extend_from_slice(&rodata);
        out.extend_from_slice(&self.data);

        for seg in 0..3 {
            for group in 0..groups {
                for entry in self.group_entries(&rodata_abs, seg, group) {
                    out.extend_from_slice(&entry.to_bytes());
                }
            }
        }

        out
    }

    fn group_entries<'a>(
        &'a self,
        rodata_abs: &'a [RelocEntry],
        seg: usize,
        group: usize,
    ) -> &'a [RelocEntry] {
        if seg == SegmentKind::ReadOnlyData.index() && group == 0 {
            rodata_abs
        } else if group < 3 {
            &self.relocs[seg][group]
        } else {
            &[]
        }
    }

    fn write_rodata_word(&mut self, word: usize, value: u32) {
        let at = word * 4;
        if self.rodata.len() < at + 4 {
            self.rodata.resize(at + 4, 0);
        }
        self.rodata[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }
}

impl Default for ImageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::ExecutableHeader;

    #[test]
    fn test_header_fields() {
        let image = ImageBuilder::plugin("hdr")
            .code(&[0u8; 12])
            .data(&[0u8; 8])
            .bss(8)
            .extra_groups(1)
            .build();

        let mut raw = [0u8; HEADER_SIZE];
        raw.copy_from_slice(&image[..HEADER_SIZE]);
        let header = ExecutableHeader::parse(&raw).unwrap();
        assert_eq!(header.code_size, 12);
        assert_eq!(header.rodata_size, DESCRIPTOR_SIZE as u32);
        assert_eq!(header.data_size, 16);
        assert_eq!(header.bss_size, 8);
        assert_eq!(header.reloc_groups(), 3);
    }

    #[test]
    fn test_descriptor_relocations_emitted() {
        let image = ImageBuilder::plugin("e").entry_points(4, 0, 8).build();
        // header + 6 counts + rodata, then two rodata absolute entries
        let relocs = &image[HEADER_SIZE + 24 + DESCRIPTOR_SIZE..];
        assert_eq!(relocs.len(), 8);
        assert_eq!(RelocEntry::from_bytes([relocs[0], relocs[1], relocs[2], relocs[3]]),
            RelocEntry { skip: 11, patch: 1 });
        assert_eq!(RelocEntry::from_bytes([relocs[4], relocs[5], relocs[6], relocs[7]]),
            RelocEntry { skip: 1, patch: 1 });
    }

    #[test]
    fn test_data_offset() {
        let builder = ImageBuilder::plugin("o").code(&[0u8; 0x1001]);
        assert_eq!(builder.data_offset(), 0x3000);
    }
}
