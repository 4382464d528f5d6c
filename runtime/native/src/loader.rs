//! # Image Loader
//!
//! Materializes one plugin image: header, segment allocation, payload,
//! bss, relocation, and descriptor validation, in that order.
//!
//! A load either produces a fully relocated [`LoadedImage`] or fails with
//! every segment allocated for it already released. Nothing here touches
//! other images.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use crate::format::{
    ExecutableHeader, FormatError, HeaderError, PluginDescriptor, RELOC_COUNT_SIZE,
    RELOC_ENTRY_SIZE,
};
use crate::heap::ProgramBreak;
use crate::reader::{ImageReader, ImageSource, StreamError};
use crate::reloc::{AddressSpace, RelocEntry, RelocError, RelocGroup, Relocator};
use crate::segment::{PageAllocator, Segment, SegmentKind, SegmentSet};
use crate::LoaderConfig;

/// Longest file name kept for an image.
pub const FILE_NAME_MAX: usize = 31;

// =============================================================================
// Errors
// =============================================================================

/// Why an image failed to load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    /// Reading the image failed.
    Stream(StreamError),
    /// The image is malformed.
    Format(FormatError),
    /// Relocation data is malformed.
    Relocation(RelocError),
    /// A segment or scratch buffer could not be allocated.
    OutOfMemory { size: usize },
    /// The image cannot run on this host.
    ArchitectureMismatch,
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadError::Stream(e) => write!(f, "stream error: {}", e),
            LoadError::Format(e) => write!(f, "format error: {}", e),
            LoadError::Relocation(e) => write!(f, "relocation error: {}", e),
            LoadError::OutOfMemory { size } => write!(f, "out of memory allocating 0x{:X} bytes", size),
            LoadError::ArchitectureMismatch => write!(f, "image cannot execute on this host"),
        }
    }
}

impl From<StreamError> for LoadError {
    fn from(e: StreamError) -> Self {
        LoadError::Stream(e)
    }
}

impl From<FormatError> for LoadError {
    fn from(e: FormatError) -> Self {
        LoadError::Format(e)
    }
}

impl From<RelocError> for LoadError {
    fn from(e: RelocError) -> Self {
        LoadError::Relocation(e)
    }
}

impl From<HeaderError> for LoadError {
    fn from(e: HeaderError) -> Self {
        match e {
            HeaderError::Stream(e) => LoadError::Stream(e),
            HeaderError::Format(e) => LoadError::Format(e),
        }
    }
}

// =============================================================================
// Loaded Image
// =============================================================================

/// A relocated, validated plugin image.
#[derive(Debug)]
pub struct LoadedImage {
    file: String,
    header: ExecutableHeader,
    descriptor: PluginDescriptor,
    segments: SegmentSet,
    brk: ProgramBreak,
}

impl LoadedImage {
    /// File name the image was loaded from.
    pub fn file(&self) -> &str {
        &self.file
    }

    /// Name declared in the descriptor.
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn header(&self) -> &ExecutableHeader {
        &self.header
    }

    pub fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    pub fn segments(&self) -> &SegmentSet {
        &self.segments
    }

    pub fn segment(&self, kind: SegmentKind) -> Option<&Segment> {
        self.segments.get(kind)
    }

    /// The image's program break.
    pub fn program_break(&self) -> &ProgramBreak {
        &self.brk
    }
}

// =============================================================================
// Loader
// =============================================================================

/// Loads plugin images into freshly allocated segments.
pub struct ImageLoader {
    config: LoaderConfig,
    pages: Arc<dyn PageAllocator>,
}

impl ImageLoader {
    pub fn new(config: LoaderConfig, pages: Arc<dyn PageAllocator>) -> Self {
        Self { config, pages }
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Loads one image from `source`.
    pub fn load<S: ImageSource>(&self, file: &str, source: S) -> Result<LoadedImage, LoadError> {
        let mut reader = ImageReader::new(source);

        let header = ExecutableHeader::read(&mut reader)?;
        log::debug!(
            "{}: code {:#x}, rodata {:#x}, data {:#x} (bss {:#x}), {} reloc groups",
            file,
            header.code_size,
            header.rodata_size,
            header.data_size,
            header.bss_size,
            header.reloc_groups()
        );

        let sizes = header.segment_sizes()?;
        let mut segments = self.allocate_segments(sizes)?;

        // Bytes between the fixed header and the relocation counts are
        // reserved; always resume at the declared header size.
        reader.seek(header.header_size as u64);

        let groups = header.reloc_groups();
        let counts = read_reloc_counts(&mut reader, groups)?;

        read_payload(&mut reader, &mut segments, SegmentKind::Code, header.code_size)?;
        read_payload(&mut reader, &mut segments, SegmentKind::ReadOnlyData, header.rodata_size)?;
        read_payload(&mut reader, &mut segments, SegmentKind::Data, header.data_payload())?;

        if let Some(data) = segments.get_mut(SegmentKind::Data) {
            let start = header.data_payload() as usize;
            data.as_mut_slice()[start..header.data_size as usize].fill(0);
        }

        self.relocate(&mut reader, &mut segments, &header, sizes, &counts)?;

        let rodata = segments
            .get(SegmentKind::ReadOnlyData)
            .map(Segment::as_slice)
            .unwrap_or(&[]);
        let descriptor = PluginDescriptor::parse(rodata)?;
        descriptor.validate(self.config.plugin_magic, self.config.plugin_version)?;

        let brk = match segments.get(SegmentKind::Data) {
            Some(data) => ProgramBreak::new(
                data.addr(),
                data.len(),
                sizes[2] as usize,
            ),
            None => ProgramBreak::new(0, 0, 0),
        };

        log::info!(
            "{}: loaded plugin '{}' ({:#x} bytes)",
            file,
            descriptor.name,
            segments.total_size()
        );

        Ok(LoadedImage {
            file: truncate_file_name(file),
            header,
            descriptor,
            segments,
            brk,
        })
    }

    fn allocate_segments(&self, aligned: [u32; 3]) -> Result<SegmentSet, LoadError> {
        let data = (aligned[2] as usize)
            .checked_add(self.config.heap_reserve)
            .ok_or(LoadError::OutOfMemory { size: usize::MAX })?;
        let sizes = [aligned[0] as usize, aligned[1] as usize, data];

        let mut segments = SegmentSet::new();
        for (kind, size) in SegmentKind::ALL.into_iter().zip(sizes) {
            if size == 0 {
                continue;
            }
            // Segments already allocated are released when `segments` drops.
            let segment = Segment::allocate(kind, size, &self.pages)
                .ok_or(LoadError::OutOfMemory { size })?;
            segments.insert(segment);
        }
        Ok(segments)
    }

    fn relocate<S: ImageSource>(
        &self,
        reader: &mut ImageReader<S>,
        segments: &mut SegmentSet,
        header: &ExecutableHeader,
        aligned: [u32; 3],
        counts: &[u32],
    ) -> Result<(), LoadError> {
        let groups = header.reloc_groups();
        let live = SegmentKind::ALL.map(|kind| {
            segments
                .get(kind)
                .map(|s| (s.image_addr(), s.len() as u32))
                .unwrap_or((0, 0))
        });
        let space = AddressSpace::new([aligned[0], aligned[1]], live);

        let batch_len = self.config.reloc_batch.max(1);
        let mut batch: Vec<RelocEntry> = Vec::new();
        batch
            .try_reserve_exact(batch_len)
            .map_err(|_| LoadError::OutOfMemory {
                size: batch_len.saturating_mul(RELOC_ENTRY_SIZE),
            })?;

        for kind in SegmentKind::ALL {
            for index in 0..groups {
                let count = counts[kind.index() * groups + index] as usize;

                let group = match RelocGroup::from_index(index) {
                    Some(group) => group,
                    None => {
                        reader.skip(count as u64 * RELOC_ENTRY_SIZE as u64);
                        continue;
                    }
                };
                if count == 0 {
                    continue;
                }

                let mut empty: [u8; 0] = [];
                let (words, base) = match segments.get_mut(kind) {
                    Some(segment) => {
                        let base = segment.image_addr();
                        (segment.as_mut_slice(), base)
                    }
                    None => (&mut empty[..], 0),
                };

                let mut relocator = Relocator::new(words, base, &space, group);
                let mut remaining = count;
                while remaining > 0 {
                    let take = remaining.min(batch_len);
                    remaining -= take;

                    batch.clear();
                    for _ in 0..take {
                        let mut raw = [0u8; RELOC_ENTRY_SIZE];
                        reader.read_exact(&mut raw)?;
                        batch.push(RelocEntry::from_bytes(raw));
                    }
                    relocator.apply(&batch)?;
                }

                log::debug!(
                    "{:?} {:?}: {} runs, {} words patched",
                    kind,
                    group,
                    count,
                    relocator.patched()
                );
            }
        }
        Ok(())
    }
}

fn read_reloc_counts<S: ImageSource>(
    reader: &mut ImageReader<S>,
    groups: usize,
) -> Result<Vec<u32>, LoadError> {
    let total = SegmentKind::ALL.len() * groups;
    let mut counts = Vec::new();
    counts
        .try_reserve_exact(total)
        .map_err(|_| LoadError::OutOfMemory { size: total * RELOC_COUNT_SIZE })?;
    for _ in 0..total {
        counts.push(reader.read_u32()?);
    }
    Ok(counts)
}

fn read_payload<S: ImageSource>(
    reader: &mut ImageReader<S>,
    segments: &mut SegmentSet,
    kind: SegmentKind,
    len: u32,
) -> Result<(), LoadError> {
    if len == 0 {
        return Ok(());
    }
    if let Some(segment) = segments.get_mut(kind) {
        reader.read_exact(&mut segment.as_mut_slice()[..len as usize])?;
    }
    Ok(())
}

fn truncate_file_name(file: &str) -> String {
    let mut end = file.len().min(FILE_NAME_MAX);
    while !file.is_char_boundary(end) {
        end -= 1;
    }
    String::from(&file[..end])
}
