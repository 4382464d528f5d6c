//! # Segment Allocation
//!
//! Page-aligned buffers backing the three segments of a loaded image, the
//! permissions each one should end up with, and the seam through which
//! those permissions are applied.
//!
//! Buffers are released when their [`Segment`] is dropped, so an image
//! that fails halfway through loading gives its memory back simply by
//! going out of scope.

use alloc::sync::Arc;
use core::alloc::Layout;
use core::fmt;
use core::ptr::NonNull;

use bitflags::bitflags;
use spin::Mutex;

use crate::format::{checked_page_align, PAGE_SIZE};

// =============================================================================
// Permissions
// =============================================================================

bitflags! {
    /// Memory access permissions for a segment.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MemPerm: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

/// Which segment of an image a buffer backs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SegmentKind {
    /// Executable code.
    Code = 0,
    /// Read-only data; starts with the plugin descriptor.
    ReadOnlyData = 1,
    /// Read-write data followed by the image heap.
    Data = 2,
}

impl SegmentKind {
    /// All kinds in stream order.
    pub const ALL: [SegmentKind; 3] = [
        SegmentKind::Code,
        SegmentKind::ReadOnlyData,
        SegmentKind::Data,
    ];

    /// Permission the segment receives once the batch is finalized.
    pub fn target_permissions(self) -> MemPerm {
        match self {
            SegmentKind::Code => MemPerm::READ | MemPerm::EXECUTE,
            SegmentKind::ReadOnlyData => MemPerm::READ,
            SegmentKind::Data => MemPerm::READ | MemPerm::WRITE,
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

// =============================================================================
// Page Allocation
// =============================================================================

/// Source of page-aligned memory for segments.
pub trait PageAllocator: Send + Sync {
    /// Allocates `size` zeroed bytes aligned to [`PAGE_SIZE`].
    ///
    /// `size` is always a non-zero multiple of the page size.
    fn allocate(&self, size: usize) -> Option<NonNull<u8>>;

    /// Returns a buffer obtained from [`PageAllocator::allocate`].
    ///
    /// # Safety
    ///
    /// `ptr` and `size` must come from a prior `allocate` call on the same
    /// allocator, and the buffer must not be used afterwards.
    unsafe fn release(&self, ptr: NonNull<u8>, size: usize);
}

/// Page allocator backed by the global allocator.
#[derive(Debug, Default, Clone, Copy)]
pub struct GlobalPages;

impl PageAllocator for GlobalPages {
    fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        let layout = Layout::from_size_align(size, PAGE_SIZE).ok()?;
        if layout.size() == 0 {
            return None;
        }
        // SAFETY: layout has a non-zero size.
        NonNull::new(unsafe { alloc::alloc::alloc_zeroed(layout) })
    }

    unsafe fn release(&self, ptr: NonNull<u8>, size: usize) {
        if let Ok(layout) = Layout::from_size_align(size, PAGE_SIZE) {
            alloc::alloc::dealloc(ptr.as_ptr(), layout);
        }
    }
}

// =============================================================================
// Segment
// =============================================================================

/// One owned, page-aligned segment buffer.
pub struct Segment {
    kind: SegmentKind,
    base: NonNull<u8>,
    size: usize,
    /// Permission last applied by a protector, if any. Locked rather than
    /// borrowed mutably so a protection pass never needs `&mut` access to
    /// an image whose entry points may already be running.
    protection: Mutex<Option<MemPerm>>,
    pages: Arc<dyn PageAllocator>,
}

// SAFETY: the buffer is exclusively owned by the segment; shared access
// only hands out reads, mutation needs `&mut Segment`.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    /// Allocates a segment of at least `size` bytes, rounded up to a page.
    ///
    /// Returns `None` when the allocator is exhausted or the rounded size
    /// does not fit in `usize`.
    pub fn allocate(
        kind: SegmentKind,
        size: usize,
        pages: &Arc<dyn PageAllocator>,
    ) -> Option<Self> {
        let size = checked_page_align(size)?;
        let base = pages.allocate(size)?;

        log::debug!(
            "allocated {:?} segment at {:#x}, size {:#x}",
            kind,
            base.as_ptr() as usize,
            size
        );

        Some(Self {
            kind,
            base,
            size,
            protection: Mutex::new(None),
            pages: Arc::clone(pages),
        })
    }

    pub fn kind(&self) -> SegmentKind {
        self.kind
    }

    /// Allocated size in bytes.
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Host address of the buffer.
    pub fn addr(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// Address as seen by the 32-bit image.
    pub fn image_addr(&self) -> u32 {
        self.addr() as u32
    }

    /// Permission the segment should carry once finalized.
    pub fn target_permissions(&self) -> MemPerm {
        self.kind.target_permissions()
    }

    /// Permission last applied by a protector.
    pub fn protection(&self) -> Option<MemPerm> {
        *self.protection.lock()
    }

    pub(crate) fn set_protection(&self, perm: MemPerm) {
        *self.protection.lock() = Some(perm);
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: base points at `size` initialized (zeroed at allocation) bytes.
        unsafe { core::slice::from_raw_parts(self.base.as_ptr(), self.size) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` guarantees exclusivity.
        unsafe { core::slice::from_raw_parts_mut(self.base.as_ptr(), self.size) }
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        log::debug!("releasing {:?} segment at {:#x}", self.kind, self.addr());
        // SAFETY: base/size came from `pages.allocate` and are not used again.
        unsafe { self.pages.release(self.base, self.size) };
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("kind", &self.kind)
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("size", &format_args!("{:#x}", self.size))
            .field("protection", &self.protection())
            .finish()
    }
}

/// The three segments of an image; zero-sized segments are absent.
#[derive(Debug, Default)]
pub struct SegmentSet {
    slots: [Option<Segment>; 3],
}

impl SegmentSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, segment: Segment) {
        let index = segment.kind().index();
        self.slots[index] = Some(segment);
    }

    pub fn get(&self, kind: SegmentKind) -> Option<&Segment> {
        self.slots[kind.index()].as_ref()
    }

    pub fn get_mut(&mut self, kind: SegmentKind) -> Option<&mut Segment> {
        self.slots[kind.index()].as_mut()
    }

    /// Present segments in index order.
    pub fn iter(&self) -> impl Iterator<Item = &Segment> {
        self.slots.iter().flatten()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Segment> {
        self.slots.iter_mut().flatten()
    }

    /// Total bytes held by present segments.
    pub fn total_size(&self) -> usize {
        self.iter().map(Segment::len).sum()
    }
}

// =============================================================================
// Protection
// =============================================================================

/// Failure to change a segment's protection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtectError {
    /// The platform rejected the change with a status code.
    Rejected(i32),
    /// The host cannot change protections at all.
    Unsupported,
}

impl fmt::Display for ProtectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtectError::Rejected(code) => write!(f, "protection change rejected (err={})", code),
            ProtectError::Unsupported => write!(f, "protection changes are not supported"),
        }
    }
}

/// Applies access permissions to host memory.
///
/// A protector is handed the whole batch at once; see
/// [`crate::registry::Registry::finalize_permissions`]. Protected buffers
/// are later handed back to their [`PageAllocator`] as they are, so a real
/// protector must be paired with an allocator that can release pages of
/// any protection (for example one that unmaps them).
pub trait MemoryProtector {
    /// Called once before the first segment of a finalization pass.
    fn begin(&mut self) -> Result<(), ProtectError> {
        Ok(())
    }

    /// Changes the protection of `[addr, addr + size)`.
    fn protect(&mut self, addr: usize, size: usize, perm: MemPerm) -> Result<(), ProtectError>;

    /// Called once after the last segment of a finalization pass.
    fn end(&mut self) {}
}

/// Protector for hosts without a protection primitive.
///
/// Refuses every pass, so segments keep the permissions they were
/// allocated with and are reported as unprotected.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedProtector;

impl MemoryProtector for UnsupportedProtector {
    fn begin(&mut self) -> Result<(), ProtectError> {
        Err(ProtectError::Unsupported)
    }

    fn protect(&mut self, _addr: usize, _size: usize, _perm: MemPerm) -> Result<(), ProtectError> {
        Err(ProtectError::Unsupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pages() -> Arc<dyn PageAllocator> {
        Arc::new(GlobalPages)
    }

    #[test]
    fn test_segment_is_page_aligned_and_zeroed() {
        let seg = Segment::allocate(SegmentKind::Code, 10, &pages()).unwrap();
        assert_eq!(seg.len(), PAGE_SIZE);
        assert_eq!(seg.addr() % PAGE_SIZE, 0);
        assert!(seg.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_target_permissions() {
        assert_eq!(
            SegmentKind::Code.target_permissions(),
            MemPerm::READ | MemPerm::EXECUTE
        );
        assert_eq!(SegmentKind::ReadOnlyData.target_permissions(), MemPerm::READ);
        assert_eq!(
            SegmentKind::Data.target_permissions(),
            MemPerm::READ | MemPerm::WRITE
        );
    }

    #[test]
    fn test_segment_set_indexing() {
        let pages = pages();
        let mut set = SegmentSet::new();
        set.insert(Segment::allocate(SegmentKind::Data, 0x2001, &pages).unwrap());

        assert!(set.get(SegmentKind::Code).is_none());
        assert_eq!(set.get(SegmentKind::Data).map(Segment::len), Some(0x3000));
        assert_eq!(set.iter().count(), 1);
        assert_eq!(set.total_size(), 0x3000);
    }

    #[test]
    fn test_oversized_allocation_fails() {
        assert!(Segment::allocate(SegmentKind::Data, usize::MAX - 1, &pages()).is_none());
    }

    #[test]
    fn test_unsupported_protector_refuses() {
        let mut protector = UnsupportedProtector;
        assert_eq!(protector.begin(), Err(ProtectError::Unsupported));
        assert_eq!(
            protector.protect(0x1000, PAGE_SIZE, MemPerm::READ),
            Err(ProtectError::Unsupported)
        );
    }

    #[test]
    fn test_zero_size_allocation_fails() {
        assert!(GlobalPages.allocate(0).is_none());
    }
}
