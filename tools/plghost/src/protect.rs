//! # Page Protection
//!
//! On Unix, segments live in their own anonymous mappings and are
//! protected with `mprotect`. Unmapping does not care about the current
//! protection, so a read-only or executable segment can be released
//! directly. Other hosts fall back to the global allocator and refuse
//! protection changes.

use std::sync::Arc;

use plghost_native::{MemoryProtector, PageAllocator};

#[cfg(unix)]
pub use self::unix::{MappedPages, MprotectProtector};

/// Page allocator and protector suited to this host.
pub fn host_protection() -> (Arc<dyn PageAllocator>, Box<dyn MemoryProtector>) {
    #[cfg(unix)]
    return (Arc::new(MappedPages), Box::new(MprotectProtector));

    #[cfg(not(unix))]
    return (
        Arc::new(plghost_native::GlobalPages),
        Box::new(plghost_native::UnsupportedProtector),
    );
}

#[cfg(unix)]
mod unix {
    use std::ptr::{self, NonNull};

    use plghost_native::{MemPerm, MemoryProtector, PageAllocator, ProtectError};

    /// One anonymous mapping per segment.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct MappedPages;

    impl PageAllocator for MappedPages {
        fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
            if size == 0 {
                return None;
            }
            // SAFETY: a fresh private anonymous mapping aliases nothing.
            let addr = unsafe {
                libc::mmap(
                    ptr::null_mut(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                )
            };
            if addr == libc::MAP_FAILED {
                log::warn!("mmap of {:#x} bytes failed: {}", size, std::io::Error::last_os_error());
                return None;
            }
            NonNull::new(addr as *mut u8)
        }

        unsafe fn release(&self, ptr: NonNull<u8>, size: usize) {
            if libc::munmap(ptr.as_ptr() as *mut libc::c_void, size) != 0 {
                log::warn!(
                    "munmap at {:#x} failed: {}",
                    ptr.as_ptr() as usize,
                    std::io::Error::last_os_error()
                );
            }
        }
    }

    /// Applies segment permissions with `mprotect`.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct MprotectProtector;

    // TODO: flush the instruction cache over code segments on 32-bit ARM
    // before the first entry point runs.
    impl MemoryProtector for MprotectProtector {
        fn protect(&mut self, addr: usize, size: usize, perm: MemPerm) -> Result<(), ProtectError> {
            // SAFETY: callers pass whole segments they own; changing their
            // protection does not invalidate any Rust reference to them that
            // is used for writing afterwards.
            let rc = unsafe { libc::mprotect(addr as *mut libc::c_void, size, prot_flags(perm)) };
            if rc != 0 {
                let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(-1);
                return Err(ProtectError::Rejected(errno));
            }
            Ok(())
        }
    }

    pub(super) fn prot_flags(perm: MemPerm) -> libc::c_int {
        let mut prot = libc::PROT_NONE;
        if perm.contains(MemPerm::READ) {
            prot |= libc::PROT_READ;
        }
        if perm.contains(MemPerm::WRITE) {
            prot |= libc::PROT_WRITE;
        }
        if perm.contains(MemPerm::EXECUTE) {
            prot |= libc::PROT_EXEC;
        }
        prot
    }
}
