//! # Program Break
//!
//! Each image gets a private heap carved out of the tail of its data
//! segment. The image grows and shrinks it through `sbrk`-style
//! adjustments of a single break value that is guarded by a lock, so the
//! image's own background threads may call in alongside its tick.

use core::fmt;

use spin::Mutex;

/// Rejected break adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapError {
    /// Break offset at the time of the request.
    pub current: usize,
    /// Requested change.
    pub delta: isize,
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "break adjustment {} from offset 0x{:X} leaves the data segment",
            self.delta, self.current
        )
    }
}

/// Program break for one image.
#[derive(Debug)]
pub struct ProgramBreak {
    /// Host address of the data segment.
    base: usize,
    /// Allocated size of the data segment.
    limit: usize,
    /// Break as an offset from `base`.
    offset: Mutex<usize>,
}

impl ProgramBreak {
    /// Creates a break starting `initial` bytes into a segment of `limit` bytes.
    pub fn new(base: usize, limit: usize, initial: usize) -> Self {
        Self {
            base,
            limit,
            offset: Mutex::new(initial.min(limit)),
        }
    }

    /// Current break address.
    pub fn current(&self) -> usize {
        self.base + *self.offset.lock()
    }

    /// Bytes between the break and the end of the segment.
    pub fn remaining(&self) -> usize {
        self.limit - *self.offset.lock()
    }

    /// Moves the break by `delta` bytes and returns the new break address.
    ///
    /// A zero delta reports the current break. The break never leaves
    /// `[base, base + limit]`; a request that would is refused and the
    /// break stays where it was.
    pub fn adjust(&self, delta: isize) -> Result<usize, HeapError> {
        let mut offset = self.offset.lock();
        if delta == 0 {
            return Ok(self.base + *offset);
        }

        let current = *offset;
        let next = (current as isize)
            .checked_add(delta)
            .filter(|&next| next >= 0 && next as usize <= self.limit)
            .ok_or(HeapError { current, delta })?;

        *offset = next as usize;
        log::trace!("break {:#x} -> {:#x}", self.base + current, self.base + *offset);
        Ok(self.base + *offset)
    }
}
