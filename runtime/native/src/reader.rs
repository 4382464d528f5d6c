//! # Image Reader
//!
//! Sequential reader over an image source. The reader owns the stream
//! cursor; every successful read advances it by the number of bytes the
//! source returned, and a read that comes back short is reported as an
//! error while the cursor still reflects what was consumed.

use core::fmt;

// =============================================================================
// Errors
// =============================================================================

/// Stream-level failure while reading an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamError {
    /// The source returned fewer bytes than requested.
    ShortRead {
        /// Stream offset the read started at.
        offset: u64,
        /// Bytes requested.
        wanted: usize,
        /// Bytes actually returned.
        got: usize,
    },
    /// The source could not be read at all.
    Unreadable,
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamError::ShortRead { offset, wanted, got } => write!(
                f,
                "short read at 0x{:X}: wanted {} bytes, got {}",
                offset, wanted, got
            ),
            StreamError::Unreadable => write!(f, "image source is unreadable"),
        }
    }
}

// =============================================================================
// Sources
// =============================================================================

/// A byte source readable at explicit offsets.
///
/// The loader only ever reads at increasing offsets, so implementations
/// backed by non-seekable streams are fine as long as they honour the
/// offset they are handed.
pub trait ImageSource {
    /// Reads up to `buf.len()` bytes starting at `offset`.
    ///
    /// Returns the number of bytes placed in `buf`. Returning fewer bytes
    /// than requested means the source ended.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize, StreamError>;
}

impl ImageSource for &[u8] {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize, StreamError> {
        let start = match usize::try_from(offset) {
            Ok(start) if start < self.len() => start,
            _ => return Ok(0),
        };
        let n = buf.len().min(self.len() - start);
        buf[..n].copy_from_slice(&self[start..start + n]);
        Ok(n)
    }
}

#[cfg(feature = "std")]
impl ImageSource for std::fs::File {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize, StreamError> {
        use std::io::{ErrorKind, Read, Seek, SeekFrom};

        self.seek(SeekFrom::Start(offset))
            .map_err(|_| StreamError::Unreadable)?;

        let mut filled = 0;
        while filled < buf.len() {
            match self.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(_) => return Err(StreamError::Unreadable),
            }
        }
        Ok(filled)
    }
}

// =============================================================================
// Reader
// =============================================================================

/// Cursor-tracking reader over an [`ImageSource`].
pub struct ImageReader<S> {
    source: S,
    pos: u64,
}

impl<S: ImageSource> ImageReader<S> {
    /// Creates a reader positioned at the start of `source`.
    pub fn new(source: S) -> Self {
        Self { source, pos: 0 }
    }

    /// Current stream offset.
    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Moves the cursor to an absolute offset.
    pub fn seek(&mut self, pos: u64) {
        self.pos = pos;
    }

    /// Consumes `len` bytes without reading them.
    pub fn skip(&mut self, len: u64) {
        self.pos = self.pos.saturating_add(len);
    }

    /// Fills `buf` completely or fails with [`StreamError::ShortRead`].
    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), StreamError> {
        if buf.is_empty() {
            return Ok(());
        }

        let offset = self.pos;
        let got = self.source.read_at(offset, buf)?;
        self.pos += got as u64;

        if got != buf.len() {
            return Err(StreamError::ShortRead {
                offset,
                wanted: buf.len(),
                got,
            });
        }
        Ok(())
    }

    /// Reads a little-endian `u32`.
    pub fn read_u32(&mut self) -> Result<u32, StreamError> {
        let mut raw = [0u8; 4];
        self.read_exact(&mut raw)?;
        Ok(u32::from_le_bytes(raw))
    }

    /// Gives back the underlying source.
    pub fn into_inner(self) -> S {
        self.source
    }
}
