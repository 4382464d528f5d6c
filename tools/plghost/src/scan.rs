//! # Plugin Directory Scan
//!
//! Collects the image files of one directory. Only regular, non-empty
//! files whose name ends in the plugin extension are candidates; the
//! extension is the text after the last `.` and matches case-insensitively.

use std::fs::{self, File};
use std::io;
use std::path::Path;

/// Longest file name accepted, in bytes.
pub const NAME_MAX: usize = 127;

/// A file accepted for loading.
#[derive(Debug)]
pub struct Candidate {
    pub name: String,
    pub file: File,
}

/// Whether a directory entry is a plugin image.
pub fn is_candidate(name: &str, len: u64, is_file: bool, extension: &str) -> bool {
    if !is_file || len == 0 || name.len() > NAME_MAX {
        return false;
    }
    match name.rsplit_once('.') {
        Some((_, ext)) => ext.eq_ignore_ascii_case(extension),
        None => false,
    }
}

/// Opens every plugin image in `dir`, in file name order.
///
/// Entries that cannot be inspected or opened are logged and skipped.
pub fn scan(dir: &Path, extension: &str) -> io::Result<Vec<Candidate>> {
    let mut names = Vec::new();

    for entry in fs::read_dir(dir)? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                log::warn!("{}: unreadable entry: {}", dir.display(), e);
                continue;
            }
        };
        let name = match entry.file_name().into_string() {
            Ok(name) => name,
            Err(raw) => {
                log::debug!("skipping non-UTF-8 name {:?}", raw);
                continue;
            }
        };
        let meta = match entry.metadata() {
            Ok(meta) => meta,
            Err(e) => {
                log::warn!("{}: {}", name, e);
                continue;
            }
        };
        if is_candidate(&name, meta.len(), meta.is_file(), extension) {
            names.push(name);
        } else {
            log::trace!("skipping {}", name);
        }
    }
    names.sort();

    let mut candidates = Vec::with_capacity(names.len());
    for name in names {
        match File::open(dir.join(&name)) {
            Ok(file) => candidates.push(Candidate { name, file }),
            Err(e) => log::warn!("{}: cannot open: {}", name, e),
        }
    }
    Ok(candidates)
}
