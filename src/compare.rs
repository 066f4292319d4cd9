//! Content comparison and metadata lookup seams
//!
//! The reconciliation engine never trusts sizes or hashes to declare two files
//! identical; every candidate pair goes through a [`ByteComparator`]. Fresh
//! stats of representatives go through a [`MetadataSource`], which tests
//! replace to simulate files on other devices or files vanishing mid-run.

use crate::error::Result;
use crate::types::FileIdentity;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::Path;

/// Buffer size used by [`ExactComparator`]
pub const COMPARE_BUFFER_SIZE: usize = 64 * 1024;

/// Exact content equality test
pub trait ByteComparator {
    /// Whether `a` and `b` have identical contents
    fn equal(&self, a: &Path, b: &Path) -> Result<bool>;
}

/// Streams both files side by side and stops at the first difference
#[derive(Debug, Clone)]
pub struct ExactComparator {
    buffer_size: usize,
}

impl ExactComparator {
    /// Comparator with the default 64 KiB buffers
    pub fn new() -> Self {
        Self::with_buffer_size(COMPARE_BUFFER_SIZE)
    }

    /// Comparator with custom buffers
    pub fn with_buffer_size(buffer_size: usize) -> Self {
        Self {
            buffer_size: buffer_size.max(1),
        }
    }
}

impl Default for ExactComparator {
    fn default() -> Self {
        Self::new()
    }
}

/// Read until `buf` is full or EOF
fn fill(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

impl ByteComparator for ExactComparator {
    fn equal(&self, a: &Path, b: &Path) -> Result<bool> {
        let mut fa = File::open(a)?;
        let mut fb = File::open(b)?;
        if fa.metadata()?.len() != fb.metadata()?.len() {
            return Ok(false);
        }

        let mut buf_a = vec![0u8; self.buffer_size];
        let mut buf_b = vec![0u8; self.buffer_size];
        loop {
            let na = fill(&mut fa, &mut buf_a)?;
            let nb = fill(&mut fb, &mut buf_b)?;
            if na != nb || buf_a[..na] != buf_b[..nb] {
                return Ok(false);
            }
            if na == 0 {
                return Ok(true);
            }
        }
    }
}

/// Source of fresh file identities
pub trait MetadataSource {
    /// Stat `path` without following symlinks
    fn identity(&self, path: &Path) -> io::Result<FileIdentity>;
}

/// Reads identities from the filesystem
#[derive(Debug, Clone, Copy, Default)]
pub struct FsMetadataSource;

impl MetadataSource for FsMetadataSource {
    fn identity(&self, path: &Path) -> io::Result<FileIdentity> {
        fs::symlink_metadata(path).map(|meta| FileIdentity::from_metadata(&meta))
    }
}
