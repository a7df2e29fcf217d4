use crate::error::{FileError, Result};

/// Two bytes at the start of every chunked trace file.
pub const TRACE_FILE_MAGIC: &[u8; 2] = b"at";

pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Upper bound for both the configured chunk size and any chunk a reader will
/// decompress, so a corrupt length cannot trigger a huge allocation.
pub const MAX_CHUNK_SIZE: usize = 64 * 1024 * 1024;

/// Size of the `u32` length prefix in front of every chunk.
pub const CHUNK_PREFIX_SIZE: u64 = 4;

/// A resumable read position.
///
/// `chunk` is the file offset of a chunk's length prefix and `offset_in_chunk`
/// an offset into that chunk's decompressed bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Offset {
    pub chunk: u64,
    pub offset_in_chunk: usize,
}

impl Offset {
    pub const fn new(chunk: u64, offset_in_chunk: usize) -> Self {
        Self {
            chunk,
            offset_in_chunk,
        }
    }
}

impl core::fmt::Display for Offset {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}+{}", self.chunk, self.offset_in_chunk)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileOptions {
    /// Uncompressed capacity of every chunk but the last.
    pub chunk_size: usize,
}

impl FileOptions {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(FileError::InvalidChunkSize(self.chunk_size));
        }
        Ok(())
    }
}

impl Default for FileOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Read,
    Write,
}
