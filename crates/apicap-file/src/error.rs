use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, FileError>;

#[derive(Debug, Error)]
pub enum FileError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("out of memory allocating {len} bytes")]
    OutOfMemory { len: usize },

    #[error("invalid trace file magic")]
    InvalidMagic,

    #[error("invalid chunk size {0} (expected 1..={max})", max = crate::format::MAX_CHUNK_SIZE)]
    InvalidChunkSize(usize),

    #[error("corrupt trace file: {0}")]
    Corrupt(&'static str),

    #[error("offset {offset_in_chunk} is past the end of the {chunk_len}-byte chunk at {chunk}")]
    InvalidOffset {
        chunk: u64,
        offset_in_chunk: usize,
        chunk_len: usize,
    },

    #[error("lz4 compression failed: {0}")]
    Lz4Compress(#[from] lz4_flex::block::CompressError),

    #[error("lz4 decompression failed: {0}")]
    Lz4Decompress(#[from] lz4_flex::block::DecompressError),
}

impl From<FileError> for io::Error {
    fn from(err: FileError) -> Self {
        match err {
            FileError::Io(err) => err,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
