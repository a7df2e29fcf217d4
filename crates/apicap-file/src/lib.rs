//! Chunked, block-compressed, seekable trace file format.
//!
//! Layout:
//!
//! ```text
//! "at"                                   2-byte magic
//! [u32 LE len][len bytes of block] ...   one entry per chunk
//! ```
//!
//! Each chunk holds up to [`FileOptions::chunk_size`] uncompressed bytes (the
//! last one may be shorter) compressed as one independent block. A zero length
//! or the physical end of file ends the stream. Any byte can be revisited
//! through an [`Offset`]: the file position of a chunk's length prefix plus an
//! offset into that chunk's decompressed contents.
//!
//! - [`ChunkedWriter`]: staging, compression and sequential chunk output
//! - [`ChunkedReader`]: decompression cache, skipping, seeking and progress
//! - [`TraceFile`]: mode-tagged facade over a file on disk
//! - [`BlockCodec`]: the compression seam, [`Lz4Block`] by default

mod codec;
mod error;
mod file;
mod format;
mod io;
mod reader;
mod writer;

pub use crate::codec::{BlockCodec, Lz4Block};
pub use crate::error::{FileError, Result};
pub use crate::file::TraceFile;
pub use crate::format::{
    FileOptions, Mode, Offset, CHUNK_PREFIX_SIZE, DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE,
    TRACE_FILE_MAGIC,
};
pub use crate::reader::ChunkedReader;
pub use crate::writer::ChunkedWriter;
