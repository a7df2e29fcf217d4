use std::io::{self, Read, Seek, SeekFrom};

use crate::codec::{BlockCodec, Lz4Block};
use crate::error::{FileError, Result};
use crate::format::{Offset, CHUNK_PREFIX_SIZE, MAX_CHUNK_SIZE, TRACE_FILE_MAGIC};
use crate::io::ReadLeExt;

/// Read half of the chunked trace format.
///
/// Keeps one decompressed chunk cached plus a cursor into it. The next chunk is
/// only loaded once the cursor is exhausted and more bytes are requested, so
/// [`ChunkedReader::current_offset`] at a chunk boundary still names the
/// previous chunk.
///
/// A zero length prefix, a short prefix or a truncated payload all end the
/// stream; corrupt lengths and undecodable blocks are errors.
pub struct ChunkedReader<R: Read + Seek, C: BlockCodec = Lz4Block> {
    inner: R,
    codec: C,
    cache: Vec<u8>,
    cursor: usize,
    compressed: Vec<u8>,
    max_compressed_len: usize,
    /// File offset of the cached chunk's length prefix.
    chunk: u64,
    /// File offset `inner` is positioned at.
    position: u64,
    file_len: u64,
    exhausted: bool,
}

impl<R: Read + Seek> ChunkedReader<R> {
    pub fn new(inner: R) -> Result<Self> {
        Self::with_codec(inner, Lz4Block)
    }
}

impl<R: Read + Seek, C: BlockCodec> ChunkedReader<R, C> {
    pub fn with_codec(mut inner: R, codec: C) -> Result<Self> {
        let file_len = inner.seek(SeekFrom::End(0))?;
        inner.seek(SeekFrom::Start(0))?;

        let mut magic = [0u8; 2];
        match inner.read_exact(&mut magic) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(FileError::InvalidMagic)
            }
            Err(err) => return Err(err.into()),
        }
        if &magic != TRACE_FILE_MAGIC {
            return Err(FileError::InvalidMagic);
        }

        let max_compressed_len = codec.max_compressed_size(MAX_CHUNK_SIZE);
        let start = TRACE_FILE_MAGIC.len() as u64;
        let mut reader = Self {
            inner,
            codec,
            cache: Vec::new(),
            cursor: 0,
            compressed: Vec::new(),
            max_compressed_len,
            chunk: start,
            position: start,
            file_len,
            exhausted: false,
        };
        reader.load_chunk(0)?;
        Ok(reader)
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    pub fn supports_offsets(&self) -> bool {
        true
    }

    pub fn file_len(&self) -> u64 {
        self.file_len
    }

    fn available(&self) -> usize {
        self.cache.len() - self.cursor
    }

    /// True once the end-of-chunks marker was reached and the cached chunk is
    /// fully consumed.
    pub fn end_of_data(&self) -> bool {
        self.exhausted && self.available() == 0
    }

    /// Ends the stream. Whatever follows in the file is never read, so
    /// progress counts as complete.
    fn mark_exhausted(&mut self) {
        self.exhausted = true;
        self.position = self.file_len;
    }

    /// Loads the chunk starting at the current file position.
    ///
    /// `skip` is how many bytes the caller is about to step over; a chunk that
    /// is skipped in full is never decompressed.
    fn load_chunk(&mut self, skip: usize) -> Result<()> {
        self.chunk = self.position;
        self.cursor = 0;
        self.cache.clear();

        let compressed_len = match self.inner.read_u32_le_or_eof()? {
            None => {
                self.mark_exhausted();
                return Ok(());
            }
            Some(0) => {
                self.mark_exhausted();
                return Ok(());
            }
            Some(len) => len as usize,
        };
        if compressed_len > self.max_compressed_len {
            return Err(FileError::Corrupt("chunk length exceeds maximum"));
        }

        if !self
            .inner
            .read_exact_into_vec_or_eof(&mut self.compressed, compressed_len)?
        {
            tracing::warn!(
                chunk = self.chunk,
                compressed_len,
                "truncated trace chunk, treating as end of stream"
            );
            self.mark_exhausted();
            return Ok(());
        }
        self.position = self.chunk + CHUNK_PREFIX_SIZE + compressed_len as u64;

        let size = self.codec.decompressed_size(&self.compressed)?;
        if size > MAX_CHUNK_SIZE {
            return Err(FileError::Corrupt("chunk decompresses past the maximum size"));
        }
        self.cache.resize(size, 0);
        if skip < size {
            self.codec.decompress(&self.compressed, &mut self.cache)?;
        }
        Ok(())
    }

    /// Fills as much of `buf` as the stream allows, crossing chunk boundaries.
    /// Returns the number of bytes copied; `0` means end of stream.
    pub fn read_bytes(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            if self.available() == 0 {
                if self.exhausted {
                    break;
                }
                self.load_chunk(0)?;
                continue;
            }
            let n = self.available().min(buf.len() - filled);
            buf[filled..filled + n].copy_from_slice(&self.cache[self.cursor..self.cursor + n]);
            self.cursor += n;
            filled += n;
        }
        Ok(filled)
    }

    pub fn read_byte(&mut self) -> Result<Option<u8>> {
        let mut byte = [0u8; 1];
        Ok(match self.read_bytes(&mut byte)? {
            0 => None,
            _ => Some(byte[0]),
        })
    }

    /// Steps over `len` bytes without copying them out. Returns `false` if the
    /// stream had already ended.
    pub fn skip(&mut self, len: usize) -> Result<bool> {
        if self.end_of_data() {
            return Ok(false);
        }
        let mut remaining = len;
        while remaining > 0 {
            let step = self.available().min(remaining);
            self.cursor += step;
            remaining -= step;
            if remaining > 0 {
                if self.exhausted {
                    break;
                }
                self.load_chunk(remaining)?;
            }
        }
        Ok(true)
    }

    pub fn current_offset(&self) -> Offset {
        Offset::new(self.chunk, self.cursor)
    }

    /// Seeks to `offset.chunk`, reloads that chunk and positions the cursor
    /// inside it. Requires random access on `inner`.
    pub fn set_current_offset(&mut self, offset: Offset) -> Result<()> {
        self.inner.seek(SeekFrom::Start(offset.chunk))?;
        self.position = offset.chunk;
        self.exhausted = false;
        self.load_chunk(0)?;
        if offset.offset_in_chunk > self.cache.len() {
            return Err(FileError::InvalidOffset {
                chunk: offset.chunk,
                offset_in_chunk: offset.offset_in_chunk,
                chunk_len: self.cache.len(),
            });
        }
        self.cursor = offset.offset_in_chunk;
        Ok(())
    }

    /// Progress estimate in percent of the file consumed, based on the file
    /// position of the last chunk loaded.
    pub fn percent_read(&self) -> u8 {
        if self.file_len == 0 {
            return 100;
        }
        let pct = self.position.saturating_mul(100) / self.file_len;
        pct.min(100) as u8
    }
}

impl<R: Read + Seek, C: BlockCodec> Read for ChunkedReader<R, C> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.read_bytes(buf)?)
    }
}
