use std::io::{self, Write};
use std::mem::ManuallyDrop;
use std::ptr;

use crate::codec::{BlockCodec, Lz4Block};
use crate::error::{FileError, Result};
use crate::format::{FileOptions, Offset, CHUNK_PREFIX_SIZE, TRACE_FILE_MAGIC};
use crate::io::WriteLeExt;

/// Write half of the chunked trace format.
///
/// Bytes are staged into a `chunk_size` buffer; every time it fills up it is
/// compressed as one block and appended as `[u32 LE length][block]`. The last
/// chunk is written short by [`ChunkedWriter::flush`] or
/// [`ChunkedWriter::finish`], which also returns the inner writer. Dropping an
/// unfinished writer flushes it on a best-effort basis.
pub struct ChunkedWriter<W: Write, C: BlockCodec = Lz4Block> {
    inner: W,
    codec: C,
    chunk_size: usize,
    cache: Vec<u8>,
    compressed: Vec<u8>,
    /// Bytes handed to `inner` so far, magic included.
    position: u64,
    chunks_written: u64,
    finished: bool,
}

impl<W: Write> ChunkedWriter<W> {
    pub fn new(inner: W) -> Result<Self> {
        Self::with_options(inner, FileOptions::default())
    }

    pub fn with_options(inner: W, options: FileOptions) -> Result<Self> {
        Self::with_codec(inner, options, Lz4Block)
    }
}

impl<W: Write, C: BlockCodec> ChunkedWriter<W, C> {
    pub fn with_codec(mut inner: W, options: FileOptions, codec: C) -> Result<Self> {
        options.validate()?;
        inner.write_bytes(TRACE_FILE_MAGIC)?;
        let compressed = vec![0u8; codec.max_compressed_size(options.chunk_size)];
        Ok(Self {
            inner,
            codec,
            chunk_size: options.chunk_size,
            cache: Vec::with_capacity(options.chunk_size),
            compressed,
            position: TRACE_FILE_MAGIC.len() as u64,
            chunks_written: 0,
            finished: false,
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn chunks_written(&self) -> u64 {
        self.chunks_written
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    /// Position a reader would resume at to see the next byte appended.
    ///
    /// Only meaningful once the staged bytes have been flushed.
    pub fn current_offset(&self) -> Offset {
        Offset::new(self.position, self.cache.len())
    }

    /// Stages `data`, flushing a chunk every time the staging buffer is
    /// exactly full. Large writes are split across as many chunks as needed.
    pub fn append(&mut self, data: &[u8]) -> Result<()> {
        let mut rest = data;
        while !rest.is_empty() {
            let take = rest.len().min(self.chunk_size - self.cache.len());
            let (head, tail) = rest.split_at(take);
            self.cache.extend_from_slice(head);
            rest = tail;
            if self.cache.len() == self.chunk_size {
                self.flush_chunk()?;
            }
        }
        Ok(())
    }

    fn flush_chunk(&mut self) -> Result<()> {
        if self.cache.is_empty() {
            return Ok(());
        }

        let compressed_len = self.codec.compress(&self.cache, &mut self.compressed)?;
        let prefix: u32 = compressed_len
            .try_into()
            .map_err(|_| FileError::Corrupt("compressed chunk too large"))?;
        self.inner.write_u32_le(prefix)?;
        self.inner.write_bytes(&self.compressed[..compressed_len])?;

        tracing::trace!(
            chunk = self.chunks_written,
            uncompressed = self.cache.len(),
            compressed = compressed_len,
            "flushed trace chunk"
        );
        self.position += CHUNK_PREFIX_SIZE + compressed_len as u64;
        self.chunks_written += 1;
        self.cache.clear();
        Ok(())
    }

    /// Compresses any partially filled chunk and flushes the underlying writer.
    pub fn flush(&mut self) -> Result<()> {
        self.flush_chunk()?;
        self.inner.flush()?;
        Ok(())
    }

    /// Flushes everything and hands back the underlying writer.
    ///
    /// On error the writer is dropped without another flush attempt.
    pub fn finish(mut self) -> Result<W> {
        let flushed = self.flush();
        self.finished = true;
        flushed?;

        let mut this = ManuallyDrop::new(self);
        // SAFETY: `this` is never dropped, so `inner` is moved out exactly once
        // and every other field is dropped in place exactly once.
        unsafe {
            let inner = ptr::read(&this.inner);
            ptr::drop_in_place(&mut this.codec);
            ptr::drop_in_place(&mut this.cache);
            ptr::drop_in_place(&mut this.compressed);
            Ok(inner)
        }
    }
}

impl<W: Write, C: BlockCodec> Write for ChunkedWriter<W, C> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.append(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        ChunkedWriter::flush(self)?;
        Ok(())
    }
}

impl<W: Write, C: BlockCodec> Drop for ChunkedWriter<W, C> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(err) = ChunkedWriter::flush(self) {
            tracing::warn!(error = %err, "failed to flush trace file on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Lz4Block;
    use std::io::Cursor;

    fn chunk_lengths(bytes: &[u8]) -> Vec<u32> {
        let mut out = Vec::new();
        let mut pos = TRACE_FILE_MAGIC.len();
        while pos + 4 <= bytes.len() {
            let len = u32::from_le_bytes(bytes[pos..pos + 4].try_into().unwrap());
            out.push(len);
            pos += 4 + len as usize;
        }
        assert_eq!(pos, bytes.len());
        out
    }

    #[test]
    fn exact_fill_flushes_immediately() {
        let mut w =
            ChunkedWriter::with_options(Cursor::new(Vec::new()), FileOptions { chunk_size: 16 })
                .unwrap();
        w.append(&[7u8; 16]).unwrap();
        assert_eq!(w.chunks_written(), 1);
        assert_eq!(w.current_offset().offset_in_chunk, 0);
        w.flush().unwrap();
        assert_eq!(w.chunks_written(), 1);
    }

    #[test]
    fn large_write_is_split_across_chunks() {
        let mut w =
            ChunkedWriter::with_options(Cursor::new(Vec::new()), FileOptions { chunk_size: 16 })
                .unwrap();
        w.append(&[1u8; 5]).unwrap();
        w.append(&[2u8; 40]).unwrap();
        // 45 bytes: two full chunks, 13 staged
        assert_eq!(w.chunks_written(), 2);
        assert_eq!(w.current_offset().offset_in_chunk, 13);
        w.flush().unwrap();
        assert_eq!(w.chunks_written(), 3);

        let bytes = w.finish().unwrap().into_inner();
        assert_eq!(&bytes[..2], TRACE_FILE_MAGIC);
        let lengths = chunk_lengths(&bytes);
        assert_eq!(lengths.len(), 3);

        let codec = Lz4Block;
        let mut pos = 2usize;
        let mut sizes = Vec::new();
        for len in lengths {
            let block = &bytes[pos + 4..pos + 4 + len as usize];
            sizes.push(codec.decompressed_size(block).unwrap());
            pos += 4 + len as usize;
        }
        assert_eq!(sizes, vec![16, 16, 13]);
    }

    #[test]
    fn empty_file_is_just_the_magic() {
        let w = ChunkedWriter::new(Cursor::new(Vec::new())).unwrap();
        assert_eq!(w.finish().unwrap().into_inner(), TRACE_FILE_MAGIC);
    }

    #[test]
    fn invalid_chunk_size_is_rejected() {
        let options = FileOptions { chunk_size: 0 };
        let err = ChunkedWriter::with_options(Cursor::new(Vec::new()), options)
            .err()
            .unwrap();
        assert!(matches!(err, FileError::InvalidChunkSize(0)));
    }
}
