//! Block compression seam.
//!
//! The chunked file format compresses each chunk as one independent block and
//! never looks inside the compressed bytes itself; everything it needs is the
//! four primitives of [`BlockCodec`].

use crate::error::{FileError, Result};

pub trait BlockCodec {
    /// Worst-case compressed size for `uncompressed_len` input bytes.
    fn max_compressed_size(&self, uncompressed_len: usize) -> usize;

    /// Compresses `src` into `dst`, returning the compressed length.
    ///
    /// `dst` is at least `max_compressed_size(src.len())` bytes long.
    fn compress(&self, src: &[u8], dst: &mut [u8]) -> Result<usize>;

    /// Decompressed size of the block in `src`, as recorded by the codec.
    fn decompressed_size(&self, src: &[u8]) -> Result<usize>;

    /// Decompresses `src` into `dst`, which is exactly
    /// `decompressed_size(src)` bytes long.
    fn decompress(&self, src: &[u8], dst: &mut [u8]) -> Result<()>;
}

/// LZ4 block compression with a little-endian `u32` uncompressed-size prefix.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Lz4Block;

const SIZE_PREFIX: usize = 4;

impl BlockCodec for Lz4Block {
    fn max_compressed_size(&self, uncompressed_len: usize) -> usize {
        SIZE_PREFIX + lz4_flex::block::get_maximum_output_size(uncompressed_len)
    }

    fn compress(&self, src: &[u8], dst: &mut [u8]) -> Result<usize> {
        let len: u32 = src
            .len()
            .try_into()
            .map_err(|_| FileError::Corrupt("block length does not fit in u32"))?;
        if dst.len() < SIZE_PREFIX {
            return Err(FileError::Corrupt("compression buffer too small"));
        }
        let (prefix, body) = dst.split_at_mut(SIZE_PREFIX);
        prefix.copy_from_slice(&len.to_le_bytes());
        let written = lz4_flex::block::compress_into(src, body)?;
        Ok(SIZE_PREFIX + written)
    }

    fn decompressed_size(&self, src: &[u8]) -> Result<usize> {
        let prefix: [u8; SIZE_PREFIX] = src
            .get(..SIZE_PREFIX)
            .and_then(|b| b.try_into().ok())
            .ok_or(FileError::Corrupt("block shorter than its size prefix"))?;
        Ok(u32::from_le_bytes(prefix) as usize)
    }

    fn decompress(&self, src: &[u8], dst: &mut [u8]) -> Result<()> {
        let body = src
            .get(SIZE_PREFIX..)
            .ok_or(FileError::Corrupt("block shorter than its size prefix"))?;
        let written = lz4_flex::block::decompress_into(body, dst)?;
        if written != dst.len() {
            return Err(FileError::Corrupt("decompressed block length mismatch"));
        }
        Ok(())
    }
}
