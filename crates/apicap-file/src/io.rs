use std::io::{self, Read, Write};

use crate::error::{FileError, Result};

pub trait WriteLeExt: Write {
    fn write_u32_le(&mut self, v: u32) -> Result<()> {
        self.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.write_all(bytes)?;
        Ok(())
    }
}

impl<T: Write + ?Sized> WriteLeExt for T {}

pub trait ReadLeExt: Read {
    /// Reads a little-endian `u32`, mapping a short read to `None`.
    fn read_u32_le_or_eof(&mut self) -> Result<Option<u32>> {
        let mut buf = [0u8; 4];
        match self.read_exact(&mut buf) {
            Ok(()) => Ok(Some(u32::from_le_bytes(buf))),
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Fills `buf` with exactly `len` bytes, returning `false` on a short read.
    fn read_exact_into_vec_or_eof(&mut self, buf: &mut Vec<u8>, len: usize) -> Result<bool> {
        if len > buf.len() {
            buf.try_reserve_exact(len - buf.len())
                .map_err(|_| FileError::OutOfMemory { len })?;
        }
        buf.resize(len, 0);
        match self.read_exact(buf) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}

impl<T: Read + ?Sized> ReadLeExt for T {}
