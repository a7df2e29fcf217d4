use std::io::{self, Read};

use super::{MemoryRegion, Protection};

const READ_AHEAD: usize = 512;

/// Incremental parser for the `/proc/<pid>/maps` text format.
///
/// Reads through a fixed 512-byte buffer, so parsing never allocates no matter
/// how large the map is. Only the address range and permission columns are
/// decoded; offset, device, inode and path are skipped.
///
/// ```text
/// 00400000-00452000 r-xp 00000000 08:02 173521      /usr/bin/dbus-daemon
/// ```
///
/// Parsing stops (returns `None`) at end of input or at the first malformed
/// line, and a read error counts as end of input.
pub struct MapsReader<R> {
    inner: R,
    buf: [u8; READ_AHEAD],
    pos: usize,
    len: usize,
}

impl<R: Read> MapsReader<R> {
    pub fn new(inner: R) -> Self {
        let mut reader = Self {
            inner,
            buf: [0; READ_AHEAD],
            pos: 0,
            len: 0,
        };
        reader.fill();
        reader
    }

    fn fill(&mut self) {
        self.pos = 0;
        self.len = loop {
            match self.inner.read(&mut self.buf) {
                Ok(n) => break n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break 0,
            }
        };
    }

    fn peek(&self) -> Option<u8> {
        (self.pos < self.len).then(|| self.buf[self.pos])
    }

    fn bump(&mut self) {
        self.pos += 1;
        if self.pos >= self.len {
            self.fill();
        }
    }

    pub fn next_region(&mut self) -> Option<MemoryRegion> {
        self.peek()?;

        let start = self.hex()?;
        self.expect(b'-')?;
        let stop = self.hex()?;
        self.spaces()?;

        let mut protection = Protection::empty();
        protection.set(Protection::READ, self.flag(b'r', b'-')?);
        protection.set(Protection::WRITE, self.flag(b'w', b'-')?);
        protection.set(Protection::EXECUTE, self.flag(b'x', b'-')?);
        protection.set(Protection::SHARED, self.flag(b's', b'p')?);
        self.spaces()?;

        self.skip_line()?;
        Some(MemoryRegion {
            start,
            stop,
            protection,
        })
    }

    fn hex(&mut self) -> Option<usize> {
        let mut value: usize = 0;
        let mut digits = 0;
        while let Some(digit) = self.peek().and_then(|c| char::from(c).to_digit(16)) {
            value = value.checked_mul(16)?.checked_add(digit as usize)?;
            digits += 1;
            self.bump();
        }
        (digits > 0).then_some(value)
    }

    fn expect(&mut self, byte: u8) -> Option<()> {
        if self.peek()? != byte {
            return None;
        }
        self.bump();
        Some(())
    }

    /// One or more spaces.
    fn spaces(&mut self) -> Option<()> {
        let mut seen = false;
        while self.peek() == Some(b' ') {
            self.bump();
            seen = true;
        }
        seen.then_some(())
    }

    fn flag(&mut self, set: u8, clear: u8) -> Option<bool> {
        let c = self.peek()?;
        let value = match c {
            c if c == set => true,
            c if c == clear => false,
            _ => return None,
        };
        self.bump();
        Some(value)
    }

    fn skip_line(&mut self) -> Option<()> {
        while self.peek()? != b'\n' {
            self.bump();
        }
        self.bump();
        Some(())
    }
}

impl<R: Read> Iterator for MapsReader<R> {
    type Item = MemoryRegion;

    fn next(&mut self) -> Option<MemoryRegion> {
        self.next_region()
    }
}
