use std::fs::{File, OpenOptions};
use std::path::Path;

use crate::error::Result;
use crate::format::{FileOptions, Mode, Offset};
use crate::reader::ChunkedReader;
use crate::writer::ChunkedWriter;

enum Inner {
    Read(ChunkedReader<File>),
    Write(ChunkedWriter<File>),
}

/// A chunked trace file on disk, opened either for reading or for writing.
///
/// Calling a write operation on a file opened for reading (or the other way
/// round) is a programming error and panics.
pub struct TraceFile {
    inner: Inner,
}

impl TraceFile {
    pub fn open(path: impl AsRef<Path>, mode: Mode) -> Result<Self> {
        Self::open_with_options(path, mode, FileOptions::default())
    }

    pub fn open_with_options(
        path: impl AsRef<Path>,
        mode: Mode,
        options: FileOptions,
    ) -> Result<Self> {
        let path = path.as_ref();
        let inner = match mode {
            Mode::Read => Inner::Read(ChunkedReader::new(File::open(path)?)?),
            Mode::Write => {
                let file = OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(path)?;
                Inner::Write(ChunkedWriter::with_options(file, options)?)
            }
        };
        tracing::debug!(path = %path.display(), ?mode, "opened trace file");
        Ok(Self { inner })
    }

    pub fn mode(&self) -> Mode {
        match self.inner {
            Inner::Read(_) => Mode::Read,
            Inner::Write(_) => Mode::Write,
        }
    }

    pub fn supports_offsets(&self) -> bool {
        true
    }

    fn reader(&mut self) -> &mut ChunkedReader<File> {
        match &mut self.inner {
            Inner::Read(reader) => reader,
            Inner::Write(_) => panic!("read operation on a trace file opened for writing"),
        }
    }

    fn writer(&mut self) -> &mut ChunkedWriter<File> {
        match &mut self.inner {
            Inner::Write(writer) => writer,
            Inner::Read(_) => panic!("write operation on a trace file opened for reading"),
        }
    }

    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        self.writer().append(data)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer().flush()
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.reader().read_bytes(buf)
    }

    pub fn getc(&mut self) -> Result<Option<u8>> {
        self.reader().read_byte()
    }

    pub fn skip(&mut self, len: usize) -> Result<bool> {
        self.reader().skip(len)
    }

    pub fn percent_read(&mut self) -> u8 {
        self.reader().percent_read()
    }

    /// Resumable position. In write mode this is where a reader will find the
    /// next byte written, once it has been flushed.
    pub fn current_offset(&self) -> Offset {
        match &self.inner {
            Inner::Read(reader) => reader.current_offset(),
            Inner::Write(writer) => writer.current_offset(),
        }
    }

    pub fn set_current_offset(&mut self, offset: Offset) -> Result<()> {
        self.reader().set_current_offset(offset)
    }

    /// Flushes a writer's last partial chunk; a no-op for readers.
    pub fn close(self) -> Result<()> {
        if let Inner::Write(writer) = self.inner {
            writer.finish()?;
        }
        Ok(())
    }
}
