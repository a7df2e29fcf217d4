//! Capture pipeline: the instrumented thread appends call bytes into a
//! [`RingBuffer`]; a dedicated writer thread drains it into a
//! [`ChunkedWriter`].
//!
//! The producer never blocks on disk I/O, only on ring space: when the ring is
//! full it wakes the writer and yields until enough has been drained.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use apicap_file::{ChunkedWriter, FileError};
use apicap_ring::{RingBuffer, WriteError};
use thiserror::Error;

use crate::config::{CaptureConfig, ConfigError, MIN_RING_CAPACITY};

/// How long the writer sleeps on an empty ring before checking again.
const IDLE_PARK: Duration = Duration::from_millis(1);

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    File(#[from] FileError),

    #[error(transparent)]
    Ring(#[from] WriteError),

    #[error("failed to spawn the trace writer thread")]
    Spawn(#[source] io::Error),

    #[error("trace writer thread panicked")]
    WriterPanicked,

    #[error("trace writer thread has stopped")]
    WriterStopped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    /// Uncompressed bytes handed to the file.
    pub bytes: u64,
    pub chunks: u64,
}

#[derive(Default)]
struct Shared {
    stop: AtomicBool,
    /// Bumped by the producer for every flush request.
    flush_requested: AtomicU64,
    /// Highest request the writer has completed.
    flushed: AtomicU64,
}

/// A trace being recorded to disk.
///
/// Owned by the single producing thread; the writer thread lives until
/// [`CaptureSession::finish`] (or drop).
pub struct CaptureSession {
    ring: Arc<RingBuffer>,
    shared: Arc<Shared>,
    writer: Option<JoinHandle<Result<CaptureStats, FileError>>>,
    queued: u64,
}

impl CaptureSession {
    /// Creates (or truncates) the trace file at `path` and starts the writer
    /// thread.
    pub fn create(path: impl AsRef<Path>, config: CaptureConfig) -> Result<Self, CaptureError> {
        config.validate()?;
        let path = path.as_ref();
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(FileError::from)?;
        let writer = ChunkedWriter::with_options(file, config.file)?;
        tracing::debug!(path = %path.display(), ?config, "starting capture");
        Self::with_writer(writer, config.ring_capacity)
    }

    /// Starts a session draining into an already-open chunked writer.
    pub fn with_writer<W>(
        writer: ChunkedWriter<W>,
        ring_capacity: usize,
    ) -> Result<Self, CaptureError>
    where
        W: Write + Send + 'static,
    {
        if ring_capacity < MIN_RING_CAPACITY {
            return Err(ConfigError::RingCapacity(ring_capacity).into());
        }
        let ring = Arc::new(RingBuffer::new(ring_capacity));
        let shared = Arc::new(Shared::default());
        let handle = thread::Builder::new()
            .name("apicap-writer".into())
            .spawn({
                let ring = Arc::clone(&ring);
                let shared = Arc::clone(&shared);
                move || drain_into(&ring, &shared, writer)
            })
            .map_err(CaptureError::Spawn)?;
        Ok(Self {
            ring,
            shared,
            writer: Some(handle),
            queued: 0,
        })
    }

    /// Bytes accepted by [`Self::write`] so far.
    pub fn queued(&self) -> u64 {
        self.queued
    }

    /// Queues `data` for the writer thread, waiting for ring space as needed.
    /// Writes larger than the ring are split.
    pub fn write(&mut self, data: &[u8]) -> Result<(), CaptureError> {
        let max_piece = self.ring.capacity() - 1;
        for piece in data.chunks(max_piece) {
            while self.ring.size_to_write() <= piece.len() {
                self.ensure_writer_alive()?;
                self.wake_writer();
                thread::yield_now();
            }
            self.ring.write(piece)?;
            self.queued += piece.len() as u64;
        }
        self.wake_writer();
        Ok(())
    }

    /// Blocks until everything queued so far has been compressed and handed to
    /// the file.
    pub fn flush(&mut self) -> Result<(), CaptureError> {
        let ticket = self.shared.flush_requested.fetch_add(1, Ordering::AcqRel) + 1;
        while self.shared.flushed.load(Ordering::Acquire) < ticket {
            self.ensure_writer_alive()?;
            self.wake_writer();
            thread::yield_now();
        }
        Ok(())
    }

    /// Drains the ring, writes the last partial chunk and stops the writer
    /// thread.
    pub fn finish(mut self) -> Result<CaptureStats, CaptureError> {
        self.shared.stop.store(true, Ordering::Release);
        self.wake_writer();
        let stats = self.join_writer()?;
        tracing::debug!(bytes = stats.bytes, chunks = stats.chunks, "capture finished");
        Ok(stats)
    }

    fn wake_writer(&self) {
        if let Some(handle) = &self.writer {
            handle.thread().unpark();
        }
    }

    fn ensure_writer_alive(&mut self) -> Result<(), CaptureError> {
        match &self.writer {
            Some(handle) if !handle.is_finished() => Ok(()),
            _ => Err(match self.join_writer() {
                Ok(_) => CaptureError::WriterStopped,
                Err(err) => err,
            }),
        }
    }

    fn join_writer(&mut self) -> Result<CaptureStats, CaptureError> {
        let handle = self.writer.take().ok_or(CaptureError::WriterStopped)?;
        match handle.join() {
            Ok(result) => Ok(result?),
            Err(_) => Err(CaptureError::WriterPanicked),
        }
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        if self.writer.is_none() {
            return;
        }
        self.shared.stop.store(true, Ordering::Release);
        self.wake_writer();
        if let Err(err) = self.join_writer() {
            tracing::warn!(error = %err, "trace writer failed during shutdown");
        }
    }
}

/// Writer thread body.
fn drain_into<W: Write>(
    ring: &RingBuffer,
    shared: &Shared,
    mut writer: ChunkedWriter<W>,
) -> Result<CaptureStats, FileError> {
    let mut staging = Vec::with_capacity(ring.capacity());
    let mut bytes = 0u64;
    loop {
        // Load the requests before looking at the ring: anything queued ahead
        // of a request is then guaranteed to be seen as pending.
        let stop = shared.stop.load(Ordering::Acquire);
        let requested = shared.flush_requested.load(Ordering::Acquire);

        let pending = ring.size_to_read();
        if pending > 0 {
            // Copy out under the ring lock, compress outside it.
            staging.clear();
            ring.peek(pending, |head, tail| {
                staging.extend_from_slice(head);
                staging.extend_from_slice(tail);
            });
            ring.read_pointer_advance(pending);
            writer.append(&staging)?;
            bytes += pending as u64;
            continue;
        }

        if requested > shared.flushed.load(Ordering::Relaxed) {
            writer.flush()?;
            shared.flushed.store(requested, Ordering::Release);
        }
        if stop {
            break;
        }
        thread::park_timeout(IDLE_PARK);
    }
    writer.flush()?;
    let chunks = writer.chunks_written();
    writer.finish()?;
    Ok(CaptureStats { bytes, chunks })
}
