//! Capture-and-persistence substrate for an in-process API tracer.
//!
//! Recorded call bytes flow from the instrumented thread through a bounded
//! [`ring::RingBuffer`] to a writer thread that stores them in a chunked,
//! block-compressed, seekable trace file ([`file`]). [`os`] provides the
//! crash handler that gets a last flush out before the process dies and the
//! memory-region oracle used to bound pointer-sized captures.
//!
//! Crate map:
//! - `apicap-ring`: SPSC byte ring
//! - `apicap-file`: trace file format
//! - `apicap-os`: signals and memory maps
//! - this crate: [`config`] and the [`capture`] pipeline that ties them together

pub mod capture;
pub mod config;

pub use apicap_file as file;
pub use apicap_os as os;
pub use apicap_ring as ring;

pub use crate::capture::{CaptureError, CaptureSession, CaptureStats};
pub use crate::config::{CaptureConfig, ConfigError};
