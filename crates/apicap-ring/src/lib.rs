//! Single-producer/single-consumer byte ring used to hand captured call data to
//! the thread that persists it.

pub mod ring;

pub use ring::{RingBuffer, WriteError};
