//! Process-level plumbing for an in-process capture library.
//!
//! - [`crash`]: fatal-signal interception that logs, runs a flush callback and
//!   dumps a backtrace before chaining to whatever handler was there before.
//! - [`memory`]: "which mapping encloses this address?" queries, with bounds
//!   that stay stable across glibc heap growth.

#[cfg(unix)]
pub mod crash;
pub mod memory;

pub use crate::memory::{query_virtual_address, MemoryRegion, Protection};
