//! Virtual memory region queries.
//!
//! [`query_virtual_address`] answers "which readable mapping encloses this
//! address, and where does it start and stop?". A capture library uses the
//! answer to decide how much memory behind a user pointer it may safely copy
//! into the trace.
//!
//! Each platform supplies one [`RegionResolver`]:
//!
//! - Linux: [`ProcMaps`], which parses `/proc/self/maps` and keeps the growing
//!   glibc heap carved into stable sub-regions (see [`SubBreakChain`])
//! - macOS: `MachRegions`, a single `mach_vm_region` query
//! - anything else: `Unsupported`, which never finds a region

use std::fmt;
use std::sync::{Mutex, TryLockError};

use bitflags::bitflags;

#[cfg(any(target_os = "linux", test))]
mod maps;
#[cfg(any(target_os = "linux", test))]
mod sub_break;

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "macos")]
mod macos;
#[cfg(not(any(target_os = "linux", target_os = "macos")))]
mod unsupported;

#[cfg(target_os = "linux")]
pub use self::linux::{LibcAllocator, ProcMaps};
#[cfg(any(target_os = "linux", test))]
pub use self::maps::MapsReader;
#[cfg(any(target_os = "linux", test))]
pub use self::sub_break::{SubBreakAllocator, SubBreakChain, SUB_BREAK_SIZE};

#[cfg(target_os = "linux")]
pub type PlatformResolver = linux::ProcMaps;
#[cfg(target_os = "macos")]
pub type PlatformResolver = macos::MachRegions;
#[cfg(not(any(target_os = "linux", target_os = "macos")))]
pub type PlatformResolver = unsupported::Unsupported;

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct Protection: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
        /// Shared rather than private (copy-on-write) mapping.
        const SHARED = 1 << 3;
    }
}

/// A half-open address range `[start, stop)` with its access rights.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MemoryRegion {
    pub start: usize,
    pub stop: usize,
    pub protection: Protection,
}

impl MemoryRegion {
    pub fn contains(&self, addr: usize) -> bool {
        self.start <= addr && addr < self.stop
    }

    pub fn len(&self) -> usize {
        self.stop.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_readable(&self) -> bool {
        self.protection.contains(Protection::READ)
    }

    pub fn is_writable(&self) -> bool {
        self.protection.contains(Protection::WRITE)
    }

    pub fn is_executable(&self) -> bool {
        self.protection.contains(Protection::EXECUTE)
    }
}

impl fmt::Display for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = |set: Protection, c: char| if self.protection.contains(set) { c } else { '-' };
        write!(
            f,
            "{:#x}-{:#x} {}{}{}{}",
            self.start,
            self.stop,
            flag(Protection::READ, 'r'),
            flag(Protection::WRITE, 'w'),
            flag(Protection::EXECUTE, 'x'),
            if self.protection.contains(Protection::SHARED) { 's' } else { 'p' },
        )
    }
}

/// Platform backend: finds the mapping enclosing `addr`, whatever its rights.
pub trait RegionResolver {
    fn resolve(&mut self, addr: usize) -> Option<MemoryRegion>;
}

/// Resolver plus the "unreadable means not found" policy.
pub struct MemoryRegionOracle<R = PlatformResolver> {
    resolver: R,
}

impl MemoryRegionOracle {
    pub const fn new() -> Self {
        Self {
            resolver: PlatformResolver::new(),
        }
    }
}

impl Default for MemoryRegionOracle {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: RegionResolver> MemoryRegionOracle<R> {
    pub fn with_resolver(resolver: R) -> Self {
        Self { resolver }
    }

    pub fn resolver(&self) -> &R {
        &self.resolver
    }

    pub fn query(&mut self, addr: usize) -> Option<MemoryRegion> {
        let region = self.resolver.resolve(addr)?;
        region.is_readable().then_some(region)
    }
}

static ORACLE: Mutex<MemoryRegionOracle> = Mutex::new(MemoryRegionOracle::new());

/// Returns the readable region enclosing `addr`, or `None` if it is unmapped,
/// unreadable, or the platform has no way to tell.
///
/// Never blocks: if another thread (or an interrupted frame on this one) is
/// mid-query, this returns `None` instead of waiting.
pub fn query_virtual_address(addr: usize) -> Option<MemoryRegion> {
    let mut oracle = match ORACLE.try_lock() {
        Ok(oracle) => oracle,
        Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        Err(TryLockError::WouldBlock) => return None,
    };
    oracle.query(addr)
}

/// Forgets all pinned sub-breaks (they stay allocated).
#[cfg(test)]
pub(crate) fn reset_for_tests() {
    let mut oracle = ORACLE
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    *oracle = MemoryRegionOracle::new();
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Option<MemoryRegion>);

    impl RegionResolver for Fixed {
        fn resolve(&mut self, addr: usize) -> Option<MemoryRegion> {
            self.0.filter(|region| region.contains(addr))
        }
    }

    #[test]
    fn unreadable_regions_are_not_reported() {
        let guard = MemoryRegion {
            start: 0x1000,
            stop: 0x2000,
            protection: Protection::empty(),
        };
        let mut oracle = MemoryRegionOracle::with_resolver(Fixed(Some(guard)));
        assert_eq!(oracle.query(0x1800), None);

        let data = MemoryRegion {
            protection: Protection::READ | Protection::WRITE,
            ..guard
        };
        let mut oracle = MemoryRegionOracle::with_resolver(Fixed(Some(data)));
        assert_eq!(oracle.query(0x1800), Some(data));
        assert_eq!(oracle.query(0x2000), None);
    }

    #[test]
    fn display_matches_maps_notation() {
        let region = MemoryRegion {
            start: 0x400000,
            stop: 0x452000,
            protection: Protection::READ | Protection::EXECUTE,
        };
        assert_eq!(region.to_string(), "0x400000-0x452000 r-xp");
        assert_eq!(region.len(), 0x52000);
    }

    #[cfg(any(target_os = "linux", target_os = "macos"))]
    #[test]
    fn global_query_survives_reset() {
        let local = 7u32;
        let addr = &local as *const u32 as usize;
        let first = query_virtual_address(addr).expect("stack is mapped");
        reset_for_tests();
        let second = query_virtual_address(addr).expect("stack is mapped");
        assert!(first.contains(addr));
        assert!(second.contains(addr));
    }
}
