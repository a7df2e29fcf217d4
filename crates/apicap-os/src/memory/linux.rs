use std::ffi::c_void;
use std::fs::File;
use std::io::Read;
use std::sync::Once;

use super::maps::MapsReader;
use super::sub_break::{SubBreakAllocator, SubBreakChain, SUB_BREAK_SIZE};
use super::{MemoryRegion, Protection, RegionResolver};

const FALLBACK_PAGE_SIZE: usize = 4096;

/// Sub-break blocks from the C allocator, i.e. glibc's main arena when called
/// from the main thread.
#[derive(Debug, Default)]
pub struct LibcAllocator;

impl SubBreakAllocator for LibcAllocator {
    fn allocate(&mut self) -> Option<usize> {
        // SAFETY: plain C allocation; the block is only ever handed back to
        // `free` through `release`.
        let block = unsafe { libc::malloc(SUB_BREAK_SIZE) };
        (!block.is_null()).then_some(block as usize)
    }

    fn release(&mut self, addr: usize) {
        // SAFETY: `addr` came from `allocate` and is released once.
        unsafe { libc::free(addr as *mut c_void) };
    }

    fn program_break(&self) -> usize {
        current_break()
    }
}

/// Keeps the heap from shrinking under pinned sub-breaks and pushes larger
/// allocations out to mmap, so the break moves less.
fn tune_allocator() {
    static TUNED: Once = Once::new();
    TUNED.call_once(|| {
        #[cfg(target_env = "gnu")]
        // SAFETY: mallopt only adjusts allocator thresholds.
        unsafe {
            libc::mallopt(libc::M_TRIM_THRESHOLD, -1);
            libc::mallopt(libc::M_MMAP_THRESHOLD, 64 * 1024);
        }
    });
}

fn page_size() -> usize {
    // SAFETY: sysconf has no memory-safety preconditions.
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        n if n > 0 => n as usize,
        _ => FALLBACK_PAGE_SIZE,
    }
}

fn current_break() -> usize {
    // SAFETY: sbrk(0) only reports the current program break.
    unsafe { libc::sbrk(0) as usize }
}

/// Whether `region` is the heap segment, i.e. ends at the (page-rounded)
/// program break.
///
/// Deliberately stricter than "ends at or below the break": that condition
/// holds for every mapping below the heap too (the executable's data segment,
/// for one), which would then be carved up by sub-breaks that can never land
/// inside it.
fn ends_at_break(region: &MemoryRegion, brk: usize, page_size: usize) -> bool {
    let rounded = brk.saturating_add(page_size - 1) & !(page_size - 1);
    region.start <= brk && brk <= region.stop && region.stop <= rounded
}

/// Linux resolver over `/proc/self/maps`, read fresh for every query.
pub struct ProcMaps<A = LibcAllocator> {
    chain: SubBreakChain<A>,
}

impl ProcMaps {
    pub const fn new() -> Self {
        Self {
            chain: SubBreakChain::new(LibcAllocator),
        }
    }
}

impl Default for ProcMaps {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: SubBreakAllocator> ProcMaps<A> {
    pub fn with_allocator(allocator: A) -> Self {
        Self {
            chain: SubBreakChain::new(allocator),
        }
    }

    pub fn chain(&self) -> &SubBreakChain<A> {
        &self.chain
    }

    /// Finds the region enclosing `addr` in `maps`, given the program break
    /// `brk` at the time of the query.
    ///
    /// Unreadable regions are not found. The heap segment is narrowed through
    /// the sub-break chain; any other region absorbs the readable,
    /// non-executable regions that directly follow it, since a loaded object's
    /// data segment is mapped as a file-backed part plus an anonymous part.
    pub fn resolve_in<R: Read>(
        &mut self,
        mut maps: MapsReader<R>,
        addr: usize,
        brk: usize,
        page_size: usize,
    ) -> Option<MemoryRegion> {
        let mut region = loop {
            let region = maps.next_region()?;
            if region.contains(addr) {
                break region;
            }
        };
        if !region.is_readable() {
            return None;
        }

        if ends_at_break(&region, brk, page_size) {
            if let Some(pinned) = self.chain.pin(&region, addr) {
                return Some(pinned);
            }
        }

        while let Some(next) = maps.next_region() {
            if !next.is_readable()
                || next.protection.contains(Protection::EXECUTE)
                || next.start != region.stop
            {
                break;
            }
            region.stop = next.stop;
        }
        Some(region)
    }
}

impl<A: SubBreakAllocator> RegionResolver for ProcMaps<A> {
    fn resolve(&mut self, addr: usize) -> Option<MemoryRegion> {
        tune_allocator();
        let maps = File::open("/proc/self/maps").ok()?;
        let brk = current_break();
        self.resolve_in(MapsReader::new(maps), addr, brk, page_size())
    }
}
