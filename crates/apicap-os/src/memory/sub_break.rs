use super::MemoryRegion;

/// Size of one sub-break allocation. Must stay well below the allocator's mmap
/// threshold so it is served from the main heap.
pub const SUB_BREAK_SIZE: usize = 1024;

/// Slack on top of "one attempt per sub-break-sized slot in the heap" before
/// giving up on landing an allocation above an address.
const ATTEMPT_SLACK: usize = 16;

/// Source of [`SUB_BREAK_SIZE`]-byte heap blocks.
pub trait SubBreakAllocator {
    /// Address of a fresh block, or `None` when the allocator is exhausted.
    fn allocate(&mut self) -> Option<usize>;
    fn release(&mut self, addr: usize);
    /// Current program break. Blocks ending above it came from somewhere other
    /// than the break-managed heap (another arena, an mmap) and cannot bound a
    /// heap sub-region.
    fn program_break(&self) -> usize;
}

/// Permanent small allocations that split the heap into fixed sub-regions.
///
/// glibc's main heap grows by moving the program break, so the mapping that
/// encloses a heap pointer keeps getting longer. Reporting that whole mapping
/// would make the bounds of the same pointer differ from one query to the
/// next. Instead, a block is pinned above each queried address and the bounds
/// are taken from the gap between two pinned blocks, which never moves.
///
/// Blocks are kept in ascending address order and never released. Every
/// pinned block lay below the program break when it was allocated, and the
/// break never moves back under it, so a stretch between two blocks is fixed
/// for the life of the process.
pub struct SubBreakChain<A> {
    allocator: A,
    breaks: Vec<usize>,
}

impl<A: SubBreakAllocator> SubBreakChain<A> {
    pub const fn new(allocator: A) -> Self {
        Self {
            allocator,
            breaks: Vec::new(),
        }
    }

    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    /// Addresses of the pinned blocks, ascending.
    pub fn sub_breaks(&self) -> &[usize] {
        &self.breaks
    }

    /// Narrows `heap`, the mapping enclosing `addr`, to the stable stretch
    /// around `addr`: from the end of the pinned block below it (or the start
    /// of `heap`) up to the first pinned block above it.
    ///
    /// Pins a new block if none lies above `addr` yet. Returns `None` if that
    /// fails, in which case the caller falls back to `heap` itself.
    pub fn pin(&mut self, heap: &MemoryRegion, addr: usize) -> Option<MemoryRegion> {
        debug_assert!(heap.contains(addr));

        let index = match self
            .breaks
            .iter()
            .position(|&sb| addr < sb.saturating_add(SUB_BREAK_SIZE))
        {
            Some(index) => index,
            None => self.extend_past(heap, addr)?,
        };

        let sb = self.breaks[index];
        let (start, stop) = if addr >= sb {
            // `addr` points into the pinned block itself.
            (sb, sb.saturating_add(SUB_BREAK_SIZE))
        } else {
            let floor = match index {
                0 => heap.start,
                _ => self.breaks[index - 1] + SUB_BREAK_SIZE,
            };
            (floor, sb)
        };
        Some(MemoryRegion {
            start: start.max(heap.start),
            stop: stop.min(heap.stop),
            protection: heap.protection,
        })
    }

    /// Allocates until a block lands between `addr` and the program break,
    /// releases every other candidate, and appends the winner. Returns its
    /// index.
    fn extend_past(&mut self, heap: &MemoryRegion, addr: usize) -> Option<usize> {
        let budget = heap.len() / SUB_BREAK_SIZE + ATTEMPT_SLACK;
        let mut rejected = Vec::new();
        let mut found = None;
        for _ in 0..budget {
            let Some(block) = self.allocator.allocate() else {
                break;
            };
            let below_break =
                block.saturating_add(SUB_BREAK_SIZE) <= self.allocator.program_break();
            if block > addr && below_break {
                found = Some(block);
                break;
            }
            rejected.push(block);
        }
        for block in rejected {
            self.allocator.release(block);
        }

        let block = found?;
        debug_assert!(self.breaks.last().map_or(true, |&last| last < block));
        self.breaks.push(block);
        Some(self.breaks.len() - 1)
    }
}
