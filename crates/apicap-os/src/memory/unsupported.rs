use super::{MemoryRegion, RegionResolver};

/// Platforms without a region query: nothing is ever found.
#[derive(Debug, Default)]
pub struct Unsupported;

impl Unsupported {
    pub const fn new() -> Self {
        Unsupported
    }
}

impl RegionResolver for Unsupported {
    fn resolve(&mut self, _addr: usize) -> Option<MemoryRegion> {
        None
    }
}
