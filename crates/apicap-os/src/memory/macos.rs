use std::mem;

use super::{MemoryRegion, Protection, RegionResolver};

type KernReturn = i32;
type MachPort = u32;
type VmProt = i32;

const KERN_SUCCESS: KernReturn = 0;
const VM_REGION_BASIC_INFO_64: i32 = 9;
const VM_PROT_READ: VmProt = 0x1;
const VM_PROT_WRITE: VmProt = 0x2;
const VM_PROT_EXECUTE: VmProt = 0x4;

/// `vm_region_basic_info_data_64_t`.
#[repr(C, packed(4))]
#[allow(dead_code)]
#[derive(Clone, Copy, Default)]
struct RegionBasicInfo64 {
    protection: VmProt,
    max_protection: VmProt,
    inheritance: u32,
    shared: u32,
    reserved: u32,
    offset: u64,
    behavior: i32,
    user_wired_count: u16,
}

const REGION_BASIC_INFO_COUNT_64: u32 =
    (mem::size_of::<RegionBasicInfo64>() / mem::size_of::<i32>()) as u32;

extern "C" {
    static mach_task_self_: MachPort;

    fn mach_vm_region(
        target_task: MachPort,
        address: *mut u64,
        size: *mut u64,
        flavor: i32,
        info: *mut i32,
        info_count: *mut u32,
        object_name: *mut MachPort,
    ) -> KernReturn;
}

/// macOS resolver: one `mach_vm_region` query per lookup.
#[derive(Debug, Default)]
pub struct MachRegions;

impl MachRegions {
    pub const fn new() -> Self {
        MachRegions
    }
}

fn protection(info: &RegionBasicInfo64) -> Protection {
    let prot = info.protection;
    let mut protection = Protection::empty();
    protection.set(Protection::READ, prot & VM_PROT_READ != 0);
    protection.set(Protection::WRITE, prot & VM_PROT_WRITE != 0);
    protection.set(Protection::EXECUTE, prot & VM_PROT_EXECUTE != 0);
    protection.set(Protection::SHARED, { info.shared } != 0);
    protection
}

impl RegionResolver for MachRegions {
    fn resolve(&mut self, addr: usize) -> Option<MemoryRegion> {
        let mut address = addr as u64;
        let mut size = 0u64;
        let mut info = RegionBasicInfo64::default();
        let mut count = REGION_BASIC_INFO_COUNT_64;
        let mut object_name: MachPort = 0;

        // SAFETY: every out-pointer refers to a live local of the layout the
        // kernel expects for VM_REGION_BASIC_INFO_64.
        let kr = unsafe {
            mach_vm_region(
                mach_task_self_,
                &mut address,
                &mut size,
                VM_REGION_BASIC_INFO_64,
                (&mut info as *mut RegionBasicInfo64).cast(),
                &mut count,
                &mut object_name,
            )
        };
        if kr != KERN_SUCCESS {
            return None;
        }

        let start = usize::try_from(address).ok()?;
        let stop = start.checked_add(usize::try_from(size).ok()?)?;
        // The kernel reports the next region at or above `addr`.
        let region = MemoryRegion {
            start,
            stop,
            protection: protection(&info),
        };
        region.contains(addr).then_some(region)
    }
}
