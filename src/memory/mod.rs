pub mod frame_allocator;
pub mod paging;
pub mod vmm;

use frame_allocator::BumpFrameAllocator;
use lazy_static::lazy_static;
use multiboot2::{BootInformation, BootInformationHeader, MemoryAreaType};
use spin::Mutex;
use x86_64::PhysAddr;

/// Fixed physical memory layout. The boot stub links the kernel at 1 MiB
/// and leaves user task images in the 2 MiB window starting at USER_BASE.
pub const KERNEL_BASE: u64 = 0x100000;
pub const KERNEL_STACK_TOP: u64 = 0x200000;
pub const USER_BASE: u64 = 0x400000;
pub const USER_STACK_TOP: u64 = 0x600000;

pub const PAGE_SIZE: u64 = 4096;
pub const KERNEL_STACK_SIZE: u64 = 8192;
pub const USER_STACK_SIZE: u64 = 16384;

/// Physical frames handed out at runtime start here, well clear of the
/// kernel image and the boot page tables.
pub const FRAME_POOL_BASE: u64 = 0x1000000;

lazy_static! {
    pub static ref FRAME_ALLOCATOR: Mutex<BumpFrameAllocator> =
        Mutex::new(BumpFrameAllocator::new());
}

/// Bring up the memory subsystem: locate usable physical memory from the
/// Multiboot2 map, install the identity-mapped boot page tables, seed the
/// frame pool, and reset the demand-paging state.
pub fn init(multiboot_info_addr: usize) {
    let boot_info = unsafe {
        BootInformation::load(multiboot_info_addr as *const BootInformationHeader)
            .expect("failed to load Multiboot2 info")
    };
    let memory_map = boot_info
        .memory_map_tag()
        .expect("Multiboot2 memory map tag required");

    // The frame pool is the available region containing FRAME_POOL_BASE.
    let mut pool_end = FRAME_POOL_BASE;
    for area in memory_map.memory_areas() {
        if MemoryAreaType::from(area.typ()) != MemoryAreaType::Available {
            continue;
        }
        if area.start_address() <= FRAME_POOL_BASE && FRAME_POOL_BASE < area.end_address() {
            pool_end = area.end_address();
        }
    }
    if pool_end == FRAME_POOL_BASE {
        panic!("no usable physical memory above {:#x}", FRAME_POOL_BASE);
    }

    unsafe {
        paging::bootstrap_identity_map();
    }
    crate::log_info!("Boot page tables installed, first 1 GiB identity mapped.");

    unsafe {
        FRAME_ALLOCATOR.lock().init(
            PhysAddr::new(FRAME_POOL_BASE),
            PhysAddr::new(pool_end),
        );
    }
    crate::log_info!(
        "Physical frame pool: {:#x}..{:#x} ({} KiB).",
        FRAME_POOL_BASE,
        pool_end,
        (pool_end - FRAME_POOL_BASE) / 1024
    );

    vmm::init();
}

/// Round an address down to its page boundary.
pub const fn align_down(addr: u64) -> u64 {
    addr & !(PAGE_SIZE - 1)
}

/// True when `addr` lies in the demand-paged user window.
pub const fn is_user_addr(addr: u64) -> bool {
    addr >= USER_BASE && addr < USER_STACK_TOP
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_down_masks_offset() {
        assert_eq!(align_down(0x500000), 0x500000);
        assert_eq!(align_down(0x500001), 0x500000);
        assert_eq!(align_down(0x500FFF), 0x500000);
        assert_eq!(align_down(0x501000), 0x501000);
    }

    #[test]
    fn user_window_boundaries() {
        assert!(!is_user_addr(USER_BASE - 1));
        assert!(is_user_addr(USER_BASE));
        assert!(is_user_addr(USER_STACK_TOP - 1));
        assert!(!is_user_addr(USER_STACK_TOP));
    }
}
