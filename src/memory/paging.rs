//! Four-level page-table walker over the shared kernel address space.
//!
//! All tasks alias the boot PML4, so every walk starts from CR3. The boot
//! tables identity map the first gigabyte with 2 MiB entries; runtime
//! mappings are 4 KiB leaves in the PT level, splitting a boot 2 MiB entry
//! on first contact.

use bit_field::BitField;
use bitflags::bitflags;

use super::FRAME_ALLOCATOR;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u64 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
        const HUGE = 1 << 7;
        const GLOBAL = 1 << 8;
    }
}

const ENTRY_COUNT: usize = 512;
const PHYS_ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;
const HUGE_2M_ADDR_MASK: u64 = 0x000F_FFFF_FFE0_0000;
const HUGE_2M_OFFSET: u64 = 0x1F_FFFF;
const HUGE_2M_SIZE: u64 = 0x20_0000;

/// Fixed roots of the boot page-table tree.
pub const PML4_ROOT: u64 = 0x1000;
const BOOT_PDPT: u64 = 0x2000;
const BOOT_PD: u64 = 0x3000;

type Table = [u64; ENTRY_COUNT];

pub fn pml4_index(vaddr: u64) -> usize {
    vaddr.get_bits(39..48) as usize
}

pub fn pdpt_index(vaddr: u64) -> usize {
    vaddr.get_bits(30..39) as usize
}

pub fn pd_index(vaddr: u64) -> usize {
    vaddr.get_bits(21..30) as usize
}

pub fn pt_index(vaddr: u64) -> usize {
    vaddr.get_bits(12..21) as usize
}

fn is_present(entry: u64) -> bool {
    PteFlags::from_bits_truncate(entry).contains(PteFlags::PRESENT)
}

fn is_huge(entry: u64) -> bool {
    PteFlags::from_bits_truncate(entry).contains(PteFlags::HUGE)
}

/// View a physical table address as a live table. Valid for frames below
/// 1 GiB, which the boot tables identity map.
unsafe fn table_at(phys: u64) -> &'static mut Table {
    &mut *(phys as *mut Table)
}

fn current_root() -> u64 {
    use x86_64::registers::control::Cr3;
    let (frame, _) = Cr3::read();
    frame.start_address().as_u64()
}

fn flush_tlb() {
    // Re-writing CR3 invalidates all non-global translations.
    x86_64::instructions::tlb::flush_all();
}

/// Build the boot identity map at the fixed roots and switch CR3 to it:
/// PML4[0] -> PDPT[0] -> PD with 512 x 2 MiB supervisor entries.
pub unsafe fn bootstrap_identity_map() {
    use x86_64::registers::control::{Cr3, Cr3Flags};
    use x86_64::structures::paging::PhysFrame;
    use x86_64::PhysAddr;

    let pml4 = table_at(PML4_ROOT);
    let pdpt = table_at(BOOT_PDPT);
    let pd = table_at(BOOT_PD);
    pml4.fill(0);
    pdpt.fill(0);
    pd.fill(0);

    let link = (PteFlags::PRESENT | PteFlags::WRITABLE).bits();
    pml4[0] = BOOT_PDPT | link;
    pdpt[0] = BOOT_PD | link;

    let huge = (PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::HUGE).bits();
    for (i, entry) in pd.iter_mut().enumerate() {
        *entry = (i as u64 * HUGE_2M_SIZE) | huge;
    }

    Cr3::write(
        PhysFrame::containing_address(PhysAddr::new(PML4_ROOT)),
        Cr3Flags::empty(),
    );
}

/// Return the next-level table under `table[index]`, bump-allocating a
/// zeroed one and linking it Present|RW if the entry is empty.
///
/// Running out of frames for page tables is unrecoverable.
unsafe fn descend_or_create(table: &mut Table, index: usize) -> u64 {
    let entry = table[index];
    if is_present(entry) {
        return entry & PHYS_ADDR_MASK;
    }
    let frame = FRAME_ALLOCATOR
        .lock()
        .allocate_zeroed_frame()
        .expect("frame pool exhausted while extending page tables");
    let phys = frame.start_address().as_u64();
    table[index] = phys | (PteFlags::PRESENT | PteFlags::WRITABLE).bits();
    phys
}

/// Replace a 2 MiB boot entry with a PT that reproduces the same mapping
/// as 512 x 4 KiB entries, so single pages inside it can be remapped or
/// dropped without losing the rest of the region.
unsafe fn split_huge_entry(pd: &mut Table, index: usize) {
    let old = pd[index];
    let base = old & HUGE_2M_ADDR_MASK;
    let leaf_flags = (old & !HUGE_2M_ADDR_MASK) & !PteFlags::HUGE.bits();

    let frame = FRAME_ALLOCATOR
        .lock()
        .allocate_zeroed_frame()
        .expect("frame pool exhausted while splitting a 2 MiB mapping");
    let pt_phys = frame.start_address().as_u64();
    let pt = table_at(pt_phys);
    for (i, entry) in pt.iter_mut().enumerate() {
        *entry = (base + i as u64 * super::PAGE_SIZE) | leaf_flags;
    }
    pd[index] = pt_phys | (PteFlags::PRESENT | PteFlags::WRITABLE).bits();
}

/// Map one 4 KiB page. Missing intermediate tables are created; a 2 MiB
/// boot entry covering `vaddr` is split first.
pub fn map_page(vaddr: u64, paddr: u64, user: bool, writable: bool) {
    unsafe {
        let pml4 = table_at(current_root());
        let pdpt = table_at(descend_or_create(pml4, pml4_index(vaddr)));
        let pd = table_at(descend_or_create(pdpt, pdpt_index(vaddr)));
        if is_present(pd[pd_index(vaddr)]) && is_huge(pd[pd_index(vaddr)]) {
            split_huge_entry(pd, pd_index(vaddr));
        }
        let pt = table_at(descend_or_create(pd, pd_index(vaddr)));

        let mut flags = PteFlags::PRESENT;
        if writable {
            flags |= PteFlags::WRITABLE;
        }
        if user {
            flags |= PteFlags::USER;
        } else {
            flags |= PteFlags::GLOBAL;
        }
        pt[pt_index(vaddr)] = (paddr & PHYS_ADDR_MASK) | flags.bits();
    }
    flush_tlb();
}

/// Drop the 4 KiB mapping for `vaddr`. Missing intermediates (or a huge
/// entry, which no 4 KiB mapping can live under) mean there is nothing
/// to do.
pub fn unmap_page(vaddr: u64) {
    unsafe {
        let pml4 = table_at(current_root());
        let pml4e = pml4[pml4_index(vaddr)];
        if !is_present(pml4e) {
            return;
        }
        let pdpt = table_at(pml4e & PHYS_ADDR_MASK);
        let pdpte = pdpt[pdpt_index(vaddr)];
        if !is_present(pdpte) {
            return;
        }
        let pd = table_at(pdpte & PHYS_ADDR_MASK);
        let pde = pd[pd_index(vaddr)];
        if !is_present(pde) || is_huge(pde) {
            return;
        }
        let pt = table_at(pde & PHYS_ADDR_MASK);
        pt[pt_index(vaddr)] = 0;
    }
    flush_tlb();
}

/// Walk the tree; 0 when any level is non-present. Resolves both 4 KiB
/// leaves and the boot 2 MiB entries.
pub fn translate(vaddr: u64) -> u64 {
    unsafe {
        let pml4 = table_at(current_root());
        let pml4e = pml4[pml4_index(vaddr)];
        if !is_present(pml4e) {
            return 0;
        }
        let pdpt = table_at(pml4e & PHYS_ADDR_MASK);
        let pdpte = pdpt[pdpt_index(vaddr)];
        if !is_present(pdpte) {
            return 0;
        }
        let pd = table_at(pdpte & PHYS_ADDR_MASK);
        let pde = pd[pd_index(vaddr)];
        if !is_present(pde) {
            return 0;
        }
        if is_huge(pde) {
            return (pde & HUGE_2M_ADDR_MASK) | (vaddr & HUGE_2M_OFFSET);
        }
        let pt = table_at(pde & PHYS_ADDR_MASK);
        let pte = pt[pt_index(vaddr)];
        if !is_present(pte) {
            return 0;
        }
        (pte & PHYS_ADDR_MASK) | (vaddr & (super::PAGE_SIZE - 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_decomposition() {
        // 0x500000 sits in the first PD entry group: PML4 0, PDPT 0, PD 2.
        assert_eq!(pml4_index(0x500000), 0);
        assert_eq!(pdpt_index(0x500000), 0);
        assert_eq!(pd_index(0x500000), 2);
        assert_eq!(pt_index(0x500000), 256);
    }

    #[test]
    fn index_fields_are_nine_bits() {
        let vaddr = (511u64 << 39) | (510 << 30) | (509 << 21) | (508 << 12);
        assert_eq!(pml4_index(vaddr), 511);
        assert_eq!(pdpt_index(vaddr), 510);
        assert_eq!(pd_index(vaddr), 509);
        assert_eq!(pt_index(vaddr), 508);
    }

    #[test]
    fn present_and_huge_bits() {
        assert!(is_present(0x1000 | 0x3));
        assert!(!is_present(0x1000));
        assert!(is_huge(0x83));
        assert!(!is_huge(0x3));
    }
}
