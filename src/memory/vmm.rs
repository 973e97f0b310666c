//! Demand paging over a bounded pool of physical frames.
//!
//! A page fault inside the user window allocates a zeroed frame and maps
//! it; when the frame table is full the least recently touched page is
//! evicted first. There is no swap backing store, so eviction discards
//! page contents, dirty or not.

use lazy_static::lazy_static;
use spin::Mutex;

use super::{align_down, is_user_addr, paging, FRAME_ALLOCATOR};

pub const MAX_PHYSICAL_PAGES: usize = 1024;

#[derive(Debug, Clone, Copy)]
pub struct PageFrame {
    pub vaddr: u64,
    pub paddr: u64,
    pub dirty: bool,
    pub accessed: bool,
    pub last_access: u64,
}

impl PageFrame {
    const fn empty() -> PageFrame {
        PageFrame {
            vaddr: 0,
            paddr: 0,
            dirty: false,
            accessed: false,
            last_access: 0,
        }
    }
}

/// Resident-page bookkeeping: one entry per mapped user page, bound by
/// `capacity`. The LRU stamp is a monotonic counter bumped on every touch;
/// it never decreases and is assumed never to wrap.
pub struct FrameTable {
    entries: [PageFrame; MAX_PHYSICAL_PAGES],
    count: usize,
    capacity: usize,
    clock: u64,
}

impl FrameTable {
    pub const fn new() -> FrameTable {
        FrameTable {
            entries: [PageFrame::empty(); MAX_PHYSICAL_PAGES],
            count: 0,
            capacity: MAX_PHYSICAL_PAGES,
            clock: 0,
        }
    }

    /// Smaller capacity for exercising eviction without 1024 frames.
    #[cfg(test)]
    fn with_capacity(capacity: usize) -> FrameTable {
        let mut table = FrameTable::new();
        table.capacity = capacity;
        table
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_full(&self) -> bool {
        self.count >= self.capacity
    }

    fn stamp(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn position(&self, vaddr: u64) -> Option<usize> {
        self.entries[..self.count].iter().position(|e| e.vaddr == vaddr)
    }

    pub fn lookup(&self, vaddr: u64) -> Option<&PageFrame> {
        self.position(vaddr).map(|i| &self.entries[i])
    }

    /// Refresh the LRU stamp of a resident page. False on a miss.
    pub fn touch(&mut self, vaddr: u64) -> bool {
        let stamp = self.stamp();
        match self.position(vaddr) {
            Some(i) => {
                self.entries[i].accessed = true;
                self.entries[i].last_access = stamp;
                true
            }
            None => false,
        }
    }

    /// Record a new resident page. False when the table is at capacity.
    pub fn insert(&mut self, vaddr: u64, paddr: u64) -> bool {
        if self.is_full() {
            return false;
        }
        let stamp = self.stamp();
        self.entries[self.count] = PageFrame {
            vaddr,
            paddr,
            dirty: false,
            accessed: true,
            last_access: stamp,
        };
        self.count += 1;
        true
    }

    pub fn mark_dirty(&mut self, vaddr: u64) -> bool {
        match self.position(vaddr) {
            Some(i) => {
                self.entries[i].dirty = true;
                true
            }
            None => false,
        }
    }

    /// Index of the entry with the smallest LRU stamp; ties break toward
    /// the lowest index.
    pub fn lru_victim(&self) -> Option<usize> {
        let mut victim = None;
        let mut oldest = u64::MAX;
        for (i, entry) in self.entries[..self.count].iter().enumerate() {
            if entry.last_access < oldest {
                oldest = entry.last_access;
                victim = Some(i);
            }
        }
        victim
    }

    /// Remove an entry, compacting the tail into the hole.
    pub fn remove(&mut self, index: usize) -> PageFrame {
        debug_assert!(index < self.count);
        let removed = self.entries[index];
        for i in index..self.count - 1 {
            self.entries[i] = self.entries[i + 1];
        }
        self.count -= 1;
        removed
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct VmStats {
    pub faults_serviced: u64,
    pub pages_evicted: u64,
}

struct Vmm {
    table: FrameTable,
    stats: VmStats,
}

lazy_static! {
    static ref VMM: Mutex<Vmm> = Mutex::new(Vmm {
        table: FrameTable::new(),
        stats: VmStats {
            faults_serviced: 0,
            pages_evicted: 0,
        },
    });
}

pub fn init() {
    let vmm = VMM.lock();
    crate::log_info!(
        "Virtual memory manager ready, frame table capacity {}.",
        vmm.table.capacity
    );
}

/// Frame-table capacity reached and the bump pool could not help either.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramePoolExhausted;

/// Entry point from the page-fault ISR, with CR2 already read out.
/// Faults outside the user window are kernel bugs and unrecoverable.
pub fn service_page_fault(fault_addr: u64) {
    if !is_user_addr(fault_addr) {
        panic!("page fault outside user range at {:#x}", fault_addr);
    }
    let vaddr = align_down(fault_addr);

    VMM.lock().stats.faults_serviced += 1;

    if allocate_page(vaddr).is_err() {
        evict_lru_page();
        if allocate_page(vaddr).is_err() {
            panic!("frame pool exhausted even after eviction at {:#x}", vaddr);
        }
    }
}

/// Make `vaddr` (page-aligned) resident. A hit refreshes the LRU stamp;
/// a miss takes a zeroed frame from the bump pool and maps it user+rw.
pub fn allocate_page(vaddr: u64) -> Result<(), FramePoolExhausted> {
    let mut vmm = VMM.lock();
    if vmm.table.touch(vaddr) {
        return Ok(());
    }
    if vmm.table.is_full() {
        return Err(FramePoolExhausted);
    }
    let frame = FRAME_ALLOCATOR
        .lock()
        .allocate_zeroed_frame()
        .ok_or(FramePoolExhausted)?;
    let paddr = frame.start_address().as_u64();
    vmm.table.insert(vaddr, paddr);
    paging::map_page(vaddr, paddr, true, true);
    Ok(())
}

/// Evict the least recently used page: unmap it and drop its entry.
/// Dirty contents are discarded; there is no swap.
pub fn evict_lru_page() {
    let mut vmm = VMM.lock();
    let Some(victim) = vmm.table.lru_victim() else {
        return;
    };
    let frame = vmm.table.remove(victim);
    paging::unmap_page(frame.vaddr);
    vmm.stats.pages_evicted += 1;
    crate::log_info!(
        "Evicted page {:#x} (frame {:#x}{}).",
        frame.vaddr,
        frame.paddr,
        if frame.dirty { ", dirty data discarded" } else { "" }
    );
}

/// Record a store to a resident page.
pub fn mark_page_dirty(vaddr: u64) {
    VMM.lock().table.mark_dirty(align_down(vaddr));
}

pub fn stats() -> VmStats {
    VMM.lock().stats
}

pub fn resident_pages() -> usize {
    VMM.lock().table.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_touch_hits() {
        let mut table = FrameTable::with_capacity(4);
        assert!(table.insert(0x400000, 0x1000000));
        assert!(table.touch(0x400000));
        assert!(!table.touch(0x401000));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn insert_rejects_at_capacity() {
        let mut table = FrameTable::with_capacity(2);
        assert!(table.insert(0x400000, 0x1000000));
        assert!(table.insert(0x401000, 0x1001000));
        assert!(!table.insert(0x402000, 0x1002000));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn lru_victim_is_least_recently_touched() {
        let mut table = FrameTable::with_capacity(3);
        table.insert(0x400000, 0x1000000);
        table.insert(0x401000, 0x1001000);
        table.insert(0x402000, 0x1002000);
        // Refresh the first page; the second becomes the victim.
        table.touch(0x400000);
        let victim = table.lru_victim().unwrap();
        assert_eq!(table.entries[victim].vaddr, 0x401000);
    }

    #[test]
    fn lru_stamp_is_monotonic() {
        let mut table = FrameTable::with_capacity(3);
        table.insert(0x400000, 0x1000000);
        let first = table.lookup(0x400000).unwrap().last_access;
        table.touch(0x400000);
        let second = table.lookup(0x400000).unwrap().last_access;
        assert!(second > first);
    }

    #[test]
    fn remove_compacts_tail() {
        let mut table = FrameTable::with_capacity(3);
        table.insert(0x400000, 0x1000000);
        table.insert(0x401000, 0x1001000);
        table.insert(0x402000, 0x1002000);
        let removed = table.remove(0);
        assert_eq!(removed.vaddr, 0x400000);
        assert_eq!(table.len(), 2);
        assert_eq!(table.entries[0].vaddr, 0x401000);
        assert_eq!(table.entries[1].vaddr, 0x402000);
        assert!(table.lookup(0x400000).is_none());
    }

    #[test]
    fn mark_dirty_only_hits_resident_pages() {
        let mut table = FrameTable::with_capacity(2);
        table.insert(0x400000, 0x1000000);
        assert!(table.mark_dirty(0x400000));
        assert!(!table.mark_dirty(0x401000));
        assert!(table.lookup(0x400000).unwrap().dirty);
    }

    // Touch four pages through a three-frame table; the first touched page
    // gets evicted and the later three stay resident.
    #[test]
    fn four_pages_through_three_frames() {
        let mut table = FrameTable::with_capacity(3);
        let pages = [0x400000u64, 0x401000, 0x402000, 0x403000];
        let mut next_phys = 0x1000000u64;
        for &page in &pages {
            if !table.touch(page) {
                if table.is_full() {
                    let victim = table.lru_victim().unwrap();
                    table.remove(victim);
                }
                assert!(table.insert(page, next_phys));
                next_phys += 0x1000;
            }
        }
        assert!(table.lookup(0x400000).is_none());
        assert!(table.lookup(0x401000).is_some());
        assert!(table.lookup(0x402000).is_some());
        assert!(table.lookup(0x403000).is_some());
    }

    #[test]
    fn victim_tie_break_prefers_lowest_index() {
        let mut table = FrameTable::with_capacity(2);
        table.insert(0x400000, 0x1000000);
        table.insert(0x401000, 0x1001000);
        // Force equal stamps to pin down the tie-break.
        table.entries[0].last_access = 7;
        table.entries[1].last_access = 7;
        assert_eq!(table.lru_victim(), Some(0));
    }
}
