use x86_64::{
    structures::paging::{FrameAllocator, PhysFrame, Size4KiB},
    PhysAddr,
};

const PAGE_SIZE: u64 = 4096;

/// One-way physical frame allocator. The watermark only ever advances;
/// evicted frames are not returned to the pool.
pub struct BumpFrameAllocator {
    next_free_frame: PhysFrame,
    limit: PhysFrame,
}

impl BumpFrameAllocator {
    /// Empty until init(); allocate_frame fails on an uninitialized pool.
    pub fn new() -> Self {
        BumpFrameAllocator {
            next_free_frame: PhysFrame::containing_address(PhysAddr::new(0)),
            limit: PhysFrame::containing_address(PhysAddr::new(0)),
        }
    }

    /// Hand the allocator its physical region. `start` and `end` must be
    /// page-aligned and identity mapped.
    pub unsafe fn init(&mut self, start: PhysAddr, end: PhysAddr) {
        self.next_free_frame = PhysFrame::containing_address(start);
        self.limit = PhysFrame::containing_address(end);
    }

    /// Current watermark, for diagnostics.
    pub fn watermark(&self) -> PhysAddr {
        self.next_free_frame.start_address()
    }

    /// Allocate a frame and clear it. Page tables and freshly demand-paged
    /// user memory both require zeroed frames.
    pub fn allocate_zeroed_frame(&mut self) -> Option<PhysFrame> {
        let frame = self.allocate_frame()?;
        unsafe {
            // Frames below 1 GiB are identity mapped by the boot tables.
            core::ptr::write_bytes(
                frame.start_address().as_u64() as *mut u8,
                0,
                PAGE_SIZE as usize,
            );
        }
        Some(frame)
    }
}

unsafe impl FrameAllocator<Size4KiB> for BumpFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        if self.next_free_frame < self.limit {
            let frame = self.next_free_frame;
            self.next_free_frame += 1;
            Some(frame)
        } else {
            None
        }
    }
}
