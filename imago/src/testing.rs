//! Shared test doubles: a frame-pool host and a recording executor.
use alloc::boxed::Box;
use alloc::collections::BTreeMap;

use imago_core::addr::PhysAddr;
use imago_core::mem::{MemoryRange, MemoryRanges};
use imago_core::paging::{Frame, PAGE_SIZE};

use crate::host::{
    Executor, HOST_INTERFACE_VERSION, HostError, HostInterface, HostMemory,
};
use crate::image::Image;

const PAGE: usize = PAGE_SIZE as usize;

/// A host backed by a first-fit frame pool and heap page buffers.
///
/// Frames are handed out lowest-address-first so tests are deterministic.
/// Fresh pages are filled with a marker byte unless zeroed allocation is
/// requested, so a missing clear shows up immediately.
pub(crate) struct MockHost {
    pool: MemoryRanges<32>,
    store: BTreeMap<u64, Box<[u8; PAGE]>>,
    total_pages: u64,
    source_limit: PhysAddr,
    destination_limit: PhysAddr,
    control_limit: PhysAddr,
    high_threshold: Option<PhysAddr>,
    fail_after: Option<usize>,
    pub yields: usize,
}

impl MockHost {
    pub fn new(base: u64, pages: u64) -> Self {
        assert!(base % PAGE_SIZE == 0);
        let mut pool = MemoryRanges::new();
        pool.insert(MemoryRange::new(base, base + pages * PAGE_SIZE - 1));
        Self {
            pool,
            store: BTreeMap::new(),
            total_pages: pages,
            source_limit: PhysAddr::new(1 << 48),
            destination_limit: PhysAddr::new(1 << 48),
            control_limit: PhysAddr::new(1 << 48),
            high_threshold: None,
            fail_after: None,
            yields: 0,
        }
    }

    pub fn set_source_limit(&mut self, limit: PhysAddr) {
        self.source_limit = limit;
    }

    pub fn set_control_limit(&mut self, limit: PhysAddr) {
        self.control_limit = limit;
    }

    pub fn set_high_threshold(&mut self, threshold: PhysAddr) {
        self.high_threshold = Some(threshold);
    }

    /// Let the next `budget` allocations succeed, then fail every one.
    pub fn fail_after(&mut self, budget: usize) {
        self.fail_after = Some(budget);
    }

    /// Take a specific frame out of the free pool.
    pub fn carve(&mut self, addr: PhysAddr) {
        let removed = self
            .pool
            .try_remove(MemoryRange::new(addr.as_u64(), addr.as_u64() + PAGE_SIZE - 1));
        assert!(removed.is_some(), "frame not free");
    }

    /// Put a specific frame back into the free pool.
    pub fn restore(&mut self, addr: PhysAddr) {
        self.pool
            .insert(MemoryRange::new(addr.as_u64(), addr.as_u64() + PAGE_SIZE - 1));
    }

    /// Number of frames allocated and not yet released.
    pub fn outstanding(&self) -> usize {
        self.store.len()
    }

    pub fn owns(&self, frame: Frame) -> bool {
        self.store.contains_key(&frame.start_address().as_u64())
    }

    fn lowest_free(&self) -> Option<u64> {
        self.pool
            .entries()
            .iter()
            .map(MemoryRange::start)
            .min()
    }
}

impl HostMemory for MockHost {
    fn allocate(&mut self, zeroed: bool) -> Option<Frame> {
        if let Some(budget) = self.fail_after {
            if budget == 0 {
                return None;
            }
            self.fail_after = Some(budget - 1);
        }

        let addr = self.lowest_free()?;
        self.pool
            .try_remove(MemoryRange::new(addr, addr + PAGE_SIZE - 1))
            .expect("pool entry vanished");

        let fill = if zeroed { 0x00 } else { 0x5A };
        self.store.insert(addr, Box::new([fill; PAGE]));
        Some(Frame::from_start_address(PhysAddr::new(addr)).unwrap())
    }

    fn release(&mut self, frame: Frame) {
        let addr = frame.start_address().as_u64();
        let removed = self.store.remove(&addr);
        assert!(removed.is_some(), "double free at {addr:#x}");
        self.pool
            .insert(MemoryRange::new(addr, addr + PAGE_SIZE - 1));
    }

    fn frame_mut(&mut self, frame: Frame) -> &mut [u8; PAGE] {
        self.store
            .get_mut(&frame.start_address().as_u64())
            .expect("access to unowned frame")
    }

    fn copy_frame(&mut self, dst: Frame, src: Frame) {
        let data: [u8; PAGE] = **self
            .store
            .get(&src.start_address().as_u64())
            .expect("copy from unowned frame");
        **self
            .store
            .get_mut(&dst.start_address().as_u64())
            .expect("copy to unowned frame") = data;
    }

    fn total_pages(&self) -> u64 {
        self.total_pages
    }

    fn source_limit(&self) -> PhysAddr {
        self.source_limit
    }

    fn destination_limit(&self) -> PhysAddr {
        self.destination_limit
    }

    fn control_limit(&self) -> PhysAddr {
        self.control_limit
    }

    fn is_high(&self, frame: Frame) -> bool {
        self.high_threshold
            .is_some_and(|threshold| frame.start_address() >= threshold)
    }

    fn yield_now(&mut self) {
        self.yields += 1;
    }
}

/// Records protocol callbacks; never actually jumps.
pub(crate) struct MockExecutor {
    pub refuse_prepare: bool,
    pub cleanups: usize,
    quiesced: bool,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self {
            refuse_prepare: false,
            cleanups: 0,
            quiesced: false,
        }
    }
}

impl Executor for MockExecutor {
    fn prepare(&mut self, _image: &Image) -> Result<(), HostError> {
        if self.refuse_prepare {
            Err(HostError::NotQuiescible)
        } else {
            Ok(())
        }
    }

    fn cleanup(&mut self, _image: &Image) {
        self.cleanups += 1;
    }

    fn quiesce(&mut self) {
        self.quiesced = true;
    }

    fn is_quiesced(&self) -> bool {
        self.quiesced
    }

    fn flush(&mut self, _image: &Image) {}

    fn jump(&mut self, _image: &Image) -> ! {
        panic!("the handoff is never taken under test");
    }
}

pub(crate) fn interface(host: MockHost) -> HostInterface<MockHost, MockExecutor> {
    HostInterface::bind(HOST_INTERFACE_VERSION, host, MockExecutor::new()).unwrap()
}
