//! Host environment capabilities.
//!
//! The staging subsystem owns no memory and performs no architecture work
//! itself: physical pages, linear-map access and the final CPU handoff are
//! supplied by the embedding kernel through the traits below. The
//! capability set is bound once, explicitly and versioned, at integration
//! time; there is no runtime discovery.
use imago_core::addr::PhysAddr;
use imago_core::paging::{Frame, PAGE_SIZE};
use thiserror::Error;

use crate::image::Image;

/// Version of the capability contract this crate was built against.
pub const HOST_INTERFACE_VERSION: u16 = 1;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum HostError {
    #[error("unsupported host interface version")]
    UnsupportedVersion,
    #[error("execution units cannot be quiesced")]
    NotQuiescible,
}

/// Physical page services of the host kernel.
///
/// All frames handed out by [`allocate`](Self::allocate) must be accessible
/// through [`frame_mut`](Self::frame_mut) until they are released.
pub trait HostMemory {
    /// Allocate one frame, optionally zero-filled.
    ///
    /// Returns `None` when physical memory is exhausted.
    fn allocate(&mut self, zeroed: bool) -> Option<Frame>;

    /// Return a frame to the host allocator.
    fn release(&mut self, frame: Frame);

    /// View of the frame's bytes through the host's linear mapping.
    fn frame_mut(&mut self, frame: Frame) -> &mut [u8; PAGE_SIZE as usize];

    /// Copy the full content of `src` into `dst`.
    fn copy_frame(&mut self, dst: Frame, src: Frame);

    /// Number of page frames backing the host.
    fn total_pages(&self) -> u64;

    /// Exclusive upper bound on frames referenced by a SOURCE entry.
    ///
    /// The executor copies source pages with address translation disabled;
    /// frames past this bound cannot be reached from its stub.
    fn source_limit(&self) -> PhysAddr;

    /// Exclusive upper bound on destination windows.
    fn destination_limit(&self) -> PhysAddr;

    /// Exclusive upper bound on the control code page.
    fn control_limit(&self) -> PhysAddr;

    /// Whether the frame lives in high memory, i.e. outside the kernel's
    /// permanent mapping.
    fn is_high(&self, frame: Frame) -> bool;

    /// Cooperative yield point, called between long page copies.
    fn yield_now(&mut self) {}
}

/// Architecture transition collaborator.
///
/// Everything past [`jump`](Self::jump) runs without virtual memory, heap
/// or scheduler; this trait is the boundary behind which that machinery
/// lives.
pub trait Executor {
    /// Gate a load request before any segment is staged.
    fn prepare(&mut self, image: &Image) -> Result<(), HostError>;

    /// Release architecture-specific state attached to the image.
    fn cleanup(&mut self, image: &Image);

    /// Shut down every other execution unit.
    fn quiesce(&mut self);

    /// Whether every other execution unit has stopped.
    fn is_quiesced(&self) -> bool;

    /// Cache and TLB maintenance for the plan and its pages before the
    /// handoff.
    fn flush(&mut self, image: &Image);

    /// The irreversible transition. Receives the finalized image (head
    /// word, control code page, start address) and does not return.
    fn jump(&mut self, image: &Image) -> !;
}

/// Capabilities bound at integration time.
pub struct HostInterface<M: HostMemory, X: Executor> {
    memory: M,
    executor: X,
}

impl<M: HostMemory, X: Executor> HostInterface<M, X> {
    /// Bind the host's capabilities, rejecting a contract mismatch.
    pub fn bind(version: u16, memory: M, executor: X) -> Result<Self, HostError> {
        if version != HOST_INTERFACE_VERSION {
            return Err(HostError::UnsupportedVersion);
        }
        Ok(Self { memory, executor })
    }

    #[inline]
    pub fn memory(&mut self) -> &mut M {
        &mut self.memory
    }

    #[inline]
    pub fn executor(&mut self) -> &mut X {
        &mut self.executor
    }

    #[inline]
    pub(crate) fn parts(&mut self) -> (&mut M, &mut X) {
        (&mut self.memory, &mut self.executor)
    }
}
