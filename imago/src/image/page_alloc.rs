//! Conflict-aware page acquisition.
//!
//! Staging pages must never sit on another segment's destination: the
//! executor copies source pages onto their destinations in list order, so a
//! staging page inside a destination window would be clobbered while its
//! content is still needed. The invariant maintained here is slightly
//! stronger and needs only O(1) bookkeeping per page: a page is either its
//! own destination or not a destination at all.
use alloc::vec::Vec;

use imago_core::addr::PhysAddr;
use imago_core::mem::MemoryRange;
use imago_core::paging::{Frame, PAGE_SIZE};

use super::{Image, LoadError};
use crate::host::HostMemory;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Allocation constraints for one page request.
pub struct AllocPolicy {
    /// Whether a high-memory frame is acceptable to the caller.
    pub allow_high: bool,
}

impl AllocPolicy {
    /// Control and indirection pages: walked by the kernel itself, so they
    /// must stay inside its permanent mapping.
    pub const KERNEL: Self = Self { allow_high: false };
    /// Staging pages: only ever touched through the linear map, any usable
    /// frame will do.
    pub const USER: Self = Self { allow_high: true };
}

fn frame_range(frame: Frame) -> MemoryRange {
    let start = frame.start_address().as_u64();
    MemoryRange::new(start, start + (PAGE_SIZE - 1))
}

/// Acquire one page for `destination`, or for no destination in particular
/// (control and indirection pages).
///
/// Fails only when the host allocator is exhausted; every page fetched
/// along the way stays owned by the image.
pub(crate) fn acquire_page<M: HostMemory>(
    image: &mut Image,
    host: &mut M,
    policy: AllocPolicy,
    destination: Option<PhysAddr>,
) -> Result<Frame, LoadError> {
    // Previously parked pages are reused before any fresh allocation.
    if let Some(dest) = destination {
        if let Some(frame) = image.take_parked_destination(dest) {
            return Ok(frame);
        }
    }

    loop {
        let Some(frame) = host.allocate(false) else {
            return Err(LoadError::Exhausted);
        };
        let addr = frame.start_address();

        // A frame past the source limit can never be referenced by a
        // SOURCE entry; park it so the host does not hand it out again.
        if addr + PAGE_SIZE > host.source_limit() {
            image.park_unusable(frame);
            continue;
        }

        // The frame landed exactly where the caller wants it.
        if destination == Some(addr) {
            return Ok(frame);
        }

        // Outside every destination window the frame is free to use.
        if !image.is_destination(frame_range(frame)) {
            return Ok(frame);
        }

        // The frame sits on some other segment's destination. If a source
        // page is already scheduled to land there, swap: move its content
        // into the fresh frame and adopt the vacated one, which by now can
        // no longer be anyone's destination.
        if let Some((page_index, slot, old)) = image.find_source_for(addr) {
            host.copy_frame(frame, old);
            image.rewrite_source(page_index, slot, frame);

            if !policy.allow_high && host.is_high(old) {
                host.release(old);
                continue;
            }
            return Ok(old);
        }

        // No source page for it yet: park the frame for whoever stages
        // that destination later.
        image.park_destination(frame);
    }
}

/// Acquire the distinguished control code page: one that neither crosses
/// the control addressing limit nor lands inside any destination window.
///
/// Frames picked up along the way are returned to the host immediately;
/// the winner joins the image's control list.
pub(crate) fn acquire_control_page<M: HostMemory>(
    image: &mut Image,
    host: &mut M,
) -> Result<Frame, LoadError> {
    let mut extras: Vec<Frame> = Vec::new();

    let result = loop {
        let Some(frame) = host.allocate(true) else {
            break Err(LoadError::Exhausted);
        };
        let addr = frame.start_address();

        if addr + PAGE_SIZE > host.control_limit() || image.is_destination(frame_range(frame)) {
            extras.push(frame);
            continue;
        }
        break Ok(frame);
    };

    for frame in extras {
        host.release(frame);
    }
    if let Ok(frame) = result {
        image.add_control(frame);
    }
    result
}
