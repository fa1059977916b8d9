//! Memory layout requests and their validation.
use imago_core::addr::PhysAddr;
use imago_core::mem::MemoryRange;
use imago_core::paging::PAGE_SIZE;
use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum LayoutError {
    #[error("destination window is malformed or out of range")]
    BadAddress,
    #[error("destination windows overlap")]
    Overlap,
    #[error("source buffer larger than its destination window")]
    OversizedBuffer,
    #[error("image would consume more than half of memory")]
    OverBudget,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SourceError {
    #[error("source buffer is inaccessible")]
    Fault,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Where segment content came from.
pub enum Provenance {
    /// Buffers handed in from user space; reads can fault.
    UserSourced,
    /// Buffers already resident in kernel memory.
    FileSourced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// One contiguous destination window and the size of its content.
///
/// The content bytes themselves are supplied through a [`SourceBuffer`]
/// when the segment is loaded.
pub struct Segment {
    /// Page-aligned start of the destination window.
    pub dest_addr: PhysAddr,
    /// Size of the destination window in bytes.
    pub dest_len: u64,
    /// Size of the content; the window past it is zero-filled.
    pub source_len: u64,
}

impl Segment {
    #[must_use]
    #[inline]
    pub const fn new(dest_addr: PhysAddr, dest_len: u64, source_len: u64) -> Self {
        Self {
            dest_addr,
            dest_len,
            source_len,
        }
    }

    #[must_use]
    #[inline]
    /// The destination window as an inclusive range.
    pub fn window(&self) -> MemoryRange {
        debug_assert!(self.dest_len > 0);
        MemoryRange::new(
            self.dest_addr.as_u64(),
            self.dest_addr.as_u64() + self.dest_len - 1,
        )
    }

    #[must_use]
    #[inline]
    pub const fn page_count(&self) -> u64 {
        self.dest_len.div_ceil(PAGE_SIZE)
    }
}

/// Reject a layout before any page is touched.
///
/// All segments must pass every check; on failure nothing has been
/// allocated and the specific cause is reported.
pub fn validate(
    segments: &[Segment],
    total_pages: u64,
    dest_limit: PhysAddr,
) -> Result<(), LayoutError> {
    // Destination addresses must be page-granular: accepting unaligned
    // windows silently turns into overlapping ones once rounded.
    for segment in segments {
        let start = segment.dest_addr.as_u64();
        let Some(end) = start.checked_add(segment.dest_len) else {
            return Err(LayoutError::BadAddress);
        };
        if segment.dest_len == 0
            || start % PAGE_SIZE != 0
            || end % PAGE_SIZE != 0
            || end >= dest_limit.as_u64()
        {
            return Err(LayoutError::BadAddress);
        }
    }

    // Destination windows must not overlap, or one segment silently
    // clobbers another during the replay.
    for (i, segment) in segments.iter().enumerate() {
        for other in &segments[..i] {
            if segment.window().overlaps(&other.window()).is_some() {
                return Err(LayoutError::Overlap);
            }
        }
    }

    for segment in segments {
        if segment.source_len > segment.dest_len {
            return Err(LayoutError::OversizedBuffer);
        }
    }

    // Staging doubles the image's footprint while it is in flight; past
    // half of memory the allocator can stall for a very long time before
    // failing.
    let budget = total_pages / 2;
    let mut total: u64 = 0;
    for segment in segments {
        let pages = segment.page_count();
        if pages > budget {
            return Err(LayoutError::OverBudget);
        }
        total = total.checked_add(pages).ok_or(LayoutError::OverBudget)?;
    }
    if total > budget {
        return Err(LayoutError::OverBudget);
    }

    Ok(())
}

/// Segment content supplier.
///
/// Reads are fallible: user-space buffers can become inaccessible while a
/// load is in flight.
pub trait SourceBuffer {
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fill `dst` with the bytes starting at `offset`.
    fn read_at(&self, offset: u64, dst: &mut [u8]) -> Result<(), SourceError>;
}

impl SourceBuffer for [u8] {
    fn len(&self) -> u64 {
        u64::try_from(<[u8]>::len(self)).unwrap()
    }

    fn read_at(&self, offset: u64, dst: &mut [u8]) -> Result<(), SourceError> {
        let offset = usize::try_from(offset).map_err(|_| SourceError::Fault)?;
        let end = offset.checked_add(dst.len()).ok_or(SourceError::Fault)?;
        let src = self.get(offset..end).ok_or(SourceError::Fault)?;
        dst.copy_from_slice(src);
        Ok(())
    }
}
