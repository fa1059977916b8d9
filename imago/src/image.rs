//! Construction of the relocation plan.
//!
//! An [`Image`] aggregates everything a load request produces: the segment
//! table, the entry pages describing the plan, and the ownership lists for
//! every frame acquired along the way. Entries accumulate in an in-memory
//! arena of fixed-capacity pages, each backed by the frame it will be
//! exported to; [`Image::finalize`] writes the packed wire form into those
//! frames and computes the head word handed to the executor.
use alloc::vec::Vec;

use imago_core::addr::PhysAddr;
use imago_core::entry::{ENTRIES_PER_PAGE, Entry, EntryError};
use imago_core::mem::MemoryRange;
use imago_core::paging::{Frame, PAGE_SIZE};
use thiserror::Error;

use crate::host::{Executor, HostMemory};
use crate::segment::{LayoutError, Provenance, Segment, SourceBuffer, SourceError, validate};

pub mod page_alloc;

use page_alloc::AllocPolicy;

/// Payload capacity of one entry page. The last word of each page is
/// reserved for the chain to the next page or the terminator.
const PAYLOAD_SLOTS: usize = ENTRIES_PER_PAGE - 1;

const WORD: usize = size_of::<u64>();

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum LoadError {
    #[error("invalid memory layout: {0}")]
    Layout(LayoutError),
    #[error("host allocator exhausted")]
    Exhausted,
    #[error("source buffer fault: {0}")]
    Source(SourceError),
    #[error("malformed entry: {0}")]
    Entry(EntryError),
    #[error("image is already sealed")]
    Sealed,
}

impl From<LayoutError> for LoadError {
    fn from(error: LayoutError) -> Self {
        Self::Layout(error)
    }
}

impl From<SourceError> for LoadError {
    fn from(error: SourceError) -> Self {
        Self::Source(error)
    }
}

impl From<EntryError> for LoadError {
    fn from(error: EntryError) -> Self {
        Self::Entry(error)
    }
}

#[derive(Debug)]
/// One page of the plan: its backing frame and the decoded entries that
/// will be packed into it.
struct EntryPage {
    frame: Frame,
    entries: Vec<Entry>,
}

impl EntryPage {
    fn new(frame: Frame) -> Self {
        Self {
            frame,
            entries: Vec::new(),
        }
    }

    fn is_full(&self) -> bool {
        self.entries.len() == PAYLOAD_SLOTS
    }
}

#[derive(Debug)]
/// A replacement program image under construction or staged for handoff.
pub struct Image {
    segments: Vec<Segment>,
    provenance: Provenance,
    /// Entry point of the replacement program.
    start: PhysAddr,
    /// The entry-page arena, in chain order.
    pages: Vec<EntryPage>,
    /// Frames that landed on someone's destination, parked for reuse.
    dest_cache: Vec<Frame>,
    /// Frames past the source addressing limit, parked until teardown.
    unusable: Vec<Frame>,
    /// Frames owned by the image itself, never relocated.
    control: Vec<Frame>,
    /// The distinguished page holding the transition code.
    control_code: Option<Frame>,
    terminated: bool,
    /// Packed head word, present once finalized.
    head: Option<u64>,
}

impl Image {
    /// Validate the layout and create an empty image.
    ///
    /// Nothing is allocated if validation fails. On success the image owns
    /// its control code page.
    pub fn new<M: HostMemory>(
        host: &mut M,
        start: PhysAddr,
        provenance: Provenance,
        segments: Vec<Segment>,
    ) -> Result<Self, LoadError> {
        validate(&segments, host.total_pages(), host.destination_limit())?;

        let mut image = Self {
            segments,
            provenance,
            start,
            pages: Vec::new(),
            dest_cache: Vec::new(),
            unusable: Vec::new(),
            control: Vec::new(),
            control_code: None,
            terminated: false,
            head: None,
        };
        let frame = page_alloc::acquire_control_page(&mut image, host)?;
        image.control_code = Some(frame);
        Ok(image)
    }

    #[must_use]
    #[inline]
    pub const fn start(&self) -> PhysAddr {
        self.start
    }

    #[must_use]
    #[inline]
    pub const fn provenance(&self) -> Provenance {
        self.provenance
    }

    #[must_use]
    #[inline]
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    #[must_use]
    #[inline]
    pub const fn control_code(&self) -> Option<Frame> {
        self.control_code
    }

    #[must_use]
    #[inline]
    /// The packed head word, once the image has been finalized.
    pub const fn head(&self) -> Option<u64> {
        self.head
    }

    #[must_use]
    #[inline]
    pub const fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Whether any byte of `range` lies inside a destination window.
    pub(crate) fn is_destination(&self, range: MemoryRange) -> bool {
        self.segments
            .iter()
            .any(|segment| segment.window().overlaps(&range).is_some())
    }

    /// Append one entry, growing the arena by a fresh page when the
    /// current one is out of payload slots.
    pub fn append_entry<M: HostMemory>(
        &mut self,
        host: &mut M,
        entry: Entry,
    ) -> Result<(), LoadError> {
        if self.terminated {
            return Err(LoadError::Sealed);
        }

        if self.pages.last().is_none_or(EntryPage::is_full) {
            let frame = page_alloc::acquire_page(self, host, AllocPolicy::KERNEL, None)?;
            self.pages.push(EntryPage::new(frame));
        }
        // The last page exists and has a free slot at this point.
        if let Some(page) = self.pages.last_mut() {
            page.entries.push(entry);
        }
        Ok(())
    }

    /// Record the destination cursor for the source pages that follow.
    pub fn set_destination<M: HostMemory>(
        &mut self,
        host: &mut M,
        addr: PhysAddr,
    ) -> Result<(), LoadError> {
        self.append_entry(host, Entry::Destination(addr.align_down(PAGE_SIZE)))
    }

    /// Record one staged source page; the cursor advances one page.
    pub fn add_source<M: HostMemory>(
        &mut self,
        host: &mut M,
        addr: PhysAddr,
    ) -> Result<(), LoadError> {
        self.append_entry(host, Entry::Source(addr.align_down(PAGE_SIZE)))
    }

    /// Stage the content of segment `index` into freshly acquired pages.
    ///
    /// Bytes past `source_len` are zero-filled up to the end of the
    /// destination window. On failure every page acquired so far stays
    /// owned by the image; release it with [`Image::release`].
    ///
    /// # Panics
    ///
    /// Panics if `index` is not a segment of this image.
    pub fn load_segment<M: HostMemory, S: SourceBuffer + ?Sized>(
        &mut self,
        host: &mut M,
        index: usize,
        source: &S,
    ) -> Result<(), LoadError> {
        let segment = self.segments[index];

        let mut dest = segment.dest_addr;
        let mut remaining = segment.dest_len;
        let mut src_left = segment.source_len;
        let mut src_off: u64 = 0;

        self.set_destination(host, dest)?;

        while remaining > 0 {
            let frame =
                page_alloc::acquire_page(self, host, AllocPolicy::USER, Some(dest.align_down(PAGE_SIZE)))?;
            self.add_source(host, frame.start_address())?;

            let page_off = usize::try_from(dest.as_u64() % PAGE_SIZE).unwrap();
            let dchunk = remaining.min(PAGE_SIZE - page_off as u64);
            let schunk = src_left.min(dchunk);

            // Start from a clear page so the window past the content ends
            // up zero-filled.
            let buf = host.frame_mut(frame);
            buf.fill(0);
            if schunk > 0 {
                let end = page_off + usize::try_from(schunk).unwrap();
                source.read_at(src_off, &mut buf[page_off..end])?;
            }

            src_left -= schunk;
            src_off += schunk;
            dest = dest + dchunk;
            remaining -= dchunk;

            host.yield_now();
        }

        Ok(())
    }

    /// Seal the entry list; the final DONE entry is emitted at export.
    pub fn terminate(&mut self) {
        self.terminated = true;
    }

    /// Decoded entries in plan order, ending with DONE once terminated.
    ///
    /// The iterator is restartable and follows the page chain lazily.
    #[must_use]
    pub const fn entries(&self) -> Entries<'_> {
        Entries {
            image: self,
            page: 0,
            slot: 0,
            done: false,
        }
    }

    /// Position and current frame of the SOURCE entry already scheduled to
    /// land on `addr`, found by replaying the list with a running
    /// destination cursor.
    pub(crate) fn find_source_for(&self, addr: PhysAddr) -> Option<(usize, usize, Frame)> {
        let mut cursor = PhysAddr::new(0);
        for (page_index, page) in self.pages.iter().enumerate() {
            for (slot, entry) in page.entries.iter().enumerate() {
                match *entry {
                    Entry::Destination(dest) => cursor = dest,
                    Entry::Source(source) => {
                        if addr == cursor {
                            return Some((page_index, slot, Frame::containing_address(source)));
                        }
                        cursor = cursor + PAGE_SIZE;
                    }
                    Entry::Indirection(_) | Entry::Done => {}
                }
            }
        }
        None
    }

    pub(crate) fn rewrite_source(&mut self, page_index: usize, slot: usize, frame: Frame) {
        self.pages[page_index].entries[slot] = Entry::Source(frame.start_address());
    }

    pub(crate) fn park_destination(&mut self, frame: Frame) {
        self.dest_cache.push(frame);
    }

    pub(crate) fn take_parked_destination(&mut self, addr: PhysAddr) -> Option<Frame> {
        let index = self
            .dest_cache
            .iter()
            .position(|frame| frame.start_address() == addr)?;
        Some(self.dest_cache.swap_remove(index))
    }

    pub(crate) fn park_unusable(&mut self, frame: Frame) {
        self.unusable.push(frame);
    }

    pub(crate) fn add_control(&mut self, frame: Frame) {
        self.control.push(frame);
    }

    /// Export the packed plan into the entry pages and compute the head
    /// word. Seals the image if [`Image::terminate`] was not called yet.
    pub fn finalize<M: HostMemory>(&mut self, host: &mut M) -> Result<(), LoadError> {
        if self.head.is_some() {
            return Err(LoadError::Sealed);
        }
        self.terminate();

        for index in 0..self.pages.len() {
            let frame = self.pages[index].frame;
            let next = self.pages.get(index + 1).map(|page| page.frame);

            let buf = host.frame_mut(frame);
            buf.fill(0);

            let mut slot = 0;
            for entry in &self.pages[index].entries {
                let word = entry.pack()?;
                buf[slot * WORD..][..WORD].copy_from_slice(&word.to_ne_bytes());
                slot += 1;
            }

            // A page is only ever chained once full, so the chain entry
            // always sits in the reserved last slot.
            let tail = match next {
                Some(next) => {
                    debug_assert!(slot == PAYLOAD_SLOTS);
                    Entry::Indirection(next.start_address())
                }
                None => Entry::Done,
            };
            let word = tail.pack()?;
            buf[slot * WORD..][..WORD].copy_from_slice(&word.to_ne_bytes());
        }

        let head = match self.pages.first() {
            Some(page) => Entry::Indirection(page.frame.start_address()),
            None => Entry::Done,
        };
        self.head = Some(head.pack()?);

        log::debug!(
            "image finalized: start {:#x}, {} segment(s), {} entry page(s)",
            self.start.as_u64(),
            self.segments.len(),
            self.pages.len()
        );
        Ok(())
    }

    /// Log a summary of the staged layout.
    pub fn log_info(&self) {
        log::debug!(
            "image: start {:#x}, head {:#x}, {} segment(s)",
            self.start.as_u64(),
            self.head.unwrap_or(0),
            self.segments.len()
        );
        for (index, segment) in self.segments.iter().enumerate() {
            log::debug!(
                "  segment[{index}]: {:#x} - {:#x}, {:#x} bytes, {} page(s)",
                segment.dest_addr.as_u64(),
                segment.dest_addr.as_u64() + segment.dest_len,
                segment.dest_len,
                segment.page_count()
            );
        }
    }

    /// Return every frame the image owns to the host, then drop it.
    pub fn release<M: HostMemory, X: Executor>(mut self, host: &mut M, executor: &mut X) {
        // Extra pages first: parked destination-cache and unusable frames.
        for frame in self.dest_cache.drain(..) {
            host.release(frame);
        }
        for frame in self.unusable.drain(..) {
            host.release(frame);
        }

        // Walk the plan: every staged source page, then the entry page
        // that described it, each exactly once.
        for page in self.pages.drain(..) {
            for entry in &page.entries {
                if let Entry::Source(addr) = *entry {
                    host.release(Frame::containing_address(addr));
                }
            }
            host.release(page.frame);
        }

        // Architecture-specific state goes before its backing pages.
        executor.cleanup(&self);

        for frame in self.control.drain(..) {
            host.release(frame);
        }
        self.control_code = None;
    }
}

/// Lazy view of an image's decoded entries.
pub struct Entries<'a> {
    image: &'a Image,
    page: usize,
    slot: usize,
    done: bool,
}

impl Iterator for Entries<'_> {
    type Item = Entry;

    fn next(&mut self) -> Option<Entry> {
        while let Some(page) = self.image.pages.get(self.page) {
            if self.slot < page.entries.len() {
                let entry = page.entries[self.slot];
                self.slot += 1;
                return Some(entry);
            }
            if !page.is_full() {
                // A partially filled page is always the last one.
                break;
            }
            self.page += 1;
            self.slot = 0;
        }

        if self.image.terminated && !self.done {
            self.done = true;
            return Some(Entry::Done);
        }
        None
    }
}
