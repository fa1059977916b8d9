//! Relocation plan entries.
//!
//! The plan handed to the executor is a sequence of native machine words,
//! each carrying a page-aligned physical address in its high bits and a tag
//! in its low bits. The sequence lives inside ordinary pages chained by
//! `Indirection` entries and ends with a single `Done` entry. The executor
//! walks it with nothing but physical address arithmetic, so this encoding
//! is an interchange format and must not change.
use crate::addr::PhysAddr;
use crate::paging::PAGE_SIZE;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;

/// Number of entry words that fit in one page.
pub const ENTRIES_PER_PAGE: usize = PAGE_SIZE as usize / size_of::<u64>();

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum EntryError {
    #[error("entry address is not page-aligned")]
    UnalignedAddress,
    #[error("unknown entry tag")]
    BadTag,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u64)]
/// Wire values of the entry tag bits.
pub enum Tag {
    Destination = 0x1,
    Indirection = 0x2,
    Done = 0x4,
    Source = 0x8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// One decoded relocation plan entry.
pub enum Entry {
    /// Moves the running destination cursor to the given address.
    Destination(PhysAddr),
    /// One staged page; copied to the cursor, which then advances one page.
    Source(PhysAddr),
    /// Continues the sequence in another page of entries.
    Indirection(PhysAddr),
    /// Terminates the sequence. Its address bits are unused and packed as
    /// zero.
    Done,
}

impl Entry {
    const TAG_MASK: u64 = 0xF;
    const ADDRESS_MASK: u64 = !(PAGE_SIZE - 1);

    #[must_use]
    #[inline]
    pub const fn tag(self) -> Tag {
        match self {
            Self::Destination(_) => Tag::Destination,
            Self::Source(_) => Tag::Source,
            Self::Indirection(_) => Tag::Indirection,
            Self::Done => Tag::Done,
        }
    }

    #[must_use]
    #[inline]
    pub const fn address(self) -> Option<PhysAddr> {
        match self {
            Self::Destination(addr) | Self::Source(addr) | Self::Indirection(addr) => Some(addr),
            Self::Done => None,
        }
    }

    /// Pack the entry into its wire word.
    ///
    /// A non-aligned address is a caller bug and is rejected, never
    /// silently truncated.
    pub fn pack(self) -> Result<u64, EntryError> {
        let addr = match self.address() {
            Some(addr) => addr.as_u64(),
            None => 0,
        };
        if addr & !Self::ADDRESS_MASK != 0 {
            return Err(EntryError::UnalignedAddress);
        }
        Ok(addr | u64::from(self.tag()))
    }

    /// Decode a wire word.
    pub fn unpack(word: u64) -> Result<Self, EntryError> {
        let tag = Tag::try_from(word & Self::TAG_MASK).map_err(|_| EntryError::BadTag)?;
        let addr_bits = word & !Self::TAG_MASK;
        if addr_bits & !Self::ADDRESS_MASK != 0 {
            return Err(EntryError::UnalignedAddress);
        }
        let addr = PhysAddr::new(addr_bits);
        Ok(match tag {
            Tag::Destination => Self::Destination(addr),
            Tag::Source => Self::Source(addr),
            Tag::Indirection => Self::Indirection(addr),
            Tag::Done => Self::Done,
        })
    }
}

// The tag bits must fit below the page alignment of the address bits.
crate::static_assert!(Entry::TAG_MASK < PAGE_SIZE);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack() {
        assert_eq!(
            Entry::Destination(PhysAddr::new(0x1000)).pack(),
            Ok(0x1001)
        );
        assert_eq!(Entry::Source(PhysAddr::new(0x2000)).pack(), Ok(0x2008));
        assert_eq!(
            Entry::Indirection(PhysAddr::new(0x3000)).pack(),
            Ok(0x3002)
        );
        assert_eq!(Entry::Done.pack(), Ok(0x4));
    }

    #[test]
    fn test_pack_unaligned() {
        assert_eq!(
            Entry::Source(PhysAddr::new(0x2010)).pack(),
            Err(EntryError::UnalignedAddress)
        );
    }

    #[test]
    fn test_unpack() {
        for entry in [
            Entry::Destination(PhysAddr::new(0x1000)),
            Entry::Source(PhysAddr::new(0xFFFF_F000)),
            Entry::Indirection(PhysAddr::new(0)),
            Entry::Done,
        ] {
            assert_eq!(Entry::unpack(entry.pack().unwrap()), Ok(entry));
        }
    }

    #[test]
    fn test_accessors() {
        let entry = Entry::Source(PhysAddr::new(0x2000));
        assert_eq!(entry.tag(), Tag::Source);
        assert_eq!(entry.address(), Some(PhysAddr::new(0x2000)));
        assert_eq!(Entry::Done.address(), None);
    }

    #[test]
    fn test_unpack_rejects() {
        // No tag bit at all
        assert_eq!(Entry::unpack(0x1000), Err(EntryError::BadTag));
        // Two tag bits at once
        assert_eq!(Entry::unpack(0x1000 | 0x9), Err(EntryError::BadTag));
        // Stray bits between the tag and the page alignment
        assert_eq!(
            Entry::unpack(0x1000 | 0x10 | 0x1),
            Err(EntryError::UnalignedAddress)
        );
    }

    #[test]
    fn test_geometry() {
        assert_eq!(ENTRIES_PER_PAGE, 512);
    }
}
