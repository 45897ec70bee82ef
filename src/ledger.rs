//! The single-threaded page provider. Where [`crate::PagePool`] pre-reserves
//! everything up front, a [`PageLedger`] maps pages straight from the OS on
//! every request and keeps a record of what is outstanding in a chain of
//! [`RangeMap`]s, each of which occupies one page of its own:
//!
//! ```text
//!  head
//!   |      +----------+      +----------+
//!   +----> | RangeMap | ---> | RangeMap | ---> None
//!          +----------+      +----------+
//!            tracked           tracked
//!            ranges            ranges
//! ```
//!
//! When the head map fills up, the ledger maps one more page, lays a fresh
//! map over it and chains the old head behind it. Releases walk the chain
//! and remove the range by its base address; a pointer no map knows about
//! was never provided by this ledger.

use std::{cell::Cell, ptr::NonNull};

use log::{error, trace};

use crate::{
    error::{Error, Result},
    map::RangeMap,
    platform::{self, PAGE_SIZE},
    range::{VirtualAddressRange, MAX_PAGE_COUNT},
    traits::Provider,
    Pointer,
};

/// Single-threaded provider of page-aligned blocks, mapped on demand and
/// tracked in embedded maps. Supports multi-page contiguous ranges, unlike
/// the concurrent pool.
///
/// Not `Sync`: all bookkeeping lives in [`Cell`]s and every call assumes
/// exclusive access for its duration.
///
/// # Examples
///
/// ```
/// use stratalloc::{PageLedger, Provider};
///
/// let ledger = PageLedger::new();
///
/// let block = ledger.provide(1).unwrap();
/// unsafe {
///     block.as_ptr().write(7);
///     ledger.release(block).unwrap();
/// }
/// ```
pub struct PageLedger {
    head: Cell<Pointer<RangeMap>>,
}

impl PageLedger {
    pub const fn new() -> Self {
        Self {
            head: Cell::new(None),
        }
    }

    /// Guarantees the head map has a free slot, chaining a freshly mapped
    /// map block in front if necessary.
    fn ensure_headroom(&self) -> Result<()> {
        if let Some(head) = self.head.get() {
            if !unsafe { head.as_ref() }.is_full() {
                return Ok(());
            }
        }

        let range = platform::fetch_pages(1).map_err(Error::from)?;
        let mut map = unsafe { RangeMap::place(range.base_unchecked()) };
        unsafe { map.as_mut() }.set_next(self.head.get());
        self.head.set(Some(map));

        trace!("ledger chained a new map block");
        Ok(())
    }
}

impl Provider for PageLedger {
    fn provide(&self, count: usize) -> Result<NonNull<u8>> {
        if count == 0 || count > MAX_PAGE_COUNT {
            return Err(Error::InvalidInput);
        }

        self.ensure_headroom()?;

        let range = platform::fetch_pages(count).map_err(Error::from)?;

        let Some(mut head) = self.head.get() else {
            return Err(Error::Internal);
        };
        if !unsafe { head.as_mut() }.insert(range) {
            // ensure_headroom just made room, a full head here is a bug.
            return Err(Error::Internal);
        }

        Ok(unsafe { range.base_unchecked() })
    }

    unsafe fn release(&self, ptr: NonNull<u8>) -> Result<()> {
        let address = ptr.as_ptr() as usize;

        let mut current = self.head.get();
        while let Some(mut map) = current {
            if let Some(range) = map.as_mut().take(address) {
                return platform::return_pages(range).map_err(|failure| {
                    error!("ledger failed to return pages: {failure}");
                    Error::from(failure)
                });
            }

            current = map.as_ref().next();
        }

        Err(Error::InvalidInput)
    }

    fn block_size(&self) -> usize {
        PAGE_SIZE
    }
}

impl Default for PageLedger {
    fn default() -> Self {
        Self::new()
    }
}

/// Dropping the ledger returns every outstanding range to the OS, then the
/// map blocks themselves.
impl Drop for PageLedger {
    fn drop(&mut self) {
        let mut current = self.head.get();

        while let Some(map) = current {
            unsafe {
                if !map.as_ref().is_empty() {
                    trace!("ledger draining {} outstanding ranges", map.as_ref().len());
                }
                for range in map.as_ref().ranges() {
                    if let Err(failure) = platform::return_pages(range) {
                        error!("ledger failed to drain a range: {failure}");
                    }
                }

                current = map.as_ref().next();

                let map_block = VirtualAddressRange::new(map.cast::<u8>(), 1);
                if let Err(failure) = platform::return_pages(map_block) {
                    error!("ledger failed to unmap a map block: {failure}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::MAP_CAPACITY;

    #[test]
    fn block_size_is_the_page_size() {
        let ledger = PageLedger::new();
        assert_eq!(ledger.block_size(), PAGE_SIZE);
    }

    #[test]
    fn rejects_malformed_counts() {
        let ledger = PageLedger::new();

        assert_eq!(ledger.provide(0), Err(Error::InvalidInput));
        assert_eq!(ledger.provide(MAX_PAGE_COUNT + 1), Err(Error::InvalidInput));
    }

    #[test]
    fn provide_and_release_round_trips() {
        let ledger = PageLedger::new();

        let block = ledger.provide(1).unwrap();
        assert_eq!(block.as_ptr() as usize % PAGE_SIZE, 0);

        unsafe {
            block.as_ptr().write(0xEE);
            assert_eq!(block.as_ptr().read(), 0xEE);
            ledger.release(block).unwrap();
        }
    }

    #[test]
    fn multi_page_ranges_are_tracked_as_one_unit() {
        let ledger = PageLedger::new();

        let block = ledger.provide(3).unwrap();
        unsafe {
            // Writable across all three pages.
            block.as_ptr().write(1);
            block.as_ptr().add(3 * PAGE_SIZE - 1).write(2);

            ledger.release(block).unwrap();
        }
    }

    #[test]
    fn unknown_pointers_are_rejected() {
        let ledger = PageLedger::new();
        let _block = ledger.provide(1).unwrap();

        let mut local = 0u8;
        unsafe {
            let foreign = NonNull::new(&mut local as *mut u8).unwrap();
            assert_eq!(ledger.release(foreign), Err(Error::InvalidInput));
        }
    }

    #[test]
    fn released_pointers_are_forgotten() {
        let ledger = PageLedger::new();
        let block = ledger.provide(1).unwrap();

        unsafe {
            ledger.release(block).unwrap();
            assert_eq!(ledger.release(block), Err(Error::InvalidInput));
        }
    }

    /// Overflow the head map so the ledger has to chain a second one, then
    /// release everything through the chain.
    #[test]
    fn chains_maps_beyond_one_block_of_bookkeeping() {
        let ledger = PageLedger::new();
        let count = if cfg!(miri) { 8 } else { MAP_CAPACITY + 10 };

        let blocks: Vec<_> = (0..count).map(|_| ledger.provide(1).unwrap()).collect();

        for block in blocks {
            unsafe { ledger.release(block).unwrap() };
        }
    }

    /// The drop impl drains outstanding ranges; under Miri this is what
    /// proves nothing leaks when callers forget to release.
    #[test]
    fn drop_returns_outstanding_ranges() {
        let ledger = PageLedger::new();

        for _ in 0..5 {
            ledger.provide(1).unwrap();
        }

        drop(ledger);
    }
}
