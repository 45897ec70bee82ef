//! The free-list strategy. A [`FreeList`] lazily borrows a single block from
//! its provider and keeps the unallocated regions inside it on an intrusive,
//! address-ordered list of [`BlockHeader`]s. Finds search the list with the
//! configured fit policy and split the winner; releases splice the region
//! back in address order and coalesce physical neighbors, so fragmentation
//! heals as allocations come back:
//!
//! ```text
//!  block                          free
//!   |                              |
//!   v                              v
//! +--------+---------+--------+---------+--------+---------+
//! | header |  alloc  | header |  free   | header |  alloc  |
//! +--------+---------+--------+----|----+--------+---------+
//!                                  +--> next free region or None
//! ```
//!
//! The block header at the very start spans the whole block and is never on
//! the free list; the first free region begins one header past it. When a
//! release leaves the free list spanning the entire block again, the block
//! itself goes back to the provider and the allocator returns to its
//! pristine, lazily-initialized state.

use std::{alloc::Layout, cell::Cell, ptr::NonNull};

use log::{error, trace};

use crate::{
    align::{self, align_down, align_up},
    config::{FreeListConfig, Search, SizePolicy},
    error::{Error, Failure, Result},
    header::{self, BlockHeader, HeaderPair, BLOCK_HEADER_SIZE},
    traits::{Provider, Strategy},
    Pointer,
};

/// Split/coalesce allocator with per-allocation release and a pluggable fit
/// policy. Single-threaded: all bookkeeping lives in [`Cell`]s, so the type
/// is not `Sync` and every call assumes exclusive access.
///
/// # Examples
///
/// ```
/// use stratalloc::{FreeList, PageLedger, Strategy};
///
/// let freelist = FreeList::new(PageLedger::new());
///
/// let ptr = freelist.find_sized(128).unwrap();
/// unsafe {
///     ptr.as_ptr().write(1);
///     freelist.release(ptr).unwrap();
/// }
/// ```
pub struct FreeList<P: Provider> {
    provider: P,
    config: FreeListConfig,
    /// The provider block currently backing the allocator.
    block: Cell<Pointer<BlockHeader>>,
    /// First free region inside the block, in ascending address order.
    free: Cell<Pointer<BlockHeader>>,
}

impl<P: Provider> FreeList<P> {
    pub fn new(provider: P) -> Self {
        Self::with_config(provider, FreeListConfig::default())
    }

    pub fn with_config(provider: P, config: FreeListConfig) -> Self {
        Self {
            provider,
            config,
            block: Cell::new(None),
            free: Cell::new(None),
        }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Real footprint of the backing block once the header and alignment are
    /// accounted for. This is also the largest request the allocator can
    /// ever satisfy.
    fn aligned_size(&self) -> usize {
        match self.config.size_policy {
            SizePolicy::HaveAtLeastSizeBytes => {
                align_up(self.config.size + BLOCK_HEADER_SIZE, self.config.alignment)
            }
            SizePolicy::NoMoreThanSizeBytes => align_down(self.config.size, self.config.alignment),
        }
    }

    /// Borrows a block from the provider and lays out the initial state: a
    /// block header spanning the aligned size, and the free-list head one
    /// header in, owning everything that's left.
    fn init_block_if_unset(&self) -> Result<()> {
        if self.block.get().is_some() {
            return Ok(());
        }

        let aligned_size = self.aligned_size();
        if aligned_size <= BLOCK_HEADER_SIZE || aligned_size > self.provider.block_size() {
            // The configuration can never be satisfied by this provider.
            return Err(Error::Internal);
        }

        let base = self.provider.provide(1)?;

        unsafe {
            let block = BlockHeader::create(base, aligned_size, None);
            let head = BlockHeader::create(
                BlockHeader::content_address_of(block),
                aligned_size - BLOCK_HEADER_SIZE,
                None,
            );

            self.block.set(Some(block));
            self.free.set(Some(head));
        }

        trace!("free list borrowed a {aligned_size} byte block");
        Ok(())
    }

    fn search(&self, minimum_size: usize) -> Result<Option<HeaderPair>> {
        let head = self.free.get();

        let found = unsafe {
            match self.config.search {
                Search::FirstFit => header::find_first_fit(head, minimum_size),
                Search::BestFit => header::find_best_fit(head, minimum_size),
                Search::WorstFit => header::find_worst_fit(head, minimum_size),
            }
        };

        found.map_err(Error::from)
    }

    /// Hands the backing block back to the provider and returns the
    /// allocator to its pristine state.
    fn release_backing_block(&self, block: NonNull<BlockHeader>) -> Result<()> {
        let release = |bytes: NonNull<u8>| {
            unsafe { self.provider.release(bytes) }.map_err(|err| {
                error!("provider refused the block back: {err}");
                Failure::ReleaseFailed
            })
        };

        unsafe { header::release_list(Some(block), release, None) }.map_err(Error::from)?;

        self.block.set(None);
        self.free.set(None);

        trace!("free list returned its block to the provider");
        Ok(())
    }
}

impl<P: Provider> Strategy for FreeList<P> {
    /// The returned pointer sits one header past the start of the carved
    /// region, so alignments above the word size hold when the block base
    /// plus header is itself aligned that far — in practice: uniform
    /// alignment per block, as with [`crate::Bump`].
    fn find(&self, layout: Layout) -> Result<NonNull<u8>> {
        if !align::is_valid_layout(layout) {
            return Err(Error::InvalidInput);
        }

        // The request carries its own header so the region can be recovered
        // on release.
        let request = align_up(layout.size() + BLOCK_HEADER_SIZE, layout.align());
        if request > self.aligned_size() {
            return Err(Error::SizeRequestTooLarge);
        }

        self.init_block_if_unset()?;

        if self.free.get().is_none() {
            // Exhausted. The strategy holds one block at a time, so there is
            // nothing to grow into regardless of the grow policy.
            return Err(Error::NoFreeBlock);
        }

        let Some(pair) = self.search(request)? else {
            return Err(Error::NoFreeBlock);
        };

        unsafe {
            let mut target = pair.header;
            let remainder = header::split(Some(target), request, layout.align())
                .map_err(Error::from)?;

            // Splice the remainder where the target was; when the target was
            // consumed whole, its successor takes its place so the tail of
            // the list survives.
            let replacement = remainder.or(target.as_ref().next);
            match pair.prev {
                Some(mut prev) => prev.as_mut().next = replacement,
                None => self.free.set(replacement),
            }

            target.as_mut().next = None;
            Ok(BlockHeader::content_address_of(target))
        }
    }

    /// # Safety
    ///
    /// In addition to the trait contract: calling this with a pointer whose
    /// backing block has already been returned to the provider (because every
    /// other allocation was released first) is undefined behavior. Release
    /// everything exactly once and don't come back.
    unsafe fn release(&self, ptr: NonNull<u8>) -> Result<()> {
        let Some(block) = self.block.get() else {
            return Err(Error::InvalidInput);
        };

        let low = block.as_ptr() as usize;
        let high = low + block.as_ref().size;
        let address = ptr.as_ptr() as usize;
        if address < low || address >= high {
            return Err(Error::InvalidInput);
        }

        let mut returned = BlockHeader::from_content_address(ptr);

        let Some(head) = self.free.get() else {
            self.free.set(Some(returned));
            return Ok(());
        };

        // Splice in ascending address order, then coalesce around the seam.
        match header::find_prior(Some(head), Some(returned)).map_err(Error::from)? {
            Some(mut prior) => {
                returned.as_mut().next = prior.as_ref().next;
                prior.as_mut().next = Some(returned);
                header::coalesce(Some(prior)).map_err(Error::from)?;
            }
            None => {
                returned.as_mut().next = Some(head);
                self.free.set(Some(returned));
                header::coalesce(self.free.get()).map_err(Error::from)?;
            }
        }

        // A head spanning everything past the block header means nothing is
        // outstanding anymore.
        if let Some(head) = self.free.get() {
            let whole_block = head.as_ptr().cast::<u8>()
                == block.as_ptr().cast::<u8>().add(BLOCK_HEADER_SIZE)
                && head.as_ref().size == block.as_ref().size - BLOCK_HEADER_SIZE;

            if whole_block {
                self.release_backing_block(block)?;
            }
        }

        Ok(())
    }

    fn accepts_alignment(&self) -> bool {
        true
    }

    fn accepts_release(&self) -> bool {
        true
    }
}

/// Dropping the allocator returns the backing block even if allocations are
/// still outstanding; their borrows end here.
impl<P: Provider> Drop for FreeList<P> {
    fn drop(&mut self) {
        if let Some(block) = self.block.get() {
            if let Err(err) = self.release_backing_block(block) {
                error!("free list failed to return its block on drop: {err}");
            }
        }
    }
}
