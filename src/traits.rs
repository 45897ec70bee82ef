use std::{alloc::Layout, ptr::NonNull};

use crate::{
    align::WORD_SIZE,
    error::{Error, Result},
};

/// The lower layer of the allocator stack. A provider owns page-aligned
/// blocks of a fixed size and hands them out one at a time; strategies sit on
/// top and subdivide them. Every block obtained from [`Provider::provide`]
/// must eventually go back through [`Provider::release`], either directly or
/// by dropping the strategy that borrowed it.
pub trait Provider {
    /// Hands out `count` blocks of [`Provider::block_size`] bytes as one
    /// contiguous region. Most providers only support `count == 1`.
    fn provide(&self, count: usize) -> Result<NonNull<u8>>;

    /// Takes a block back. The provider regains full ownership and may unmap
    /// the memory immediately.
    ///
    /// # Safety
    ///
    /// `ptr` must have been obtained from [`Provider::provide`] on this same
    /// provider, must not have been released already, and must not be read or
    /// written afterwards.
    unsafe fn release(&self, ptr: NonNull<u8>) -> Result<()>;

    /// Byte size of the blocks this provider hands out. Constant for a given
    /// provider type.
    fn block_size(&self) -> usize;
}

/// The upper layer of the allocator stack: turns provider blocks into
/// caller-sized allocations.
pub trait Strategy {
    /// Returns a pointer where `layout.size()` bytes can be written safely.
    /// Fails with [`Error::InvalidInput`] for zero sizes and for alignments
    /// that are not powers of two of at least the word size.
    fn find(&self, layout: Layout) -> Result<NonNull<u8>>;

    /// Word-aligned convenience form of [`Strategy::find`].
    fn find_sized(&self, size: usize) -> Result<NonNull<u8>> {
        let layout = Layout::from_size_align(size, WORD_SIZE).map_err(|_| Error::InvalidInput)?;
        self.find(layout)
    }

    /// Terminates the borrow created by a previous [`Strategy::find`].
    /// Strategies that don't support per-allocation release fail with
    /// [`Error::OperationNotSupported`].
    ///
    /// # Safety
    ///
    /// `ptr` must have been obtained from [`Strategy::find`] on this same
    /// strategy, must not have been released already, and must not be read or
    /// written afterwards.
    unsafe fn release(&self, ptr: NonNull<u8>) -> Result<()>;

    /// Releases every block held by the strategy at once. Only bulk-release
    /// strategies implement this; the default fails with
    /// [`Error::OperationNotSupported`].
    ///
    /// # Safety
    ///
    /// No pointer previously obtained from [`Strategy::find`] may be read or
    /// written after a reset.
    unsafe fn reset(&self) -> Result<()> {
        Err(Error::OperationNotSupported)
    }

    /// Whether [`Strategy::find`] honors alignments above the word size.
    fn accepts_alignment(&self) -> bool;

    /// Whether [`Strategy::release`] can succeed at all.
    fn accepts_release(&self) -> bool;
}

/// Providers are commonly shared between several strategies, so a reference
/// to a provider is itself a provider.
impl<P: Provider> Provider for &P {
    fn provide(&self, count: usize) -> Result<NonNull<u8>> {
        (**self).provide(count)
    }

    unsafe fn release(&self, ptr: NonNull<u8>) -> Result<()> {
        (**self).release(ptr)
    }

    fn block_size(&self) -> usize {
        (**self).block_size()
    }
}

impl<S: Strategy> Strategy for &S {
    fn find(&self, layout: Layout) -> Result<NonNull<u8>> {
        (**self).find(layout)
    }

    unsafe fn release(&self, ptr: NonNull<u8>) -> Result<()> {
        (**self).release(ptr)
    }

    unsafe fn reset(&self) -> Result<()> {
        (**self).reset()
    }

    fn accepts_alignment(&self) -> bool {
        (**self).accepts_alignment()
    }

    fn accepts_release(&self) -> bool {
        (**self).accepts_release()
    }
}
