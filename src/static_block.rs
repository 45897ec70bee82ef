//! A provider backed by static storage. Useful when the strategy algorithms
//! are wanted on memory that never came from the OS: embedded targets, tests,
//! or simply a fixed arena carved out at compile time.

use std::{
    cell::UnsafeCell,
    ptr::NonNull,
    sync::atomic::{AtomicBool, Ordering},
};

use crate::{
    error::{Error, Result},
    traits::Provider,
};

/// Backing storage, page aligned so strategies can make the same alignment
/// assumptions they make about OS pages.
#[repr(C, align(4096))]
struct Backing<const SIZE: usize>([u8; SIZE]);

/// Provider of a single fixed block carved from static storage. The block is
/// handed out once; further requests fail with [`Error::NoFreeBlock`] until
/// it comes back.
///
/// The backing bytes live inside the provider itself, so it must not move
/// while its block is outstanding. Put it in a `static`, or lend it to the
/// strategy by reference.
///
/// # Examples
///
/// ```
/// use stratalloc::{Provider, StaticBlock};
///
/// static ARENA: StaticBlock<4096> = StaticBlock::new();
///
/// let block = ARENA.provide(1).unwrap();
/// assert_eq!(ARENA.provide(1), Err(stratalloc::Error::NoFreeBlock));
/// unsafe { ARENA.release(block).unwrap() };
/// ```
pub struct StaticBlock<const SIZE: usize> {
    bytes: UnsafeCell<Backing<SIZE>>,
    taken: AtomicBool,
}

// The buffer is only ever exposed through the provider contract: whoever
// holds the block borrows it exclusively until release.
unsafe impl<const SIZE: usize> Sync for StaticBlock<SIZE> {}

impl<const SIZE: usize> StaticBlock<SIZE> {
    pub const fn new() -> Self {
        Self {
            bytes: UnsafeCell::new(Backing([0; SIZE])),
            taken: AtomicBool::new(false),
        }
    }

    fn base(&self) -> NonNull<u8> {
        // The backing array address is never null.
        unsafe { NonNull::new_unchecked(self.bytes.get().cast()) }
    }
}

impl<const SIZE: usize> Provider for StaticBlock<SIZE> {
    fn provide(&self, count: usize) -> Result<NonNull<u8>> {
        if count != 1 {
            return Err(Error::InvalidInput);
        }

        if self.taken.swap(true, Ordering::AcqRel) {
            return Err(Error::NoFreeBlock);
        }

        Ok(self.base())
    }

    unsafe fn release(&self, ptr: NonNull<u8>) -> Result<()> {
        if ptr != self.base() {
            return Err(Error::InvalidInput);
        }

        self.taken.store(false, Ordering::Release);
        Ok(())
    }

    fn block_size(&self) -> usize {
        SIZE
    }
}

impl<const SIZE: usize> Default for StaticBlock<SIZE> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hands_out_its_block_exactly_once() {
        let arena = StaticBlock::<256>::new();

        let block = arena.provide(1).unwrap();
        assert_eq!(arena.block_size(), 256);
        assert_eq!(arena.provide(1), Err(Error::NoFreeBlock));

        unsafe {
            block.as_ptr().write(9);
            arena.release(block).unwrap();
        }

        // Releasing re-arms the provider with the same block.
        assert_eq!(arena.provide(1), Ok(block));
    }

    #[test]
    fn rejects_counts_other_than_one() {
        let arena = StaticBlock::<256>::new();

        assert_eq!(arena.provide(0), Err(Error::InvalidInput));
        assert_eq!(arena.provide(2), Err(Error::InvalidInput));
    }

    #[test]
    fn release_validates_pointer_identity() {
        let arena = StaticBlock::<256>::new();
        let block = arena.provide(1).unwrap();

        unsafe {
            let inside = NonNull::new(block.as_ptr().add(8)).unwrap();
            assert_eq!(arena.release(inside), Err(Error::InvalidInput));

            arena.release(block).unwrap();
        }
    }

    #[test]
    fn backing_storage_is_page_aligned() {
        let arena = StaticBlock::<128>::new();
        assert_eq!(arena.provide(1).unwrap().as_ptr() as usize % 4096, 0);
    }
}
