//! Thin shim projecting a [`Strategy`] into the standard allocator traits so
//! collections can use any strategy/provider pairing directly.

use std::{
    alloc::{AllocError, Allocator, GlobalAlloc, Layout},
    ptr::{self, NonNull},
};

use crate::{align::WORD_SIZE, traits::Strategy};

/// Adapts any [`Strategy`] to [`std::alloc::Allocator`], and to
/// [`GlobalAlloc`] when the strategy is `Sync`.
///
/// The shim is deliberately thin: alignments below the word size are raised
/// to it (the strategies guarantee nothing smaller), zero-sized requests
/// short-circuit to a dangling pointer per the `Allocator` contract, and
/// release errors from strategies that don't support per-allocation release
/// are dropped, exactly like a bump arena ignoring `free`.
///
/// # Examples
///
/// ```
/// #![feature(allocator_api)]
///
/// use stratalloc::{Adapter, FreeList, PageLedger};
///
/// let alloc = Adapter::new(FreeList::new(PageLedger::new()));
///
/// let mut values = Vec::with_capacity_in(16, &alloc);
/// values.extend(0..16);
/// assert_eq!(values.iter().sum::<i32>(), 120);
/// ```
///
/// As a global allocator, with a `Sync` strategy:
///
/// ```no_run
/// #![feature(allocator_api)]
///
/// use stratalloc::{Adapter, Bump, PagePool};
///
/// #[global_allocator]
/// static GLOBAL: Adapter<Bump<PagePool>> = Adapter::new(Bump::new(PagePool::new()));
///
/// fn main() {
///     let boxed = Box::new(5);
///     assert_eq!(*boxed, 5);
/// }
/// ```
pub struct Adapter<S: Strategy> {
    strategy: S,
}

impl<S: Strategy> Adapter<S> {
    pub const fn new(strategy: S) -> Self {
        Self { strategy }
    }

    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    pub fn into_inner(self) -> S {
        self.strategy
    }

    /// Raises sub-word alignments to the minimum the strategies support.
    fn adjust(layout: Layout) -> Result<Layout, AllocError> {
        if layout.align() >= WORD_SIZE {
            return Ok(layout);
        }

        Layout::from_size_align(layout.size(), WORD_SIZE).map_err(|_| AllocError)
    }
}

unsafe impl<S: Strategy> Allocator for Adapter<S> {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        if layout.size() == 0 {
            let dangling =
                NonNull::new(ptr::without_provenance_mut(layout.align())).ok_or(AllocError)?;
            return Ok(NonNull::slice_from_raw_parts(dangling, 0));
        }

        let adjusted = Self::adjust(layout)?;
        match self.strategy.find(adjusted) {
            Ok(address) => Ok(NonNull::slice_from_raw_parts(address, layout.size())),
            Err(_) => Err(AllocError),
        }
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        if layout.size() == 0 {
            return;
        }

        let _ = self.strategy.release(ptr);
    }
}

unsafe impl<S: Strategy + Sync> GlobalAlloc for Adapter<S> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let Ok(adjusted) = Self::adjust(layout) else {
            return ptr::null_mut();
        };

        match self.strategy.find(adjusted) {
            Ok(address) => address.as_ptr(),
            Err(_) => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let Some(ptr) = NonNull::new(ptr) {
            let _ = self.strategy.release(ptr);
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let Ok(new_layout) = Layout::from_size_align(new_size, layout.align()) else {
            return ptr::null_mut();
        };

        let new_address = self.alloc(new_layout);
        if !new_address.is_null() {
            ptr::copy_nonoverlapping(ptr, new_address, layout.size().min(new_size));
            self.dealloc(ptr, layout);
        }

        new_address
    }
}
