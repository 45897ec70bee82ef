//! The concurrent page provider. A [`PagePool`] pre-reserves a *super-block*
//! of `LIMIT` contiguous pages plus a sibling array of one descriptor per
//! page, and then hands pages out and takes them back without ever locking:
//! the only shared mutable word is a packed 64-bit *anchor* updated through
//! compare-and-swap.
//!
//! ```text
//!               anchor (AtomicU64)
//!     +--------+------+-----------+---------+
//!     | status | head | available |   tag   |
//!     | 2 bits | 18 b |   18 b    |  26 b   |
//!     +--------+--|---+-----------+---------+
//!                 |
//!                 v            descriptors
//!     +------+------+------+------+
//!     | next | next | next | ...  |   free pages form a LIFO chained
//!     +--|---+------+---^--+------+   through their indices
//!        +----------------+
//!
//!     +--------+--------+--------+------+
//!     | page 0 | page 1 | page 2 | ...  |  super-block
//!     +--------+--------+--------+------+
//! ```
//!
//! The pool initializes lazily. The first caller to move the anchor from
//! `Initial` to `Allocating` maps both regions and links the descriptors;
//! everyone else yields until the anchor reads `Allocated`. If the OS refuses
//! to map either region the anchor moves to `Failed`, which is terminal:
//! every later request reports [`Error::OutOfMemory`].

use std::{
    ptr::{self, NonNull},
    sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, Ordering},
    thread,
};

use log::{error, trace};

use crate::{
    error::{Error, Failure, Result},
    platform::{self, PAGE_SIZE},
    range::VirtualAddressRange,
    traits::Provider,
};

/// Default page limit: 1 GiB worth of pages, minus one so the count fits the
/// anchor's 18-bit fields.
pub(crate) const DEFAULT_PAGE_LIMIT: usize = (1 << 30) / PAGE_SIZE - 1;

/// Hard ceiling imposed by the 18-bit `head` and `available` anchor fields.
/// The value `LIMIT` itself is reserved as the list-end sentinel.
const MAX_PAGE_LIMIT: usize = (1 << 18) - 1;

/// Initialization state machine, stored in the anchor's low two bits.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Status {
    Initial = 0,
    Allocating = 1,
    Allocated = 2,
    Failed = 3,
}

/// Unpacked view of the anchor word. Bits, from low to high: `status` (2),
/// `head` (18), `available` (18), `tag` (26).
///
/// `head` indexes the first free descriptor, with `LIMIT` as the end
/// sentinel. `available` counts free pages. `tag` is a generation counter
/// bumped by every successful CAS: a page popped and pushed back between a
/// competitor's load and CAS leaves `head` looking untouched while the
/// descriptor links changed underneath (the classic ABA trap of a LIFO), and
/// the tag is what makes such an interleaving fail the CAS.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct Anchor {
    status: Status,
    head: u32,
    available: u32,
    tag: u32,
}

const FIELD_MASK: u64 = (1 << 18) - 1;
const TAG_MASK: u64 = (1 << 26) - 1;

impl Anchor {
    fn pack(self) -> u64 {
        self.status as u64
            | (self.head as u64 & FIELD_MASK) << 2
            | (self.available as u64 & FIELD_MASK) << 20
            | (self.tag as u64 & TAG_MASK) << 38
    }

    fn unpack(bits: u64) -> Self {
        let status = match bits & 0b11 {
            0 => Status::Initial,
            1 => Status::Allocating,
            2 => Status::Allocated,
            _ => Status::Failed,
        };

        Self {
            status,
            head: (bits >> 2 & FIELD_MASK) as u32,
            available: (bits >> 20 & FIELD_MASK) as u32,
            tag: (bits >> 38 & TAG_MASK) as u32,
        }
    }

    fn bump_tag(self) -> Self {
        Self {
            tag: self.tag.wrapping_add(1) & TAG_MASK as u32,
            ..self
        }
    }
}

/// One entry per page in the super-block. Free pages chain through `next`
/// into the LIFO the anchor's `head` points at; `next` is a pure index into
/// the sibling array, not a pointer.
struct Descriptor {
    next: AtomicU32,
    occupied: AtomicBool,
}

/// Lock-free provider of page-sized, page-aligned blocks, capped at `LIMIT`
/// outstanding pages. Reuses returned pages in LIFO order.
///
/// # Examples
///
/// ```
/// use stratalloc::{PagePool, Provider};
///
/// let pool = PagePool::<8>::new();
///
/// let page = pool.provide(1).unwrap();
/// unsafe {
///     page.as_ptr().write(42);
///     pool.release(page).unwrap();
/// }
/// ```
pub struct PagePool<const LIMIT: usize = DEFAULT_PAGE_LIMIT> {
    anchor: AtomicU64,
    descriptors: AtomicPtr<Descriptor>,
    super_block: AtomicPtr<u8>,
}

impl<const LIMIT: usize> PagePool<LIMIT> {
    /// Post-monomorphization guard: `head` and `available` are 18-bit fields
    /// and `LIMIT` doubles as the list-end sentinel.
    const LIMIT_FITS: () = assert!(LIMIT > 0 && LIMIT <= MAX_PAGE_LIMIT);

    /// Pages needed for the descriptor array.
    const DESCRIPTOR_PAGES: usize =
        (LIMIT * std::mem::size_of::<Descriptor>() + PAGE_SIZE - 1) / PAGE_SIZE;

    /// Builds an empty pool. No memory is mapped until the first
    /// [`Provider::provide`] call.
    pub const fn new() -> Self {
        let _: () = Self::LIMIT_FITS;

        Self {
            anchor: AtomicU64::new(0),
            descriptors: AtomicPtr::new(ptr::null_mut()),
            super_block: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Races the anchor from `Initial` to `Allocating` and, if we win, maps
    /// the descriptor array and the super-block. Both pointers are published
    /// before the release store of the `Allocated` anchor, so any thread that
    /// observes `Allocated` also observes the mapped regions and the fully
    /// linked descriptor LIFO.
    fn initialize(&self) -> Result<()> {
        let old = Anchor::unpack(self.anchor.load(Ordering::Acquire));
        if old.status != Status::Initial {
            return Ok(());
        }

        let claim = Anchor {
            status: Status::Allocating,
            ..old
        };
        if self
            .anchor
            .compare_exchange(old.pack(), claim.pack(), Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Lost the race. The winner is mapping; our caller retries.
            return Ok(());
        }

        let descriptors = match platform::fetch_pages(Self::DESCRIPTOR_PAGES) {
            Ok(range) => range,
            Err(failure) => return self.fail_init(failure),
        };

        let super_block = match platform::fetch_pages(LIMIT) {
            Ok(range) => range,
            Err(failure) => {
                let _ = platform::return_pages(descriptors);
                return self.fail_init(failure);
            }
        };

        // Link every descriptor into the initial LIFO: 0 -> 1 -> ... -> LIMIT.
        let table = unsafe { descriptors.base_unchecked() }.cast::<Descriptor>();
        for index in 0..LIMIT {
            unsafe {
                table.as_ptr().add(index).write(Descriptor {
                    next: AtomicU32::new(index as u32 + 1),
                    occupied: AtomicBool::new(false),
                });
            }
        }

        self.descriptors.store(table.as_ptr(), Ordering::Release);
        self.super_block
            .store(unsafe { super_block.base_unchecked() }.as_ptr(), Ordering::Release);

        let ready = Anchor {
            status: Status::Allocated,
            head: 0,
            available: LIMIT as u32,
            tag: claim.tag,
        }
        .bump_tag();
        self.anchor.store(ready.pack(), Ordering::Release);

        trace!("page pool initialized with {LIMIT} pages");
        Ok(())
    }

    /// Terminal failure path of the init race.
    fn fail_init(&self, failure: Failure) -> Result<()> {
        error!("page pool initialization failed: {failure}");

        let failed = Anchor {
            status: Status::Failed,
            head: 0,
            available: 0,
            tag: 0,
        };
        self.anchor.store(failed.pack(), Ordering::Release);

        Err(Error::from(failure))
    }

    fn descriptor(&self, index: usize) -> &Descriptor {
        // Non-null for any index < LIMIT once `Allocated` has been observed.
        unsafe { &*self.descriptors.load(Ordering::Acquire).add(index) }
    }
}

impl<const LIMIT: usize> Provider for PagePool<LIMIT> {
    fn provide(&self, count: usize) -> Result<NonNull<u8>> {
        if count == 0 || count > LIMIT {
            return Err(Error::InvalidInput);
        }
        if count != 1 {
            return Err(Error::OperationNotSupported);
        }

        loop {
            let old = Anchor::unpack(self.anchor.load(Ordering::Acquire));

            match old.status {
                Status::Initial => {
                    self.initialize()?;
                    continue;
                }
                Status::Allocating => {
                    thread::yield_now();
                    continue;
                }
                Status::Failed => return Err(Error::OutOfMemory),
                Status::Allocated => {}
            }

            if old.available == 0 || old.head as usize == LIMIT {
                return Err(Error::NoFreeBlock);
            }

            let next = self.descriptor(old.head as usize).next.load(Ordering::Acquire);
            let new = Anchor {
                head: next,
                available: old.available - 1,
                ..old
            }
            .bump_tag();

            if self
                .anchor
                .compare_exchange_weak(old.pack(), new.pack(), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let descriptor = self.descriptor(old.head as usize);
                descriptor.occupied.store(true, Ordering::Release);
                descriptor.next.store(0, Ordering::Relaxed);

                let base = self.super_block.load(Ordering::Acquire);
                let page = unsafe { base.add(old.head as usize * PAGE_SIZE) };
                return Ok(unsafe { NonNull::new_unchecked(page) });
            }
        }
    }

    unsafe fn release(&self, ptr: NonNull<u8>) -> Result<()> {
        let anchor = Anchor::unpack(self.anchor.load(Ordering::Acquire));
        if anchor.status != Status::Allocated {
            return Err(Error::InvalidInput);
        }

        let base = self.super_block.load(Ordering::Acquire) as usize;
        let address = ptr.as_ptr() as usize;
        if address < base || address >= base + LIMIT * PAGE_SIZE || (address - base) % PAGE_SIZE != 0
        {
            return Err(Error::InvalidInput);
        }

        let index = (address - base) / PAGE_SIZE;
        let descriptor = self.descriptor(index);

        // A page that isn't outstanding can't come back: catches double
        // releases and pointers we never handed out.
        if !descriptor.occupied.swap(false, Ordering::AcqRel) {
            return Err(Error::InvalidInput);
        }

        loop {
            let old = Anchor::unpack(self.anchor.load(Ordering::Acquire));
            let new = Anchor {
                head: index as u32,
                available: old.available + 1,
                ..old
            }
            .bump_tag();

            // The link is written before the CAS publishes this page as the
            // new head, so a provide that races in right after the CAS
            // observes a well formed LIFO.
            descriptor.next.store(old.head, Ordering::Release);

            if self
                .anchor
                .compare_exchange_weak(old.pack(), new.pack(), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(());
            }
        }
    }

    fn block_size(&self) -> usize {
        PAGE_SIZE
    }
}

impl<const LIMIT: usize> Default for PagePool<LIMIT> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const LIMIT: usize> Drop for PagePool<LIMIT> {
    fn drop(&mut self) {
        let anchor = Anchor::unpack(self.anchor.load(Ordering::Acquire));
        if anchor.status != Status::Allocated {
            return;
        }

        let super_block = self.super_block.load(Ordering::Acquire);
        let descriptors = self.descriptors.load(Ordering::Acquire);

        unsafe {
            let super_block =
                VirtualAddressRange::new(NonNull::new_unchecked(super_block), LIMIT);
            if let Err(failure) = platform::return_pages(super_block) {
                error!("failed to unmap super-block: {failure}");
            }

            let descriptors = VirtualAddressRange::new(
                NonNull::new_unchecked(descriptors.cast()),
                Self::DESCRIPTOR_PAGES,
            );
            if let Err(failure) = platform::return_pages(descriptors) {
                error!("failed to unmap descriptors: {failure}");
            }
        }
    }
}
