//! Composable memory allocators built as a two-layer stack. The lower layer
//! is a *provider*: it obtains page-aligned blocks from the operating system
//! and takes them back when nobody needs them anymore. The upper layer is a
//! *strategy*: it subdivides the blocks handed up by a provider into the
//! variable-sized allocations that callers actually asked for.
//!
//! ```text
//!            Find / Release               Provide / Release
//! Caller <----------------> Strategy <--------------------> Provider <---> OS
//!                           (Bump,                          (PagePool,
//!                            FreeList)                       PageLedger,
//!                                                            StaticBlock)
//! ```
//!
//! Any strategy composes with any provider through the [`Provider`] and
//! [`Strategy`] traits, so a lock-free [`Bump`] can sit on top of the
//! lock-free [`PagePool`] for multithreaded phase-based workloads, while a
//! [`FreeList`] over a [`StaticBlock`] gives you a general purpose allocator
//! that never touches the OS at all. [`Adapter`] projects any strategy into
//! [`std::alloc::Allocator`] so standard collections can use it.

#![feature(allocator_api)]

use std::ptr::NonNull;

mod adapter;
mod align;
mod bump;
mod config;
mod error;
mod freelist;
mod header;
mod ledger;
mod map;
mod platform;
mod pool;
mod range;
mod static_block;
mod traits;

/// Non-null pointer to `T`. We use this in most cases instead of `*mut T`
/// because the compiler will yell at us if we don't write code for the `None`
/// case. Block headers, free lists and map chains all terminate on `None`
/// instead of a magic null.
pub(crate) type Pointer<T> = Option<NonNull<T>>;

pub use adapter::Adapter;
pub use bump::Bump;
pub use config::{FreeListConfig, GrowPolicy, Search, SizePolicy};
pub use error::{Error, Result};
pub use freelist::FreeList;
pub use ledger::PageLedger;
pub use pool::PagePool;
pub use static_block::StaticBlock;
pub use traits::{Provider, Strategy};
