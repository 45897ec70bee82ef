//! Standard collections running on a free-list allocator through the
//! `std::alloc::Allocator` adapter.

#![feature(allocator_api)]

use stratalloc::{Adapter, FreeList, PageLedger};

fn main() {
    let alloc = Adapter::new(FreeList::new(PageLedger::new()));

    let mut words = Vec::new_in(&alloc);
    for word in ["allocators", "all", "the", "way", "down"] {
        words.push(word);
    }

    let boxed = Box::new_in(words.len() as u64, &alloc);

    println!("{} ({} words)", words.join(" "), boxed);
}
