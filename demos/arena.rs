//! Phase-based allocation with a lock-free bump arena over the concurrent
//! page pool: burst of allocations, one bulk reset.

#![feature(allocator_api)]

use std::thread;

use stratalloc::{Bump, PagePool, Strategy};

fn main() {
    let pool = PagePool::<64>::new();
    let arena = Bump::new(&pool);

    thread::scope(|scope| {
        for worker in 0..4u64 {
            let arena = &arena;
            scope.spawn(move || {
                for i in 0..1000 {
                    let ptr = arena.find_sized(8).unwrap().cast::<u64>();
                    unsafe {
                        ptr.as_ptr().write(worker * 1000 + i);
                        assert_eq!(ptr.as_ptr().read(), worker * 1000 + i);
                    }
                }
            });
        }
    });

    // The phase is over: every allocation goes away at once.
    unsafe { arena.reset().unwrap() };

    println!("4000 allocations served and reclaimed in bulk");
}
