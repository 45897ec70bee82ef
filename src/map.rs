//! A fixed-capacity, open-addressed hash table of [`VirtualAddressRange`]s
//! laid out *inside* a single provider block. The single-threaded page
//! provider chains these maps to track every outstanding mapping without
//! allocating any memory for itself beyond whole pages:
//!
//! ```text
//! +-----------------+     +-----------------+
//! | next  ----------+---> | next (None)     |
//! | occupied bitset |     | occupied bitset |
//! +-----------------+     +-----------------+
//! | range slot 0    |     | range slot 0    |
//! | range slot 1    |     |      ...        |
//! |      ...        |     +-----------------+
//! +-----------------+
//! ```
//!
//! Keys are range base addresses, hashed by identity modulo the capacity and
//! probed linearly. The subtle part is the removal probe: it must *not* stop
//! at the first empty slot. Ranges are removed constantly, and a hole left by
//! a removal says nothing about keys stored further along the probe sequence,
//! so stopping early produces false negatives. The probe only ends on a match
//! or when it loops back to where it started.

use std::{mem, ptr, ptr::NonNull};

use crate::{platform::PAGE_SIZE, range::VirtualAddressRange, Pointer};

const ENTRY_SIZE: usize = mem::size_of::<VirtualAddressRange>();

/// Upper bound on the entry count, used to size the occupancy bitset before
/// the real capacity (which depends on the bitset size) is known.
const MAX_ENTRIES_ESTIMATE: usize = PAGE_SIZE / ENTRY_SIZE;

const BITSET_WORDS: usize = (MAX_ENTRIES_ESTIMATE + 63) / 64;

const MAP_HEADER_SIZE: usize = mem::size_of::<usize>() + BITSET_WORDS * mem::size_of::<u64>();

/// Number of ranges a single map can hold.
pub(crate) const MAP_CAPACITY: usize = (PAGE_SIZE - MAP_HEADER_SIZE) / ENTRY_SIZE;

/// The table itself. Never constructed as a value: it is laid over a zeroed
/// provider block with [`RangeMap::place`], which is also why the all-zero
/// bit pattern must mean "empty map" (it does: no occupancy bits set, no
/// next pointer, all slots unset).
#[repr(C)]
pub(crate) struct RangeMap {
    next: Pointer<RangeMap>,
    occupied: [u64; BITSET_WORDS],
    table: [VirtualAddressRange; MAP_CAPACITY],
}

const _: () = assert!(mem::size_of::<RangeMap>() <= PAGE_SIZE);

impl RangeMap {
    /// Zeroes `block` and lays an empty map over it.
    ///
    /// # Safety
    ///
    /// `block` must point to [`PAGE_SIZE`] writable bytes exclusively owned
    /// by the caller, aligned to the word size.
    pub unsafe fn place(block: NonNull<u8>) -> NonNull<RangeMap> {
        ptr::write_bytes(block.as_ptr(), 0, PAGE_SIZE);
        block.cast()
    }

    pub fn capacity(&self) -> usize {
        MAP_CAPACITY
    }

    pub fn len(&self) -> usize {
        self.occupied.iter().map(|word| word.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.occupied.iter().all(|word| *word == 0)
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.capacity()
    }

    pub fn next(&self) -> Pointer<RangeMap> {
        self.next
    }

    pub fn set_next(&mut self, next: Pointer<RangeMap>) {
        self.next = next;
    }

    fn bit(&self, index: usize) -> bool {
        self.occupied[index / 64] >> (index % 64) & 1 == 1
    }

    fn set_bit(&mut self, index: usize) {
        self.occupied[index / 64] |= 1 << (index % 64);
    }

    fn clear_bit(&mut self, index: usize) {
        self.occupied[index / 64] &= !(1 << (index % 64));
    }

    fn slot_of(key: usize) -> usize {
        key % MAP_CAPACITY
    }

    /// Stores `range` in the first free slot along its probe sequence.
    /// Returns `false` when the map is full.
    pub fn insert(&mut self, range: VirtualAddressRange) -> bool {
        let start = Self::slot_of(range.address());
        let mut index = start;

        if self.bit(index) {
            loop {
                index = (index + 1) % MAP_CAPACITY;
                if index == start {
                    return false;
                }
                if !self.bit(index) {
                    break;
                }
            }
        }

        self.table[index] = range;
        self.set_bit(index);

        true
    }

    /// Removes and returns the range whose base address is `address`, or
    /// `None` if the map doesn't hold it. See the module docs for why this
    /// probe only stops on a full loop.
    pub fn take(&mut self, address: usize) -> Option<VirtualAddressRange> {
        let start = Self::slot_of(address);
        let mut index = start;

        loop {
            if self.bit(index) && self.table[index].address() == address {
                self.clear_bit(index);
                return Some(self.table[index]);
            }

            index = (index + 1) % MAP_CAPACITY;
            if index == start {
                return None;
            }
        }
    }

    /// All ranges currently stored, in slot order. Used to drain outstanding
    /// mappings when the owning provider is dropped.
    pub fn ranges(&self) -> impl Iterator<Item = VirtualAddressRange> + '_ {
        (0..MAP_CAPACITY)
            .filter(|&index| self.bit(index))
            .map(|index| self.table[index])
    }
}
