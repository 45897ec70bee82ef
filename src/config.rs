//! Allocator tunables. Every option is fixed at construction time and never
//! mutated afterwards; identical configurations yield identical behavior.

use crate::{align::WORD_SIZE, platform::PAGE_SIZE};

/// Policy employed when the current block has no headroom left for a pending
/// request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GrowPolicy {
    /// Request another block from the provider and keep going.
    GrowStorage,
    /// Fail the request with [`crate::Error::ReachedMemoryLimit`]. A smaller
    /// request may still succeed later.
    ReturnNull,
}

/// How the configured target size maps to the real block footprint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SizePolicy {
    /// The block must have at least `size` usable bytes: the footprint is
    /// `size` plus the block header, rounded up to the alignment.
    HaveAtLeastSizeBytes,
    /// The block must not exceed `size` bytes, headers included: the
    /// footprint is `size` rounded down to the alignment.
    NoMoreThanSizeBytes,
}

/// Which free region a free-list search settles on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Search {
    /// The first region that fits. Stops scanning as soon as one is found.
    FirstFit,
    /// The smallest region that fits. Scans the whole list.
    BestFit,
    /// The largest region that fits. Scans the whole list.
    WorstFit,
}

/// Tunables for [`crate::FreeList`], fixed at construction.
#[derive(Clone, Copy, Debug)]
pub struct FreeListConfig {
    /// Power of two alignment for the block start and every allocation.
    pub alignment: usize,
    /// Target block size in bytes, interpreted through `size_policy`.
    pub size: usize,
    pub size_policy: SizePolicy,
    pub grow_policy: GrowPolicy,
    pub search: Search,
}

/// The default fills exactly one provider page: word alignment, one page of
/// footprint, headers included.
impl Default for FreeListConfig {
    fn default() -> Self {
        Self {
            alignment: WORD_SIZE,
            size: PAGE_SIZE,
            size_policy: SizePolicy::NoMoreThanSizeBytes,
            grow_policy: GrowPolicy::GrowStorage,
            search: Search::FirstFit,
        }
    }
}
