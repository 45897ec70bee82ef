//! Block headers and the intrusive singly-linked lists they form. A *block*
//! is a byte range owned by an allocator; its first [`BLOCK_HEADER_SIZE`]
//! bytes are a [`BlockHeader`] written in place, and everything after that is
//! payload:
//!
//! ```text
//! +--------------+          <--------------+
//! | size         |  <---+                  |
//! +--------------+      | BlockHeader      | size bytes in total,
//! | next         |  <---+                  | header included.
//! +--------------+                         |
//! |   Payload    |  <- content address     |
//! |     ...      |                         |
//! +--------------+          <--------------+
//! ```
//!
//! Free-list strategies keep chains of these headers sorted by address and
//! carve them up with [`split`] / glue them back together with [`coalesce`].
//! Everything here works on raw block memory, so nearly every function is
//! unsafe and the callers are the ones holding the ownership story together.

use std::{
    mem,
    ptr::{self, NonNull},
};

use crate::{
    align::{align_up, is_valid_alignment},
    error::Failure,
    Pointer,
};

/// Block header size in bytes. Kept a multiple of the word size so payloads
/// start word aligned.
pub(crate) const BLOCK_HEADER_SIZE: usize = mem::size_of::<BlockHeader>();

const _: () = assert!(BLOCK_HEADER_SIZE % mem::size_of::<usize>() == 0);

/// The intrusive record embedded at offset 0 of every block.
#[repr(C)]
#[derive(Debug)]
pub(crate) struct BlockHeader {
    /// Total byte length of the block, including this header.
    pub size: usize,
    /// Next block in the list, or `None` at the end.
    pub next: Pointer<BlockHeader>,
}

/// Ephemeral result of a list search. When `prev` is `Some` it satisfies
/// `prev.next == header`; `None` means `header` is the list head.
#[derive(Debug)]
pub(crate) struct HeaderPair {
    pub prev: Pointer<BlockHeader>,
    pub header: NonNull<BlockHeader>,
}

impl BlockHeader {
    /// Interprets the first [`BLOCK_HEADER_SIZE`] bytes at `base` as a header
    /// and writes `{size, next}` into them.
    ///
    /// # Safety
    ///
    /// `base` must point to at least `size` writable bytes exclusively owned
    /// by the caller, aligned to the word size.
    pub unsafe fn create(
        base: NonNull<u8>,
        size: usize,
        next: Pointer<BlockHeader>,
    ) -> NonNull<BlockHeader> {
        debug_assert!(size >= BLOCK_HEADER_SIZE);

        let header = base.cast::<BlockHeader>();
        header.as_ptr().write(BlockHeader { size, next });

        header
    }

    /// Returns the address right after the header, where the payload begins.
    ///
    /// # Safety
    ///
    /// `header` must point to a live header. We use this as
    /// `BlockHeader::content_address_of(header)` instead of
    /// `header.content_address()` to avoid creating intermediary references
    /// to `self` and keep Miri happy.
    #[inline]
    pub unsafe fn content_address_of(header: NonNull<BlockHeader>) -> NonNull<u8> {
        NonNull::new_unchecked(header.as_ptr().offset(1)).cast()
    }

    /// Returns the header given an address that points right after it. This
    /// is how a strategy recovers the header of a returned allocation.
    ///
    /// # Safety
    ///
    /// `address` must point exactly to the first byte after a live header.
    #[inline]
    pub unsafe fn from_content_address(address: NonNull<u8>) -> NonNull<BlockHeader> {
        NonNull::new_unchecked(address.as_ptr().cast::<BlockHeader>().offset(-1))
    }
}

/// Zeroes the payload of `header`, leaving the header itself intact.
///
/// # Safety
///
/// `header` must point to a live header whose block memory is exclusively
/// owned by the caller.
pub(crate) unsafe fn zero_block(header: NonNull<BlockHeader>) {
    let size = header.as_ref().size - BLOCK_HEADER_SIZE;
    ptr::write_bytes(BlockHeader::content_address_of(header).as_ptr(), 0, size);
}

/// Walks `head -> next -> ...` until `sentinel` (`None` walks the whole
/// list), handing each block's bytes to `release`. The next pointer is read
/// before the callback runs, so `release` is free to clobber the block.
///
/// # Safety
///
/// Every node reachable from `head` must be a live header.
pub(crate) unsafe fn release_list(
    head: Pointer<BlockHeader>,
    mut release: impl FnMut(NonNull<u8>) -> Result<(), Failure>,
    sentinel: Pointer<BlockHeader>,
) -> Result<(), Failure> {
    if head.is_none() {
        return Err(Failure::HeaderIsNull);
    }

    let mut current = head;
    while current != sentinel {
        let Some(header) = current else {
            break;
        };

        let next = header.as_ref().next;
        release(header.cast::<u8>())?;
        current = next;
    }

    Ok(())
}

/// Returns the first header in `head`'s list with `size >= minimum_size`, or
/// `None` if nothing fits.
///
/// # Safety
///
/// Every node reachable from `head` must be a live header.
pub(crate) unsafe fn find_first_fit(
    head: Pointer<BlockHeader>,
    minimum_size: usize,
) -> Result<Option<HeaderPair>, Failure> {
    if head.is_none() {
        return Err(Failure::HeaderIsNull);
    }
    if minimum_size == 0 {
        return Err(Failure::InvalidSize);
    }

    let mut prev: Pointer<BlockHeader> = None;
    let mut current = head;

    while let Some(header) = current {
        if header.as_ref().size >= minimum_size {
            return Ok(Some(HeaderPair { prev, header }));
        }

        prev = current;
        current = header.as_ref().next;
    }

    Ok(None)
}

/// Scans the whole list and keeps the candidate `better` prefers. Ties go to
/// the earliest occurrence because `better` is strict.
unsafe fn find_by_fit(
    head: Pointer<BlockHeader>,
    minimum_size: usize,
    better: impl Fn(usize, usize) -> bool,
) -> Result<Option<HeaderPair>, Failure> {
    if head.is_none() {
        return Err(Failure::HeaderIsNull);
    }
    if minimum_size == 0 {
        return Err(Failure::InvalidSize);
    }

    let mut target: Option<HeaderPair> = None;
    let mut prev: Pointer<BlockHeader> = None;
    let mut current = head;

    while let Some(header) = current {
        let size = header.as_ref().size;

        if size >= minimum_size
            && target
                .as_ref()
                .map_or(true, |pair| better(size, pair.header.as_ref().size))
        {
            target = Some(HeaderPair { prev, header });
        }

        prev = current;
        current = header.as_ref().next;
    }

    Ok(target)
}

/// Returns the header minimizing `size` subject to `size >= minimum_size`.
///
/// # Safety
///
/// Every node reachable from `head` must be a live header.
pub(crate) unsafe fn find_best_fit(
    head: Pointer<BlockHeader>,
    minimum_size: usize,
) -> Result<Option<HeaderPair>, Failure> {
    find_by_fit(head, minimum_size, |candidate, current| candidate < current)
}

/// Returns the header maximizing `size` subject to `size >= minimum_size`.
///
/// # Safety
///
/// Every node reachable from `head` must be a live header.
pub(crate) unsafe fn find_worst_fit(
    head: Pointer<BlockHeader>,
    minimum_size: usize,
) -> Result<Option<HeaderPair>, Failure> {
    find_by_fit(head, minimum_size, |candidate, current| candidate > current)
}

/// Returns the header in `head`'s list after which `block` belongs in
/// ascending address order, or `None` if `block` sorts before `head`.
///
/// # Safety
///
/// Every node reachable from `head` must be a live header.
pub(crate) unsafe fn find_prior(
    head: Pointer<BlockHeader>,
    block: Pointer<BlockHeader>,
) -> Result<Pointer<BlockHeader>, Failure> {
    let (Some(head), Some(block)) = (head, block) else {
        return Err(Failure::HeaderIsNull);
    };

    if head.as_ptr() as usize >= block.as_ptr() as usize {
        return Ok(None);
    }

    let mut current = head;
    while let Some(next) = current.as_ref().next {
        if next.as_ptr() as usize >= block.as_ptr() as usize {
            break;
        }
        current = next;
    }

    Ok(Some(current))
}

/// Carves `align_up(bytes_needed, alignment)` bytes out of the front of
/// `block` and turns the remainder into a new header linked in its place:
///
/// ```text
/// Before:  [ header | .......... payload .......... ]
/// After:   [ header | payload ] [ header | payload ]
///            `block`, take bytes  returned remainder
/// ```
///
/// Returns `Ok(None)` when the remainder could not host another header plus
/// at least one aligned payload byte; `block` is left whole in that case.
/// The old payload is zeroed before the new header is written.
///
/// # Safety
///
/// `block` must be a live header over exclusively owned memory.
pub(crate) unsafe fn split(
    block: Pointer<BlockHeader>,
    bytes_needed: usize,
    alignment: usize,
) -> Result<Option<NonNull<BlockHeader>>, Failure> {
    let Some(mut block) = block else {
        return Err(Failure::HeaderIsNull);
    };
    if bytes_needed == 0 {
        return Err(Failure::InvalidSize);
    }
    if !is_valid_alignment(alignment) {
        return Err(Failure::InvalidAlignment);
    }

    let take = align_up(bytes_needed, alignment);
    if block.as_ref().size < take {
        return Err(Failure::BlockTooSmall);
    }

    let remainder = block.as_ref().size - take;
    if remainder < align_up(BLOCK_HEADER_SIZE + 1, alignment) {
        return Ok(None);
    }

    zero_block(block);

    let address = NonNull::new_unchecked(block.as_ptr().cast::<u8>().add(take));
    let new_header = BlockHeader::create(address, remainder, block.as_ref().next);

    block.as_mut().size = take;
    block.as_mut().next = Some(new_header);

    Ok(Some(new_header))
}

/// Absorbs `block.next` into `block` for as long as the two are physically
/// adjacent in memory, then zeroes the resulting payload. Non-adjacent
/// neighbors terminate the loop, so only true neighbors ever merge and
/// address order is preserved.
///
/// # Safety
///
/// `block` and every header reachable from it must be live, over exclusively
/// owned memory.
pub(crate) unsafe fn coalesce(block: Pointer<BlockHeader>) -> Result<(), Failure> {
    let Some(mut block) = block else {
        return Err(Failure::HeaderIsNull);
    };

    while let Some(next) = block.as_ref().next {
        if next.as_ptr().cast::<u8>() != block.as_ptr().cast::<u8>().add(block.as_ref().size) {
            break;
        }

        block.as_mut().size += next.as_ref().size;
        block.as_mut().next = next.as_ref().next;
    }

    zero_block(block);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Word aligned scratch space for hand-building block lists.
    fn buffer() -> Box<[usize; 512]> {
        Box::new([0; 512])
    }

    fn base_of(buffer: &mut [usize; 512], offset: usize) -> NonNull<u8> {
        NonNull::new(buffer.as_mut_ptr().cast::<u8>().wrapping_add(offset)).unwrap()
    }

    /// Builds a linked chain of headers at the given `(offset, size)` pairs
    /// and returns them.
    unsafe fn build_list(
        buffer: &mut [usize; 512],
        blocks: &[(usize, usize)],
    ) -> Vec<NonNull<BlockHeader>> {
        let mut headers = Vec::new();

        for &(offset, size) in blocks.iter().rev() {
            let next = headers.last().copied();
            headers.push(BlockHeader::create(base_of(buffer, offset), size, next));
        }

        headers.reverse();
        headers
    }

    #[test]
    fn create_writes_the_header_in_place() {
        let mut buffer = buffer();

        unsafe {
            let header = BlockHeader::create(base_of(&mut buffer, 0), 64, None);

            assert_eq!(header.as_ref().size, 64);
            assert_eq!(header.as_ref().next, None);
            assert_eq!(
                BlockHeader::content_address_of(header).as_ptr() as usize,
                header.as_ptr() as usize + BLOCK_HEADER_SIZE
            );
            assert_eq!(
                BlockHeader::from_content_address(BlockHeader::content_address_of(header)),
                header
            );
        }
    }

    #[test]
    fn null_head_fails_everywhere() {
        unsafe {
            assert_eq!(
                find_first_fit(None, 8).unwrap_err(),
                Failure::HeaderIsNull
            );
            assert_eq!(find_best_fit(None, 8).unwrap_err(), Failure::HeaderIsNull);
            assert_eq!(find_worst_fit(None, 8).unwrap_err(), Failure::HeaderIsNull);
            assert_eq!(find_prior(None, None).unwrap_err(), Failure::HeaderIsNull);
            assert_eq!(coalesce(None).unwrap_err(), Failure::HeaderIsNull);
            assert_eq!(
                release_list(None, |_| Ok(()), None).unwrap_err(),
                Failure::HeaderIsNull
            );
        }
    }

    #[test]
    fn zero_size_searches_are_invalid() {
        let mut buffer = buffer();

        unsafe {
            let head = Some(BlockHeader::create(base_of(&mut buffer, 0), 64, None));

            assert_eq!(find_first_fit(head, 0).unwrap_err(), Failure::InvalidSize);
            assert_eq!(find_best_fit(head, 0).unwrap_err(), Failure::InvalidSize);
        }
    }

    /// Payload sizes {3, 5, 4} plus headers, request of 4 plus header. Each
    /// policy picks a different target and prior.
    #[test]
    fn search_policies_pick_their_documented_targets() {
        let mut buffer = buffer();
        let request = BLOCK_HEADER_SIZE + 4;

        unsafe {
            let headers = build_list(
                &mut buffer,
                &[
                    (0, BLOCK_HEADER_SIZE + 3),
                    (64, BLOCK_HEADER_SIZE + 5),
                    (128, BLOCK_HEADER_SIZE + 4),
                ],
            );
            let head = Some(headers[0]);

            let first = find_first_fit(head, request).unwrap().unwrap();
            assert_eq!(first.header, headers[1]);
            assert_eq!(first.prev, Some(headers[0]));

            let best = find_best_fit(head, request).unwrap().unwrap();
            assert_eq!(best.header, headers[2]);
            assert_eq!(best.prev, Some(headers[1]));

            let worst = find_worst_fit(head, request).unwrap().unwrap();
            assert_eq!(worst.header, headers[1]);
            assert_eq!(worst.prev, Some(headers[0]));
        }
    }

    #[test]
    fn search_misses_return_none() {
        let mut buffer = buffer();

        unsafe {
            let head = Some(BlockHeader::create(
                base_of(&mut buffer, 0),
                BLOCK_HEADER_SIZE + 8,
                None,
            ));

            assert!(find_first_fit(head, 1024).unwrap().is_none());
            assert!(find_best_fit(head, 1024).unwrap().is_none());
            assert!(find_worst_fit(head, 1024).unwrap().is_none());
        }
    }

    #[test]
    fn best_fit_ties_break_to_the_earliest_block() {
        let mut buffer = buffer();

        unsafe {
            let headers = build_list(
                &mut buffer,
                &[
                    (0, BLOCK_HEADER_SIZE + 8),
                    (64, BLOCK_HEADER_SIZE + 8),
                ],
            );

            let best = find_best_fit(Some(headers[0]), BLOCK_HEADER_SIZE + 8)
                .unwrap()
                .unwrap();
            assert_eq!(best.header, headers[0]);
        }
    }

    #[test]
    fn find_prior_respects_address_order() {
        let mut buffer = buffer();

        unsafe {
            let headers = build_list(
                &mut buffer,
                &[(0, 32), (64, 32), (128, 32)],
            );
            let head = Some(headers[0]);

            // A block past the end of the list belongs after the last header.
            let past = Some(BlockHeader::create(base_of(&mut buffer, 256), 32, None));
            assert_eq!(find_prior(head, past).unwrap(), Some(headers[2]));

            // A block between the first two headers belongs after the first.
            let between = Some(BlockHeader::create(base_of(&mut buffer, 40), 16, None));
            assert_eq!(find_prior(head, between).unwrap(), Some(headers[0]));

            // A block before the head has no prior.
            assert_eq!(find_prior(Some(headers[1]), head).unwrap(), None);
        }
    }

    #[test]
    fn split_carves_an_aligned_prefix() {
        let mut buffer = buffer();

        unsafe {
            let block = BlockHeader::create(base_of(&mut buffer, 0), 128, None);

            let remainder = split(Some(block), 24, 16).unwrap().unwrap();

            // 24 aligned up to 16 is 32.
            assert_eq!(block.as_ref().size, 32);
            assert_eq!(block.as_ref().next, Some(remainder));
            assert_eq!(
                remainder.as_ptr() as usize,
                block.as_ptr() as usize + 32
            );
            assert_eq!(remainder.as_ref().size, 96);
            assert_eq!(remainder.as_ref().next, None);
        }
    }

    #[test]
    fn split_preserves_the_successor() {
        let mut buffer = buffer();

        unsafe {
            let tail = BlockHeader::create(base_of(&mut buffer, 256), 64, None);
            let block = BlockHeader::create(base_of(&mut buffer, 0), 128, Some(tail));

            let remainder = split(Some(block), 32, 8).unwrap().unwrap();

            assert_eq!(remainder.as_ref().next, Some(tail));
        }
    }

    #[test]
    fn split_refuses_when_the_remainder_cannot_host_a_block() {
        let mut buffer = buffer();

        unsafe {
            let block = BlockHeader::create(base_of(&mut buffer, 0), 64, None);

            // 48 bytes taken leaves 16, not enough for a header plus one
            // aligned payload byte.
            assert!(split(Some(block), 48, 8).unwrap().is_none());
            assert_eq!(block.as_ref().size, 64);
            assert_eq!(block.as_ref().next, None);
        }
    }

    #[test]
    fn split_rejects_bad_arguments() {
        let mut buffer = buffer();

        unsafe {
            let block = BlockHeader::create(base_of(&mut buffer, 0), 64, None);

            assert_eq!(split(None, 8, 8).unwrap_err(), Failure::HeaderIsNull);
            assert_eq!(split(Some(block), 0, 8).unwrap_err(), Failure::InvalidSize);
            assert_eq!(
                split(Some(block), 8, 3).unwrap_err(),
                Failure::InvalidAlignment
            );
            assert_eq!(
                split(Some(block), 8, 1).unwrap_err(),
                Failure::InvalidAlignment
            );
            assert_eq!(
                split(Some(block), 256, 8).unwrap_err(),
                Failure::BlockTooSmall
            );
        }
    }

    /// Three adjacent blocks collapse into one whose size is the sum of all
    /// payloads and headers; linked but non-adjacent blocks stay separate.
    #[test]
    fn coalesce_merges_adjacent_blocks_only() {
        let mut buffer1 = buffer();
        let size = BLOCK_HEADER_SIZE + 8;

        unsafe {
            let headers = build_list(
                &mut buffer1,
                &[(0, size), (size, size), (2 * size, size)],
            );

            coalesce(Some(headers[0])).unwrap();

            assert_eq!(headers[0].as_ref().size, 3 * 8 + 3 * BLOCK_HEADER_SIZE);
            assert_eq!(headers[0].as_ref().next, None);
        }

        let mut buffer2 = buffer();

        unsafe {
            // Linked, but with a gap in between.
            let headers = build_list(&mut buffer2, &[(0, size), (128, size)]);

            coalesce(Some(headers[0])).unwrap();

            assert_eq!(headers[0].as_ref().size, size);
            assert_eq!(headers[0].as_ref().next, Some(headers[1]));
        }
    }

    #[test]
    fn coalesce_is_idempotent() {
        let mut buffer = buffer();
        let size = BLOCK_HEADER_SIZE + 8;

        unsafe {
            let headers = build_list(&mut buffer, &[(0, size), (size, size)]);

            coalesce(Some(headers[0])).unwrap();
            let merged_size = headers[0].as_ref().size;

            coalesce(Some(headers[0])).unwrap();
            assert_eq!(headers[0].as_ref().size, merged_size);
            assert_eq!(headers[0].as_ref().next, None);
        }
    }

    /// Splitting a block and coalescing the two results restores the original.
    #[test]
    fn split_is_left_inverse_of_coalesce() {
        let mut buffer = buffer();

        unsafe {
            let block = BlockHeader::create(base_of(&mut buffer, 0), 128, None);

            split(Some(block), 32, 8).unwrap().unwrap();
            coalesce(Some(block)).unwrap();

            assert_eq!(block.as_ref().size, 128);
            assert_eq!(block.as_ref().next, None);
        }
    }

    #[test]
    fn release_list_visits_every_block_until_the_sentinel() {
        let mut buffer = buffer();

        unsafe {
            let headers = build_list(&mut buffer, &[(0, 32), (64, 32), (128, 32)]);

            let mut visited = Vec::new();
            release_list(
                Some(headers[0]),
                |bytes| {
                    visited.push(bytes.as_ptr() as usize);
                    Ok(())
                },
                None,
            )
            .unwrap();

            assert_eq!(
                visited,
                headers.iter().map(|h| h.as_ptr() as usize).collect::<Vec<_>>()
            );

            // Stop early at a sentinel.
            let mut count = 0;
            release_list(
                Some(headers[0]),
                |_| {
                    count += 1;
                    Ok(())
                },
                Some(headers[2]),
            )
            .unwrap();
            assert_eq!(count, 2);
        }
    }

    #[test]
    fn release_list_propagates_callback_failures() {
        let mut buffer = buffer();

        unsafe {
            let headers = build_list(&mut buffer, &[(0, 32), (64, 32)]);

            let result = release_list(
                Some(headers[0]),
                |_| Err(Failure::ReleaseFailed),
                None,
            );

            assert_eq!(result.unwrap_err(), Failure::ReleaseFailed);
        }
    }
}
