use thiserror::Error;

/// Shorter syntax for the return type used all over the public surface.
pub type Result<T> = std::result::Result<T, Error>;

/// Every error an allocator in this crate can surface. The taxonomy is flat
/// on purpose: call sites can retry with different inputs ([`InvalidInput`],
/// [`SizeRequestTooLarge`]) or accommodate exhaustion ([`NoFreeBlock`],
/// [`ReachedMemoryLimit`], [`OutOfMemory`]); everything that indicates a bug
/// inside the crate collapses into [`Internal`].
///
/// [`InvalidInput`]: Error::InvalidInput
/// [`SizeRequestTooLarge`]: Error::SizeRequestTooLarge
/// [`NoFreeBlock`]: Error::NoFreeBlock
/// [`ReachedMemoryLimit`]: Error::ReachedMemoryLimit
/// [`OutOfMemory`]: Error::OutOfMemory
/// [`Internal`]: Error::Internal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// Zero size, non power of two or sub-word alignment, or a pointer that
    /// does not belong to the allocator it was handed to.
    #[error("invalid size, alignment or pointer in request")]
    InvalidInput,

    /// The request can never fit in a block of the configured size.
    #[error("request exceeds the configured block size")]
    SizeRequestTooLarge,

    /// The configured capacity is exhausted. Distinct from [`Error::OutOfMemory`]:
    /// the OS may have plenty of memory left, the allocator just isn't allowed
    /// to ask for more.
    #[error("configured memory limit reached")]
    ReachedMemoryLimit,

    /// No free region of sufficient size right now.
    #[error("no free block large enough to satisfy the request")]
    NoFreeBlock,

    /// The operating system refused to map more pages.
    #[error("out of memory")]
    OutOfMemory,

    /// The allocator does not implement this operation, e.g. per-allocation
    /// release on a bump allocator.
    #[error("operation not supported by this allocator")]
    OperationNotSupported,

    /// An internal invariant was violated. Observable but not actionable.
    #[error("internal allocator invariant violated")]
    Internal,
}

/// Failures of the block and platform layers. These never escape the crate:
/// strategies and providers map them to [`Error`] at their boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub(crate) enum Failure {
    #[error("block header is null")]
    HeaderIsNull,

    #[error("size must be non-zero")]
    InvalidSize,

    #[error("alignment must be a power of two and at least word size")]
    InvalidAlignment,

    #[error("block is too small for the requested bytes")]
    BlockTooSmall,

    #[error("the operating system refused to map pages")]
    AllocationFailed,

    #[error("the operating system failed to unmap pages")]
    ReleaseFailed,
}

impl From<Failure> for Error {
    fn from(failure: Failure) -> Self {
        match failure {
            Failure::AllocationFailed => Error::OutOfMemory,
            _ => Error::Internal,
        }
    }
}
