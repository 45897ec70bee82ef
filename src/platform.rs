use std::ptr::NonNull;

use crate::{error::Failure, range::VirtualAddressRange, Pointer};

/// Virtual memory page size in bytes. Apple Silicon uses 16 KiB pages, every
/// other supported platform uses 4 KiB. Providers advertise this as their
/// block size, so it has to be known at compile time instead of asking the
/// kernel at runtime.
pub(crate) const PAGE_SIZE: usize =
    if cfg!(all(target_vendor = "apple", target_arch = "aarch64")) {
        1 << 14
    } else {
        1 << 12
    };

/// Abstraction for platform specific memory handling. Providers only need to
/// request whole pages of memory and return them back when they are no longer
/// in use, they don't care about the APIs offered by the underlying kernel or
/// libraries.
trait PlatformSpecificMemory {
    /// Requests a memory region from the kernel where `length` bytes can be
    /// written safely.
    unsafe fn request_memory(length: usize) -> Pointer<u8>;

    /// Attempts to return `length` bytes starting from `address` to the
    /// underlying kernel. Returns whether the kernel accepted.
    unsafe fn return_memory(address: NonNull<u8>, length: usize) -> bool;
}

/// Zero sized type that implements [`PlatformSpecificMemory`] for each OS.
struct Platform;

/// Maps `count` fresh pages. The returned range is page aligned, readable and
/// writable, and owned by the caller until [`return_pages`].
pub(crate) fn fetch_pages(count: usize) -> Result<VirtualAddressRange, Failure> {
    if count == 0 {
        return Err(Failure::InvalidSize);
    }

    match unsafe { Platform::request_memory(count * PAGE_SIZE) } {
        Some(base) => Ok(VirtualAddressRange::new(base, count)),
        None => Err(Failure::AllocationFailed),
    }
}

/// Releases a mapping previously obtained from [`fetch_pages`]. Releasing the
/// same range twice is a defect.
pub(crate) fn return_pages(range: VirtualAddressRange) -> Result<(), Failure> {
    let Some(base) = range.base else {
        return Err(Failure::ReleaseFailed);
    };

    if unsafe { Platform::return_memory(base, range.size()) } {
        Ok(())
    } else {
        Err(Failure::ReleaseFailed)
    }
}

#[cfg(unix)]
#[cfg(not(miri))]
mod unix {
    use std::ptr::{self, NonNull};

    use super::{Platform, PlatformSpecificMemory};
    use crate::Pointer;

    impl PlatformSpecificMemory for Platform {
        unsafe fn request_memory(length: usize) -> Pointer<u8> {
            // Memory protection. Read-Write only.
            let protection = libc::PROT_READ | libc::PROT_WRITE;

            // Memory should be private to our process and not mapped to any file.
            let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

            // For all the configuration options that `mmap` accepts see
            // https://man7.org/linux/man-pages/man2/mmap.2.html
            match libc::mmap(ptr::null_mut(), length, protection, flags, -1, 0) {
                libc::MAP_FAILED => None,
                address => Some(NonNull::new_unchecked(address).cast()),
            }
        }

        unsafe fn return_memory(address: NonNull<u8>, length: usize) -> bool {
            libc::munmap(address.cast().as_ptr(), length) == 0
        }
    }
}

#[cfg(windows)]
#[cfg(not(miri))]
mod windows {
    use std::ptr::NonNull;

    use windows::Win32::System::Memory;

    use super::{Platform, PlatformSpecificMemory};
    use crate::Pointer;

    impl PlatformSpecificMemory for Platform {
        unsafe fn request_memory(length: usize) -> Pointer<u8> {
            // Similar to mmap on Linux, Read-Write only.
            let protection = Memory::PAGE_READWRITE;

            // This works a little bit different from mmap, memory has to be
            // reserved first and then committed in order to become usable. We
            // can do both at the same time with one single call.
            let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;

            // For more detailed explanations of each parameter, see
            // https://learn.microsoft.com/en-us/windows/win32/api/memoryapi/nf-memoryapi-virtualalloc#parameters
            let address = Memory::VirtualAlloc(None, length, flags, protection);

            NonNull::new(address.cast())
        }

        unsafe fn return_memory(address: NonNull<u8>, _length: usize) -> bool {
            // We can skip decommitting by specifying length of 0 and the
            // MEM_RELEASE flag. See the docs for details:
            // https://learn.microsoft.com/en-us/windows/win32/api/memoryapi/nf-memoryapi-virtualfree#parameters
            let address = address.cast().as_ptr();
            let length = 0;
            let flags = Memory::MEM_RELEASE;

            Memory::VirtualFree(address, length, flags).as_bool()
        }
    }
}

#[cfg(miri)]
mod miri {
    //! When using Miri, we can't rely on system calls such as `mmap` because
    //! there's no FFI support, so instead we'll use the global allocator to
    //! mock low level memory management. This is also useful for detecting
    //! memory leaks in our own allocators (pages that are never returned back
    //! to the kernel).

    use std::{alloc, ptr::NonNull};

    use super::{Platform, PlatformSpecificMemory, PAGE_SIZE};
    use crate::Pointer;

    fn to_layout(length: usize) -> alloc::Layout {
        alloc::Layout::from_size_align(length, PAGE_SIZE).unwrap()
    }

    impl PlatformSpecificMemory for Platform {
        unsafe fn request_memory(length: usize) -> Pointer<u8> {
            NonNull::new(alloc::alloc_zeroed(to_layout(length)))
        }

        unsafe fn return_memory(address: NonNull<u8>, length: usize) -> bool {
            alloc::dealloc(address.as_ptr(), to_layout(length));
            true
        }
    }
}
