//! The page mapper: the allocator's only external collaborator. The
//! allocator requests page-aligned slabs of memory and, for oversize
//! requests under the delegating policy, forwards whole allocations here.
//! It doesn't care which kernel API is underneath, so the seam is a trait
//! and each OS gets its own module. There's also a Miri implementation that
//! mocks the whole thing with the global allocator, because Miri has no FFI
//! support.

use std::ptr::{self, NonNull};

use crate::Pointer;

/// Operations the allocator needs from the OS page mapper. Implementations
/// hand out page-aligned memory and never get any of it back except through
/// [`PageMapper::unmap`].
pub trait PageMapper {
    /// Maps `length` bytes aligned to `alignment` (a power of two). Returns
    /// `None` when the kernel is out of memory.
    ///
    /// # Safety
    ///
    /// No preconditions, but the returned memory is uninitialised.
    unsafe fn map(&self, length: usize, alignment: usize) -> Pointer<u8>;

    /// Returns a mapping to the kernel. `length` must be the value the
    /// mapping was created with.
    ///
    /// # Safety
    ///
    /// `address` must come from [`PageMapper::map`] on this same mapper and
    /// must not be used afterwards.
    unsafe fn unmap(&self, address: NonNull<u8>, length: usize);

    /// Resizes a mapping from `old_length` to `new_length` bytes. When
    /// `may_move` is false the mapping must keep its address; the default
    /// implementation then only succeeds if both lengths round to the same
    /// number of pages. When movement is permitted it falls back to
    /// map-copy-unmap. Returns the (possibly moved) address, or `None` on
    /// failure, in which case the old mapping is untouched.
    ///
    /// # Safety
    ///
    /// Same contract as [`PageMapper::unmap`] for `address` and
    /// `old_length`.
    unsafe fn realloc(
        &self,
        address: NonNull<u8>,
        old_length: usize,
        new_length: usize,
        may_move: bool,
    ) -> Pointer<u8> {
        let pages = |length: usize| length.div_ceil(self.page_size());

        if pages(new_length) == pages(old_length) {
            return Some(address);
        }

        if !may_move {
            return None;
        }

        let new_address = self.map(new_length, self.page_size())?;
        ptr::copy_nonoverlapping(
            address.as_ptr(),
            new_address.as_ptr(),
            old_length.min(new_length),
        );
        self.unmap(address, old_length);

        Some(new_address)
    }

    /// Virtual memory page size in bytes.
    fn page_size(&self) -> usize;
}

/// Zero sized type that implements [`PageMapper`] on top of whatever the
/// current OS offers. This is the default mapper every allocator uses
/// unless a custom one is plugged in.
#[derive(Clone, Copy, Debug, Default)]
pub struct Platform;

/// Virtual memory page size. 4096 bytes on most computers. This should be a
/// constant but we don't know the value at compile time.
static mut PAGE_SIZE: usize = 0;

/// We only know the page size at runtime by calling into the OS, so we ask
/// once and cache it in a global. Races are not a concern, every writer
/// stores the same value.
#[inline]
pub(crate) fn page_size() -> usize {
    unsafe {
        if PAGE_SIZE == 0 {
            PAGE_SIZE = os_page_size();
        }

        PAGE_SIZE
    }
}

/// Rounds `length` up to a whole number of pages. Mapping syscalls deal in
/// pages no matter what we ask for, so all our length bookkeeping does the
/// same rounding.
#[inline]
pub(crate) fn round_to_pages(length: usize) -> usize {
    let page = page_size();
    (length + page - 1) & !(page - 1)
}

impl PageMapper for Platform {
    unsafe fn map(&self, length: usize, alignment: usize) -> Pointer<u8> {
        let length = round_to_pages(length);

        if alignment <= page_size() {
            return os_map(length);
        }

        // The kernel only promises page alignment, so for anything stricter
        // we over-map by one alignment unit and trim the excess. `alignment`
        // is a power of two above the page size, which makes both trims a
        // whole number of pages.
        os_map_aligned(length, alignment)
    }

    unsafe fn unmap(&self, address: NonNull<u8>, length: usize) {
        os_unmap(address, round_to_pages(length));
    }

    fn page_size(&self) -> usize {
        page_size()
    }
}

#[cfg(unix)]
#[cfg(not(miri))]
mod unix {
    use std::ptr::{self, NonNull};

    use libc;

    use crate::Pointer;

    pub(super) unsafe fn os_page_size() -> usize {
        libc::sysconf(libc::_SC_PAGE_SIZE) as usize
    }

    pub(super) unsafe fn os_map(length: usize) -> Pointer<u8> {
        // Read-write, private to our process, not backed by any file. See
        // https://man7.org/linux/man-pages/man2/mmap.2.html
        let protection = libc::PROT_READ | libc::PROT_WRITE;
        let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

        match libc::mmap(ptr::null_mut(), length, protection, flags, -1, 0) {
            libc::MAP_FAILED => None,
            address => Some(NonNull::new_unchecked(address).cast()),
        }
    }

    pub(super) unsafe fn os_unmap(address: NonNull<u8>, length: usize) {
        if libc::munmap(address.cast().as_ptr(), length) != 0 {
            // Nothing sensible to do. The mapping is still there, so it will
            // simply be leaked.
        }
    }

    pub(super) unsafe fn os_map_aligned(length: usize, alignment: usize) -> Pointer<u8> {
        let padded = length + alignment;
        let base = os_map(padded)?;

        let base_address = base.as_ptr() as usize;
        let aligned_address = (base_address + alignment - 1) & !(alignment - 1);

        let lead = aligned_address - base_address;
        if lead > 0 {
            os_unmap(base, lead);
        }

        let tail = padded - lead - length;
        if tail > 0 {
            let tail_start = NonNull::new_unchecked((aligned_address + length) as *mut u8);
            os_unmap(tail_start, tail);
        }

        Some(NonNull::new_unchecked(aligned_address as *mut u8))
    }
}

#[cfg(windows)]
#[cfg(not(miri))]
mod windows {
    use std::{mem::MaybeUninit, ptr::NonNull};

    use windows::Win32::System::{Memory, SystemInformation};

    use crate::Pointer;

    pub(super) unsafe fn os_page_size() -> usize {
        let mut system_info = MaybeUninit::uninit();
        SystemInformation::GetSystemInfo(system_info.as_mut_ptr());

        system_info.assume_init().dwPageSize as usize
    }

    pub(super) unsafe fn os_map(length: usize) -> Pointer<u8> {
        // Reserve and commit in one call, read-write. See
        // https://learn.microsoft.com/en-us/windows/win32/api/memoryapi/nf-memoryapi-virtualalloc
        let protection = Memory::PAGE_READWRITE;
        let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;

        NonNull::new(Memory::VirtualAlloc(None, length, flags, protection).cast())
    }

    pub(super) unsafe fn os_unmap(address: NonNull<u8>, _length: usize) {
        // Length 0 with MEM_RELEASE releases the whole allocation. See
        // https://learn.microsoft.com/en-us/windows/win32/api/memoryapi/nf-memoryapi-virtualfree
        let address = address.cast().as_ptr();

        if !Memory::VirtualFree(address, 0, Memory::MEM_RELEASE).as_bool() {
            // Same situation as munmap failing on unix, the memory leaks.
        }
    }

    pub(super) unsafe fn os_map_aligned(length: usize, alignment: usize) -> Pointer<u8> {
        // VirtualFree can't trim a reservation, so instead we reserve an
        // oversized region to find an aligned address, release the whole
        // thing, and commit at exactly that address. Another thread can
        // steal the address in between, hence the retry loop.
        for _ in 0..8 {
            let probe = Memory::VirtualAlloc(
                None,
                length + alignment,
                Memory::MEM_RESERVE,
                Memory::PAGE_READWRITE,
            );

            if probe.is_null() {
                return None;
            }

            let aligned = (probe as usize + alignment - 1) & !(alignment - 1);
            Memory::VirtualFree(probe, 0, Memory::MEM_RELEASE);

            let committed = Memory::VirtualAlloc(
                Some(aligned as *const _),
                length,
                Memory::MEM_RESERVE | Memory::MEM_COMMIT,
                Memory::PAGE_READWRITE,
            );

            if !committed.is_null() {
                return Some(NonNull::new_unchecked(committed.cast()));
            }
        }

        None
    }
}

#[cfg(miri)]
mod miri {
    //! When using Miri we can't rely on system calls such as `mmap` because
    //! there's no FFI support, so the global allocator mocks low level
    //! memory management. A registry keeps the exact layout of every
    //! mapping because `dealloc` demands it back, while the real interface
    //! only remembers lengths.

    use std::{alloc, ptr::NonNull, sync::Mutex};

    use crate::Pointer;

    static MAPPINGS: Mutex<Vec<(usize, alloc::Layout)>> = Mutex::new(Vec::new());

    pub(super) unsafe fn os_page_size() -> usize {
        4096
    }

    pub(super) unsafe fn os_map(length: usize) -> Pointer<u8> {
        os_map_aligned(length, super::page_size())
    }

    pub(super) unsafe fn os_unmap(address: NonNull<u8>, _length: usize) {
        let mut mappings = MAPPINGS.lock().unwrap();
        let index = mappings
            .iter()
            .position(|(start, _)| *start == address.as_ptr() as usize)
            .expect("unmapping an address that was never mapped");

        let (_, layout) = mappings.swap_remove(index);
        alloc::dealloc(address.as_ptr(), layout);
    }

    pub(super) unsafe fn os_map_aligned(length: usize, alignment: usize) -> Pointer<u8> {
        let layout = alloc::Layout::from_size_align(length, alignment).ok()?;
        let address = NonNull::new(alloc::alloc(layout))?;

        MAPPINGS
            .lock()
            .unwrap()
            .push((address.as_ptr() as usize, layout));

        Some(address)
    }
}

#[cfg(miri)]
use miri::{os_map, os_map_aligned, os_page_size, os_unmap};
#[cfg(unix)]
#[cfg(not(miri))]
use unix::{os_map, os_map_aligned, os_page_size, os_unmap};
#[cfg(windows)]
#[cfg(not(miri))]
use windows::{os_map, os_map_aligned, os_page_size, os_unmap};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_write_unmap() {
        unsafe {
            let length = page_size() * 2;
            let address = Platform.map(length, 1).unwrap();

            for i in 0..length {
                *address.as_ptr().add(i) = (i % 256) as u8;
            }
            for i in 0..length {
                assert_eq!(*address.as_ptr().add(i), (i % 256) as u8);
            }

            Platform.unmap(address, length);
        }
    }

    #[test]
    fn map_honours_alignments_above_the_page_size() {
        unsafe {
            let alignment = page_size() * 4;
            let address = Platform.map(page_size(), alignment).unwrap();

            assert_eq!(address.as_ptr() as usize % alignment, 0);

            *address.as_ptr() = 42;
            assert_eq!(*address.as_ptr(), 42);

            Platform.unmap(address, page_size());
        }
    }

    #[test]
    fn realloc_within_the_same_page_span_keeps_the_address() {
        unsafe {
            let address = Platform.map(4096, 1).unwrap();

            assert_eq!(Platform.realloc(address, 4096, 4000, false), Some(address));
            assert_eq!(Platform.realloc(address, 4000, 4096, true), Some(address));

            Platform.unmap(address, 4096);
        }
    }

    #[test]
    fn realloc_growing_past_the_span_needs_permission_to_move() {
        unsafe {
            let length = page_size();
            let address = Platform.map(length, 1).unwrap();
            *address.as_ptr() = 7;

            assert_eq!(Platform.realloc(address, length, length * 3, false), None);

            let moved = Platform.realloc(address, length, length * 3, true).unwrap();
            assert_eq!(*moved.as_ptr(), 7);

            Platform.unmap(moved, length * 3);
        }
    }
}
