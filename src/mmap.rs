//! Thin wrappers over the handful of `mmap(2)` calls the allocator needs:
//! a hinted anonymous mapping (carrier allocation, §4.2) and a fixed,
//! must-land-here-or-fail mapping (carrier restore, §4.4).

use crate::Ptr;
use core::ptr;
use errno::errno;
use libc::*;

/// Requests a private anonymous mapping of `size` bytes, hinting `addr`.
/// The kernel may honor the hint or return a different address; the caller
/// (the carrier manager) decides whether the result is acceptable.
pub fn mmap_hint(addr: usize, size: usize) -> Result<usize, errno::Errno> {
    let ptr = unsafe {
        mmap(
            addr as *mut c_void,
            size as size_t,
            PROT_READ | PROT_WRITE,
            MAP_PRIVATE | MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr == MAP_FAILED {
        return Err(errno());
    }
    Ok(ptr as usize)
}

/// Requests a private anonymous mapping of `size` bytes at exactly `addr`.
/// Used only during dump restore, where pointer-bearing data structures in
/// the dumped bytes assume the carrier reappears at its original address.
pub fn mmap_fixed(addr: usize, size: usize) -> Result<usize, errno::Errno> {
    let ptr = unsafe {
        mmap(
            addr as *mut c_void,
            size as size_t,
            PROT_READ | PROT_WRITE,
            MAP_PRIVATE | MAP_ANONYMOUS | MAP_FIXED,
            -1,
            0,
        )
    };
    if ptr == MAP_FAILED {
        return Err(errno());
    }
    Ok(ptr as usize)
}

pub fn munmap_memory(addr: usize, size: usize) {
    unsafe {
        munmap(addr as Ptr, size);
    }
}

pub fn page_size() -> usize {
    unsafe { sysconf(_SC_PAGESIZE) as usize }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn hinted_mapping_is_usable() {
        let size = page_size();
        let addr = mmap_hint(0, size).expect("mmap should succeed");
        unsafe {
            ptr::write(addr as *mut usize, 0xdead_beef);
            assert_eq!(ptr::read(addr as *const usize), 0xdead_beef);
        }
        munmap_memory(addr, size);
    }

    #[test]
    fn fixed_mapping_lands_at_requested_address() {
        let size = page_size();
        // First reserve an address with a hinted mapping, release it, then
        // immediately demand it back with MAP_FIXED. Not airtight against a
        // racing allocation from elsewhere in the process, but good enough
        // to exercise the MAP_FIXED path deterministically in a test.
        let addr = mmap_hint(0, size).expect("hinted mmap should succeed");
        munmap_memory(addr, size);
        let refixed = mmap_fixed(addr, size).expect("fixed mmap should succeed");
        assert_eq!(refixed, addr);
        munmap_memory(addr, size);
    }
}
