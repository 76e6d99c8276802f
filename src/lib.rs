//! `nvmalloc`: a persistent memory allocator that presents a conventional
//! allocate/free/set-root/get-root interface over a fixed region of virtual
//! address space treated as non-volatile memory.
//!
//! The allocator is single-threaded, single-mutator (spec.md §5): nothing
//! here takes a lock to arbitrate *concurrent* callers, only to give the
//! process-wide singleton interior mutability. A checkpoint (`pdump`)
//! serializes allocator state and every live carrier's bytes to a file; a
//! later `pinit` against the same file remaps each carrier at its original
//! address so pointer-bearing structures built on top of this allocator
//! (see `demos/linked_list.rs`) come back valid with no pointer-swizzling.

#[macro_use]
extern crate lazy_static;

pub mod addr_policy;
pub mod allocator;
pub mod carrier;
pub mod error;
pub mod mmap;
pub mod prefix;
pub mod shared_ctrl;

use error::fatal;
use shared_ctrl::NvmAllocator;
use std::ffi::c_void;
use std::ptr;
use std::sync::Mutex;

/// A raw NVM pointer, matching the library's C-style `void *` surface.
pub type Ptr = *mut c_void;
pub const NULL_PTR: Ptr = ptr::null_mut();

struct Singleton {
    id: String,
    allocator: NvmAllocator,
}

lazy_static! {
    static ref SINGLETON: Mutex<Option<Singleton>> = Mutex::new(None);
}

#[inline]
fn ptr_to_addr(p: Ptr) -> usize {
    p as usize
}

#[inline]
fn addr_to_ptr(addr: usize) -> Ptr {
    addr as Ptr
}

/// `pinit(id)`: restores or creates the allocator for this process. Calling
/// again with the same `id` is a no-op (spec.md §4.4: "idempotent across
/// calls within one process"); calling with a different `id` is a
/// programmer error. Fatal on shared-memory/mmap failure.
pub fn pinit(id: &str) {
    let mut guard = SINGLETON.lock().unwrap();
    if let Some(existing) = guard.as_ref() {
        assert_eq!(
            existing.id, id,
            "nvmalloc: pinit called twice in one process with different ids"
        );
        return;
    }
    match NvmAllocator::pinit(id) {
        Ok(allocator) => {
            *guard = Some(Singleton { id: id.to_string(), allocator });
        }
        Err(e) => fatal(e),
    }
}

fn with_allocator<R>(f: impl FnOnce(&mut NvmAllocator) -> R) -> R {
    let mut guard = SINGLETON.lock().unwrap();
    let singleton = guard
        .as_mut()
        .expect("nvmalloc: API called before pinit()");
    f(&mut singleton.allocator)
}

/// `pmalloc(sz)`: allocates `sz` user bytes, or `NULL_PTR` if no carrier
/// could be allocated to satisfy the request.
pub fn pmalloc(sz: usize) -> Ptr {
    with_allocator(|a| a.pmalloc(sz).map(addr_to_ptr).unwrap_or(NULL_PTR))
}

/// `pcalloc(n, sz)`: `pmalloc(n * sz)` zero-filled. The product is not
/// checked for overflow; callers must validate.
pub fn pcalloc(n: usize, sz: usize) -> Ptr {
    with_allocator(|a| a.pcalloc(n, sz).map(addr_to_ptr).unwrap_or(NULL_PTR))
}

/// `pfree(p)`: a no-op on `NULL_PTR`. Asserts `p` is in the NVM range
/// otherwise. Does not check that `p` was actually live — a double free
/// silently corrupts the freelist, as documented in spec.md §4.3.
pub fn pfree(p: Ptr) {
    if p == NULL_PTR {
        return;
    }
    with_allocator(|a| a.pfree(ptr_to_addr(p)));
}

/// `pset_root(p)`: stores `p` as the allocator's user-visible root pointer.
/// Not dereferenced or range-checked by the allocator itself.
pub fn pset_root(p: Ptr) {
    with_allocator(|a| a.pset_root(ptr_to_addr(p)));
}

/// `pget_root()`: returns the stored root pointer.
pub fn pget_root() -> Ptr {
    with_allocator(|a| addr_to_ptr(a.pget_root()))
}

/// `pdump()`: persists allocator state and every live carrier's used bytes
/// to the dump file named at `pinit`. Fatal if `root` is null or on I/O
/// failure; a no-op for a process that only attached to another's shared
/// control block.
pub fn pdump() {
    if let Err(e) = with_allocator(|a| a.pdump()) {
        fatal(e);
    }
}
