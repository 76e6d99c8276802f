//! Segregated freelist allocator (C3): `pmalloc`/`pcalloc`/`pfree` layered
//! on top of the carrier manager (C2), with in-band prefix headers and one
//! LIFO freelist per power-of-two size class.
//!
//! `AllocatorState` is the single struct persisted verbatim by the
//! checkpoint/restore protocol (C4) — see spec.md §3 "Allocator state" and
//! §3 "Dump file". Its layout must stay `#[repr(C)]` and free of padding
//! surprises: every byte is written to and read back from the dump file.

use crate::addr_policy::{is_nvm_range, size_class_bytes, size_class_of, ADDR_MIN, MAX_CARRIER_COUNT, NUM_CLASSES};
use crate::carrier::Carrier;
use crate::error::NvmError;
use crate::prefix::{BlockPrefix, PREFIX_SIZE};

#[repr(C)]
pub struct AllocatorState {
    pub root: usize,
    pub next_free_address: usize,
    pub next_free_carrier: usize,
    pub carriers: [Carrier; MAX_CARRIER_COUNT],
    pub freelist: [usize; NUM_CLASSES],
}

impl AllocatorState {
    /// A zeroed state with `next_free_address` seeded to `ADDR_MIN`, as
    /// produced by the owning process's first `pinit` (spec.md §4.4 step 1).
    pub fn fresh() -> Self {
        AllocatorState {
            root: 0,
            next_free_address: ADDR_MIN,
            next_free_carrier: 0,
            carriers: [Carrier::default(); MAX_CARRIER_COUNT],
            freelist: [0; NUM_CLASSES],
        }
    }

    /// `pmalloc`: allocates `sz` user bytes, or `None` on carrier-allocation
    /// failure.
    pub fn pmalloc(&mut self, sz: usize) -> Option<usize> {
        let nsize = sz + PREFIX_SIZE;
        let k = size_class_of(nsize);
        assert!(nsize <= crate::addr_policy::MAX_ALLOC_SIZE, "nvmalloc: pmalloc request too large");
        assert!(k < NUM_CLASSES, "nvmalloc: pmalloc size class out of range");

        if self.freelist[k] == 0 {
            if self.refill(k).is_err() {
                return None;
            }
        }

        let prefix_addr = self.freelist[k];
        let prefix = unsafe { BlockPrefix::read_at(prefix_addr) };
        self.freelist[k] = prefix.next;
        Some(BlockPrefix::user_ptr(prefix_addr))
    }

    /// `pcalloc`: `pmalloc(n * size)` followed by a zero-fill. The product
    /// is not checked for overflow — the core never checked it either
    /// (spec.md §4.3); callers must validate.
    pub fn pcalloc(&mut self, n: usize, size: usize) -> Option<usize> {
        let total = n * size;
        let ptr = self.pmalloc(total)?;
        unsafe {
            core::ptr::write_bytes(ptr as *mut u8, 0, total);
        }
        Some(ptr)
    }

    /// `pfree`: pushes the block's prefix onto its size class's freelist.
    /// No coalescing, no liveness check — a double free silently corrupts
    /// the freelist, exactly as documented in spec.md §4.3.
    pub fn pfree(&mut self, ptr: usize) {
        if ptr == 0 {
            return;
        }
        assert!(is_nvm_range(ptr), "nvmalloc: pfree called on a non-NVM pointer");
        let prefix_addr = BlockPrefix::prefix_of(ptr);
        let prefix = unsafe { BlockPrefix::read_at(prefix_addr) };
        let flpos = prefix.flpos as usize;
        unsafe {
            BlockPrefix::write_at(prefix_addr, flpos, self.freelist[flpos]);
        }
        self.freelist[flpos] = prefix_addr;
    }

    pub fn pset_root(&mut self, p: usize) {
        self.root = p;
    }

    pub fn pget_root(&self) -> usize {
        self.root
    }

    /// Cuts exactly one new block of class `k` from a carrier with enough
    /// room, allocating a fresh carrier if none qualifies, and pushes it
    /// onto `freelist[k]`. Only one block is cut per refill; the caller
    /// immediately pops it.
    fn refill(&mut self, k: usize) -> Result<(), NvmError> {
        let size = size_class_bytes(k);
        let carrier_index = match self.find_carrier(size) {
            Some(i) => i,
            None => self.allocate_carrier(size)?,
        };

        let carrier = &mut self.carriers[carrier_index];
        let addr = carrier.next_address();
        unsafe {
            BlockPrefix::write_at(addr, k, self.freelist[k]);
        }
        self.freelist[k] = addr;
        carrier.available -= size;
        Ok(())
    }
}
