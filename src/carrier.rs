//! Carrier manager (C2): reserves large anonymous regions at deterministic
//! addresses inside the NVM window and tracks how much of each is still
//! available to bump-allocate from.

use crate::addr_policy::{is_nvm_range, ADDR_MAX, ADDR_MIN, MAX_CARRIER_COUNT, MAX_SKIP_SIZE, MIN_CARRIER_SIZE, MIN_SKIP_SIZE};
use crate::allocator::AllocatorState;
use crate::error::NvmError;
use crate::mmap::{mmap_hint, munmap_memory};

/// A contiguous span of pages mapped anonymous-private at a fixed address
/// inside the NVM window. Bytes are handed out from the high end downward:
/// `end_addr - available` is the next bump-allocation address, and
/// `start_addr .. end_addr - available` is the carrier's used prefix.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct Carrier {
    pub start_addr: usize,
    pub end_addr: usize,
    pub available: usize,
}

impl Carrier {
    #[inline]
    pub fn size(&self) -> usize {
        self.end_addr - self.start_addr
    }

    /// Address the next bump allocation out of this carrier would use.
    #[inline]
    pub fn next_address(&self) -> usize {
        self.end_addr - self.available
    }

    /// Bytes already bump-allocated out of this carrier (its used prefix).
    #[inline]
    pub fn used_bytes(&self) -> usize {
        self.size() - self.available
    }
}

impl AllocatorState {
    /// Reserves a new carrier of at least `requested_size` bytes at
    /// `next_free_address`, retrying with a geometrically growing skip on
    /// collision with memory already owned by the host process. Returns
    /// the index of the new carrier in `self.carriers`.
    pub(crate) fn allocate_carrier(&mut self, requested_size: usize) -> Result<usize, NvmError> {
        let nsize = requested_size.max(MIN_CARRIER_SIZE);

        assert!(
            self.next_free_address >= ADDR_MIN
                && self.next_free_address + requested_size < ADDR_MAX,
            "nvmalloc: next_free_address would overflow the NVM window"
        );

        let mut skip = MIN_SKIP_SIZE;
        loop {
            let hint = self.next_free_address;
            log::debug!(
                "nvmalloc: allocate_carrier: requesting {} bytes at 0x{:x}",
                nsize,
                hint
            );
            let addr = match mmap_hint(hint, nsize) {
                Ok(addr) => addr,
                Err(e) => {
                    log::warn!("nvmalloc: allocate_carrier: mmap failed: {}", e);
                    return Err(NvmError::CarrierMapFailed { size: nsize, source: e });
                }
            };

            if addr != hint && !is_nvm_range(addr) {
                log::debug!(
                    "nvmalloc: allocate_carrier: collision, got 0x{:x}, skipping {} bytes",
                    addr,
                    skip
                );
                munmap_memory(addr, nsize);
                self.next_free_address += skip;
                skip = (skip.saturating_mul(2)).min(MAX_SKIP_SIZE);
                continue;
            }

            // Progress is guaranteed even when the OS handed back a
            // different (but in-window) address: next_free_address always
            // advances by nsize.
            self.next_free_address += nsize;

            if self.next_free_carrier >= MAX_CARRIER_COUNT {
                return Err(NvmError::CarrierCountExhausted { max: MAX_CARRIER_COUNT });
            }
            let index = self.next_free_carrier;
            self.carriers[index] = Carrier {
                start_addr: addr,
                end_addr: addr + nsize,
                available: nsize,
            };
            self.next_free_carrier += 1;

            log::debug!(
                "nvmalloc: allocate_carrier: carrier {} at 0x{:x}..0x{:x}",
                index,
                addr,
                addr + nsize
            );
            return Ok(index);
        }
    }

    /// Linear scan for the first (oldest) carrier with at least `size`
    /// bytes still available.
    pub(crate) fn find_carrier(&self, size: usize) -> Option<usize> {
        self.carriers[..self.next_free_carrier]
            .iter()
            .position(|c| c.available >= size)
    }
}
