//! Shared control block and checkpoint/restore protocol (C4).
//!
//! Publishes the live carrier ranges and dump filename through a small
//! POSIX shared-memory region named `"nvmalloc.<pid>"` so cooperating
//! readers can discover the current NVM ranges without linking against
//! this crate, and implements `pinit`/`pdump`: the persist-to-file and
//! rehydrate-at-the-original-address operations described in spec.md §4.4.

use crate::addr_policy::MAX_CARRIER_COUNT;
use crate::allocator::AllocatorState;
use crate::error::NvmError;
use crate::mmap::{mmap_fixed, page_size};
use errno::errno;
use libc::{
    c_void, close, ftruncate, mmap, munmap, shm_open, shm_unlink, MAP_FAILED, MAP_SHARED,
    O_CREAT, O_EXCL, O_RDWR, PROT_READ, PROT_WRITE,
};
use std::ffi::CString;
use std::fs::File;
use std::io::{Read, Write};
use std::mem;

const DMP_FNAME_LEN: usize = 256;

/// Raw layout of the cross-process shared control block (spec.md §6).
/// `carrier_ranges[2*i]`/`[2*i+1]` are carrier `i`'s start/end; unused
/// slots are zero. `nvm_state_ptr` is only meaningful inside the owning
/// process — see spec.md §9 Design Notes, "Shared state pointer across
/// processes."
#[repr(C)]
struct SharedControlBlock {
    nvm_state_ptr: usize,
    dmp_fname: [u8; DMP_FNAME_LEN],
    carrier_ranges: [usize; 2 * MAX_CARRIER_COUNT],
}

fn shm_region_name(pid: libc::pid_t) -> CString {
    CString::new(format!("/nvmalloc.{}", pid)).expect("pid-derived shm name is always valid CString")
}

/// Owns the mapped shared-memory page. Unlinked and unmapped on `Drop`
/// only by the process that created it (`owner == true`) — a secondary
/// process that merely attached must leave the name behind for the owner.
struct SharedCtrl {
    ptr: *mut SharedControlBlock,
    region_size: usize,
    name: CString,
    owner: bool,
}

unsafe impl Send for SharedCtrl {}

impl SharedCtrl {
    /// Opens or creates the shared control block for the current process.
    /// Returns the handle plus whether *this call* created it (spec.md's
    /// `caze == 1`).
    fn acquire() -> Result<(Self, bool), NvmError> {
        let region_size = page_size().max(mem::size_of::<SharedControlBlock>());
        assert_eq!(
            region_size,
            page_size(),
            "nvmalloc: shared control block must fit in a single page"
        );

        let name = shm_region_name(unsafe { libc::getpid() });

        let mut fd = unsafe { shm_open(name.as_ptr(), O_RDWR, 0o666) };
        let created = fd == -1;

        if created {
            log::debug!("nvmalloc: shared control block does not exist, creating it");
            fd = unsafe { shm_open(name.as_ptr(), O_CREAT | O_EXCL | O_RDWR, 0o666) };
            if fd == -1 {
                return Err(NvmError::SharedCtrlFailed(format!(
                    "shm_open(O_CREAT) failed: {}",
                    errno()
                )));
            }
            if unsafe { ftruncate(fd, region_size as libc::off_t) } != 0 {
                return Err(NvmError::SharedCtrlFailed(format!(
                    "ftruncate failed: {}",
                    errno()
                )));
            }
        } else {
            log::debug!("nvmalloc: found existing shared control block");
        }

        let raw = unsafe {
            mmap(
                std::ptr::null_mut(),
                region_size,
                PROT_READ | PROT_WRITE,
                MAP_SHARED,
                fd,
                0,
            )
        };
        unsafe { close(fd) };
        if raw == MAP_FAILED {
            return Err(NvmError::SharedCtrlFailed(format!(
                "mmap of shared control block failed: {}",
                errno()
            )));
        }

        if created {
            unsafe {
                std::ptr::write_bytes(raw as *mut u8, 0, region_size);
            }
        }

        Ok((
            SharedCtrl {
                ptr: raw as *mut SharedControlBlock,
                region_size,
                name,
                owner: created,
            },
            created,
        ))
    }

    fn block(&self) -> &SharedControlBlock {
        unsafe { &*self.ptr }
    }

    fn block_mut(&mut self) -> &mut SharedControlBlock {
        unsafe { &mut *self.ptr }
    }

    fn set_dmp_fname(&mut self, id: &str) {
        let bytes = id.as_bytes();
        assert!(bytes.len() < DMP_FNAME_LEN, "nvmalloc: dump filename too long");
        let block = self.block_mut();
        block.dmp_fname = [0u8; DMP_FNAME_LEN];
        block.dmp_fname[..bytes.len()].copy_from_slice(bytes);
    }

    fn dmp_fname(&self) -> String {
        let raw = &self.block().dmp_fname;
        let len = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        String::from_utf8_lossy(&raw[..len]).into_owned()
    }

    fn publish_carrier(&mut self, index: usize, start: usize, end: usize) {
        let block = self.block_mut();
        block.carrier_ranges[index * 2] = start;
        block.carrier_ranges[index * 2 + 1] = end;
    }

    /// Live carrier ranges currently published, for readers that only want
    /// `(start, end)` pairs without touching `nvm_state_ptr`.
    pub fn published_ranges(&self) -> Vec<(usize, usize)> {
        self.block()
            .carrier_ranges
            .chunks_exact(2)
            .filter(|pair| pair[0] != 0 || pair[1] != 0)
            .map(|pair| (pair[0], pair[1]))
            .collect()
    }
}

impl Drop for SharedCtrl {
    fn drop(&mut self) {
        unsafe {
            if munmap(self.ptr as *mut c_void, self.region_size) != 0 {
                log::error!("nvmalloc: munmap of shared control block failed: {}", errno());
            }
        }
        if !self.owner {
            return;
        }
        if unsafe { shm_unlink(self.name.as_ptr()) } != 0 {
            log::error!("nvmalloc: shm_unlink failed: {}", errno());
        }
    }
}

/// Instantiable allocator context: the "single owned context object" the
/// spec's design notes call for, so tests can hold several independent
/// allocators in one process instead of fighting a single global.
pub struct NvmAllocator {
    state: Box<AllocatorState>,
    shared: SharedCtrl,
    locally_loaded: bool,
}

impl NvmAllocator {
    /// `pinit(id)`: acquires the shared control block; if this call created
    /// it, also attempts to load `id` as a dump file and restore carriers
    /// at their original addresses. See spec.md §4.4.
    pub fn pinit(id: &str) -> Result<Self, NvmError> {
        let (mut shared, created) = SharedCtrl::acquire()?;

        if !created {
            // Case 0: another party in this process space already owns the
            // state. We only get here if a raw process-local pointer is
            // meaningfully shared (e.g. a simulator), which a standalone
            // process cannot assume — refuse rather than dereference a
            // foreign pointer blindly.
            return Err(NvmError::SharedCtrlFailed(
                "shared control block already owned by another party in this address space; \
                 cross-process attach via nvm_state_ptr is not supported outside a shared address space"
                    .to_string(),
            ));
        }

        let mut state = Box::new(AllocatorState::fresh());
        shared.block_mut().nvm_state_ptr = state.as_ref() as *const AllocatorState as usize;
        shared.set_dmp_fname(id);
        let locally_loaded = true;

        match File::open(id) {
            Err(_) => {
                log::debug!("nvmalloc: pinit: no dump at {}, starting fresh", id);
            }
            Ok(mut file) => {
                log::debug!("nvmalloc: pinit: restoring dump from {}", id);
                let state_size = mem::size_of::<AllocatorState>();
                let mut buf = vec![0u8; state_size];
                file.read_exact(&mut buf)?;
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        buf.as_ptr(),
                        state.as_mut() as *mut AllocatorState as *mut u8,
                        state_size,
                    );
                }
                for i in 0..state.next_free_carrier {
                    let carrier = state.carriers[i];
                    log::debug!(
                        "nvmalloc: pinit: restoring carrier {} at 0x{:x} ({} bytes)",
                        i,
                        carrier.start_addr,
                        carrier.size()
                    );
                    let restored = mmap_fixed(carrier.start_addr, carrier.size()).map_err(|_| {
                        NvmError::FixedRestoreFailed { addr: carrier.start_addr }
                    })?;
                    if restored != carrier.start_addr {
                        return Err(NvmError::FixedRestoreFailed { addr: carrier.start_addr });
                    }
                    let used = carrier.used_bytes();
                    let mut carrier_buf = vec![0u8; used];
                    file.read_exact(&mut carrier_buf)?;
                    unsafe {
                        std::ptr::copy_nonoverlapping(
                            carrier_buf.as_ptr(),
                            carrier.start_addr as *mut u8,
                            used,
                        );
                    }
                    shared.publish_carrier(i, carrier.start_addr, carrier.end_addr);
                }
                log::debug!("nvmalloc: pinit: restoration complete, root=0x{:x}", state.root);
            }
        }

        Ok(NvmAllocator { state, shared, locally_loaded })
    }

    pub fn pmalloc(&mut self, sz: usize) -> Option<usize> {
        let before = self.state.next_free_carrier;
        let ptr = self.state.pmalloc(sz);
        self.publish_new_carriers(before);
        ptr
    }

    pub fn pcalloc(&mut self, n: usize, size: usize) -> Option<usize> {
        let before = self.state.next_free_carrier;
        let ptr = self.state.pcalloc(n, size);
        self.publish_new_carriers(before);
        ptr
    }

    pub fn pfree(&mut self, ptr: usize) {
        self.state.pfree(ptr);
    }

    pub fn pset_root(&mut self, p: usize) {
        self.state.pset_root(p);
    }

    pub fn pget_root(&self) -> usize {
        self.state.pget_root()
    }

    fn publish_new_carriers(&mut self, before: usize) {
        for i in before..self.state.next_free_carrier {
            let c = self.state.carriers[i];
            self.shared.publish_carrier(i, c.start_addr, c.end_addr);
        }
    }

    /// Every live carrier range currently visible through the shared
    /// control block, for the "classification" testable property of
    /// spec.md §8.
    pub fn published_carrier_ranges(&self) -> Vec<(usize, usize)> {
        self.shared.published_ranges()
    }

    /// `pdump`: serializes allocator state plus each carrier's used prefix
    /// to the dump file named in the shared control block. Fatal if `root`
    /// is null (spec.md flags this as an odd policy but preserves it) or
    /// on any I/O failure; a no-op for a non-owning process.
    pub fn pdump(&self) -> Result<(), NvmError> {
        if self.state.root == 0 {
            return Err(NvmError::NullRootOnDump);
        }
        if !self.locally_loaded {
            log::debug!("nvmalloc: pdump: not locally loaded, nothing to do");
            return Ok(());
        }

        let fname = self.shared.dmp_fname();
        log::debug!(
            "nvmalloc: pdump: writing state to {} (root=0x{:x}, carriers={})",
            fname,
            self.state.root,
            self.state.next_free_carrier
        );
        let mut file = File::create(&fname)?;
        let state_bytes = unsafe {
            std::slice::from_raw_parts(
                self.state.as_ref() as *const AllocatorState as *const u8,
                mem::size_of::<AllocatorState>(),
            )
        };
        file.write_all(state_bytes)?;

        for i in 0..self.state.next_free_carrier {
            let carrier = self.state.carriers[i];
            let used = carrier.used_bytes();
            log::debug!(
                "nvmalloc: pdump: carrier {} {}/{} bytes",
                i,
                used,
                carrier.size()
            );
            let carrier_bytes =
                unsafe { std::slice::from_raw_parts(carrier.start_addr as *const u8, used) };
            file.write_all(carrier_bytes)?;
        }
        Ok(())
    }
}
