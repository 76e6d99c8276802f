//! End-to-end scenarios from spec.md §8.
//!
//! The shared control block is keyed by pid (spec.md §6: `"nvmalloc.<pid>"`),
//! so every scenario that calls `pinit` runs inside its own forked child —
//! giving it a pid nothing else in this test binary shares — and the parent
//! just waits for a clean exit. Restore round-trip scenarios fork twice in
//! sequence: one child plays the writer process, a second (later, distinct
//! pid) plays the reader, communicating only through the dump file on disk,
//! exactly as two unrelated processes would.

use nvmalloc::shared_ctrl::NvmAllocator;
use nvmalloc::{pdump, pfree, pget_root, pinit, pmalloc, pset_root, NULL_PTR, Ptr};
use std::mem;

fn unique_dump_path(tag: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!(
        "nvmalloc_scenario_{}_{}.dump",
        tag,
        std::process::id()
    ))
}

/// Runs `f` in a forked child and asserts it exited cleanly.
fn in_process(f: impl FnOnce()) {
    match unsafe { libc::fork() } {
        -1 => panic!("fork failed"),
        0 => {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f));
            std::process::exit(if result.is_ok() { 0 } else { 101 });
        }
        child => {
            let mut status = 0;
            unsafe { libc::waitpid(child, &mut status, 0) };
            assert_eq!(libc::WEXITSTATUS(status), 0, "child process failed");
        }
    }
}

#[repr(C)]
struct Node {
    val: i32,
    next: Ptr,
}

// Scenario 1: fresh allocator, malloc + set_root + dump.
#[test]
fn scenario_fresh_allocator_dump() {
    let path = unique_dump_path("s1");
    in_process(|| {
        pinit(path.to_str().unwrap());
        let p = pmalloc(100);
        assert_ne!(p, NULL_PTR);
        unsafe {
            *(p as *mut i32) = 42;
        }
        pset_root(p);
        pdump();
    });
    assert!(path.exists());
    let metadata = std::fs::metadata(&path).unwrap();
    assert!(metadata.len() > 0, "dump must contain at least the state header");
    let _ = std::fs::remove_file(&path);
}

// Scenario 2: restore round trip across two processes.
#[test]
fn scenario_restore_round_trip() {
    let path = unique_dump_path("s2");

    in_process(|| {
        pinit(path.to_str().unwrap());
        let p = pmalloc(100);
        unsafe {
            *(p as *mut i32) = 42;
        }
        pset_root(p);
        pdump();
    });

    in_process(|| {
        pinit(path.to_str().unwrap());
        let root = pget_root();
        assert_ne!(root, NULL_PTR);
        let value = unsafe { *(root as *const i32) };
        assert_eq!(value, 42);
    });

    let _ = std::fs::remove_file(&path);
}

// Scenario 3: grow a linked list across a restart, then (scenario 4)
// shrink it across a further restart.
#[test]
fn scenario_linked_list_grow_then_shrink() {
    let path = unique_dump_path("s3");

    in_process(|| {
        pinit(path.to_str().unwrap());
        let mut head = pget_root();
        for i in 1..=5 {
            let raw = pmalloc(mem::size_of::<Node>());
            assert_ne!(raw, NULL_PTR);
            let node = raw as *mut Node;
            unsafe {
                (*node).val = i;
                (*node).next = head;
            }
            pset_root(raw);
            head = raw;
        }
        pdump();
    });

    in_process(|| {
        pinit(path.to_str().unwrap());
        let values = walk_list(pget_root());
        assert_eq!(values, vec![5, 4, 3, 2, 1]);
    });

    in_process(|| {
        pinit(path.to_str().unwrap());
        let head = pget_root();
        let node = head as *mut Node;
        let next = unsafe { (*node).next };
        pfree(head);
        pset_root(next);
        pdump();
    });

    in_process(|| {
        pinit(path.to_str().unwrap());
        let values = walk_list(pget_root());
        assert_eq!(values, vec![4, 3, 2, 1]);
    });

    let _ = std::fs::remove_file(&path);
}

fn walk_list(mut curr: Ptr) -> Vec<i32> {
    let mut values = Vec::new();
    while !curr.is_null() {
        let node = curr as *mut Node;
        unsafe {
            values.push((*node).val);
            curr = (*node).next;
        }
    }
    values
}

// Scenario 5: free then immediately re-allocate the same size class reuses
// the same address (LIFO freelist discipline).
#[test]
fn scenario_freelist_reuse() {
    let path = unique_dump_path("s5");
    in_process(|| {
        pinit(path.to_str().unwrap());
        let p = pmalloc(100);
        pfree(p);
        let q = pmalloc(100);
        assert_eq!(p, q);
    });
    let _ = std::fs::remove_file(&path);
}

// Scenario 6: draining a carrier exactly forces the next allocation of the
// same class to create a second, disjoint carrier.
#[test]
fn scenario_carrier_boundary() {
    in_process(|| {
        let path = unique_dump_path("s6");
        let mut alloc = NvmAllocator::pinit(path.to_str().unwrap()).unwrap();

        // class 0 blocks are nvmalloc::addr_policy::MIN_ALLOC_SIZE bytes
        // (prefix included); with the `small-carriers` test feature a
        // carrier holds MIN_CARRIER_SIZE / MIN_ALLOC_SIZE of them.
        let class0_block_size = nvmalloc::addr_policy::MIN_ALLOC_SIZE;
        let user_size = class0_block_size - nvmalloc::prefix::PREFIX_SIZE;
        let blocks_per_carrier = nvmalloc::addr_policy::MIN_CARRIER_SIZE / class0_block_size;

        let mut pointers = Vec::with_capacity(blocks_per_carrier + 1);
        for _ in 0..blocks_per_carrier {
            let p = alloc.pmalloc(user_size).expect("carrier should not be exhausted yet");
            pointers.push(p);
        }

        let ranges_before = alloc.published_carrier_ranges();
        assert_eq!(ranges_before.len(), 1, "exactly one carrier should exist so far");

        let overflow = alloc.pmalloc(user_size).expect("a second carrier must be created");
        let ranges_after = alloc.published_carrier_ranges();
        assert_eq!(ranges_after.len(), 2, "draining the first carrier must trigger a second");

        let (c0_start, c0_end) = ranges_after[0];
        let (c1_start, c1_end) = ranges_after[1];
        assert!(c1_end <= c0_start || c0_end <= c1_start, "carriers must be disjoint");
        assert!(overflow < c0_start || overflow >= c0_end);

        let _ = std::fs::remove_file(&path);
    });
}
