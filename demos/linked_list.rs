//! Example client exercising a singly-linked list on top of `nvmalloc`.
//!
//! Supplements `original_source/examples/linked_list.c`, which spec.md
//! names as an out-of-scope collaborator specified only at interface: pass
//! a positive value to prepend a node holding it, or 0 to pop the head.
//! The list persists across runs via `pdump`/`pinit` against the same
//! dump file.

use std::mem;
use structopt::StructOpt;

#[repr(C)]
struct Node {
    val: i32,
    next: nvmalloc::Ptr,
}

#[derive(StructOpt)]
#[structopt(name = "linked_list_demo")]
struct Opt {
    /// Value to prepend; 0 pops the head of the list instead.
    value: i32,

    /// Dump file backing the list.
    #[structopt(long, default_value = "ll.dump")]
    dump: String,
}

fn main() {
    env_logger::init();
    let opt = Opt::from_args();

    nvmalloc::pinit(&opt.dump);

    let mut head = nvmalloc::pget_root();
    if opt.value == 0 {
        if !head.is_null() {
            let node = head as *mut Node;
            let next = unsafe { (*node).next };
            nvmalloc::pfree(head);
            head = next;
            nvmalloc::pset_root(head);
        }
    } else {
        let raw = nvmalloc::pmalloc(mem::size_of::<Node>());
        assert!(!raw.is_null(), "nvmalloc: out of carrier space");
        let node = raw as *mut Node;
        unsafe {
            (*node).val = opt.value;
            (*node).next = head;
        }
        nvmalloc::pset_root(raw);
        head = raw;
    }

    print!("The list contains: ");
    let mut curr = head;
    while !curr.is_null() {
        let node = curr as *mut Node;
        unsafe {
            print!("{} ", (*node).val);
            curr = (*node).next;
        }
    }
    println!();

    nvmalloc::pdump();
}
