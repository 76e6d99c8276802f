//! Internal error type. The public API (spec.md §7) exposes only two
//! outward behaviors — a sentinel return or process abort — but internally
//! fallible paths return `Result<T, NvmError>` and propagate with `?`.

use std::io;

#[derive(thiserror::Error, Debug)]
pub enum NvmError {
    #[error("mmap failed for carrier of {size} bytes: {source}")]
    CarrierMapFailed { size: usize, source: errno::Errno },

    #[error("carrier slot count exhausted ({max} slots in use)")]
    CarrierCountExhausted { max: usize },

    #[error("could not create or map the shared control block: {0}")]
    SharedCtrlFailed(String),

    #[error("dump I/O failed: {0}")]
    DumpIo(#[from] io::Error),

    #[error("root is null; dumping an empty heap is refused by policy")]
    NullRootOnDump,

    #[error("could not remap carrier at its original address 0x{addr:x}")]
    FixedRestoreFailed { addr: usize },
}

/// Logs `err` at `error!` and aborts the process, mirroring the source's
/// `handle_error` macro (`perror` + `exit(EXIT_FAILURE)`).
pub fn fatal(err: NvmError) -> ! {
    log::error!("nvmalloc: fatal: {}", err);
    std::process::exit(1)
}
