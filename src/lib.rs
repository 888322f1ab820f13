//! vtprof: causal profiling through a preloaded shim
//!
//! A `cdylib` loaded ahead of the target program via `LD_PRELOAD`. It
//! measures how much the whole workload would speed up if one instruction
//! ran faster, without making it faster: kernel performance events sample
//! where the program executes, and interposed socket I/O injects a virtual
//! delay into every peer that waits on the profiled process's output.
//! Repeating the workload at different speedup factors yields the data the
//! offline analysis fits causal speedup curves from.
//!
//! # Modules
//!
//! - **config**: environment-driven startup configuration
//! - **timeutils**: monotonic timespec arithmetic
//! - **io**: buffer pool, packet queues, wire framing, descriptor table
//! - **sampler**: perf-event sample collection and the SIGPROF drain
//! - **shim**: interposed read/write/connect/accept/close/epoll/exec
//! - **startup**: `__libc_start_main` wrapping, reporting
//!
//! # Usage
//!
//! ```ignore
//! LD_PRELOAD=libvtprof.so \
//! TARGET_MODULE=libserver.so \
//! TARGET_OFFSET=0x1a2b \
//! SPEEDUP_FACTOR=0.5 ./server
//! ```
//!
//! On exit the run writes `<pid>.txt` with hit and sample counts, the
//! injected virtual delay, and the wall-clock time of the real entry
//! point.

#[cfg(not(target_os = "linux"))]
compile_error!("vtprof interposes Linux syscall wrappers and only builds on Linux");

pub mod config;
pub mod errors;
pub mod io;
pub mod report;
pub mod sampler;
pub mod shim;
pub mod startup;
pub mod timeutils;

pub use config::StartupConfig;
pub use errors::{ProfileError, Result};
pub use io::{Buffer, BufferPool, DescriptorTable, FrameHeader, Packet, PacketQueue};
pub use report::RunReport;
pub use sampler::SampleCollector;
