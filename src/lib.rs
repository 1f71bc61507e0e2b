//! Preemptive green threads on a single OS thread.
//!
//! Green threads are registered with [`spawn`], [`create_thread`] or a
//! [`Builder`], then [`run`] multiplexes them onto the calling OS thread:
//! - a `SIGALRM` interval timer preempts the running thread every [`TIME_SLICE`]
//! - the next ready thread is chosen in strict round-robin order
//! - [`install_fault_handlers`] keeps a crashing thread from killing the process
//!
//! # Example
//!
//! ```no_run
//! use greenrt::{install_fault_handlers, run, spawn};
//!
//! install_fault_handlers().unwrap();
//!
//! for i in 0..4 {
//!     spawn(move || {
//!         let mut acc = 0u64;
//!         for n in 0..10_000_000u64 {
//!             acc = acc.wrapping_add(n * i);
//!         }
//!         std::hint::black_box(acc);
//!     })
//!     .unwrap();
//! }
//!
//! let report = run().unwrap();
//! assert_eq!(report.finished().count(), 4);
//! ```
//!
//! Only x86_64 and aarch64 Unix targets are supported.
//!
//! # Locks shared by green threads
//!
//! Every green thread of a run lives on the same OS thread, so a lock held
//! by a preempted green thread looks re-entrant to the next one. Wrap
//! printing and other work under process-wide locks in
//! [`without_preemption`]. A panic is never preempted, so a panicking
//! thread always reaches its `Faulted` state before another thread runs.
//! Heavy allocation from several green threads at once should be kept to
//! the same sections.

mod arch;
mod context;
mod error;
mod fault;
mod preempt;
mod scheduler;
mod thread;

pub use context::{ContextError, MIN_STACK_SIZE, STACK_SIZE};
pub use error::{AllocError, CreationError, RunError};
pub use fault::{FaultSignal, faults_reported, install_fault_handlers, restore_fault_handlers};
pub use preempt::{TIME_SLICE, without_preemption};
pub use scheduler::{
    Builder, MAX_THREADS, RunReport, ThreadReport, create_thread, current_thread, run, spawn,
    thread_count, thread_state,
};
pub use thread::{Fault, ThreadId, ThreadState};
