//! Kern subsystem - Core kernel primitives
//!
//! Based on Mach4 kern/ directory
//! Return codes, sleep/wakeup, zones, event counters and copyin/copyout.

pub mod copyio;
pub mod counters;
pub mod kern_return;
pub mod sched_prim;
pub mod zalloc;

pub use copyio::{copyin, copyout};
pub use counters::CounterSnapshot;
pub use kern_return::{kern_return, KernError, KernResult, KernReturn, KERN_SUCCESS};
pub use sched_prim::{WaitEvent, WaitResult};
pub use zalloc::Zone;
