//! Threading glue between the virtual-memory kernel and the host threads that
//! play the role of the simulated machine's user threads.

pub mod process;
pub mod scheduling;
pub mod thread_sleep;

pub use process::{Pid, PidAllocator, Tid};
pub use thread_sleep::{current_tid, thread_sleep, thread_wakeup};
