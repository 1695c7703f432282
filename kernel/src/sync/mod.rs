//! Blocking and interrupt-level synchronization for the simulated machine.

pub mod condvar;
pub mod intr;
pub mod mutex;

pub use condvar::Condition;
pub use intr::{Interrupt, InterruptLock, InterruptLockGuard, IntrLevel};
pub use mutex::SleepLock;
