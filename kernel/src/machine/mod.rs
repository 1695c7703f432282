//! The simulated single-CPU machine the kernel manages.

pub mod processor;

pub use processor::{ExceptionCause, Processor};

use crate::sync::{Interrupt, SleepLock};
use spin::mutex::{TicketMutex, TicketMutexGuard};
use std::sync::Arc;

pub struct Machine {
    interrupt: Arc<Interrupt>,
    processor: TicketMutex<Processor>,
    /// Held by the thread whose instructions the machine is executing.
    cpu: SleepLock,
}

impl Machine {
    pub fn new(num_phys_pages: usize, page_size: usize, tlb_size: usize) -> Self {
        Self {
            interrupt: Arc::new(Interrupt::new()),
            processor: TicketMutex::new(Processor::new(num_phys_pages, page_size, tlb_size)),
            cpu: SleepLock::new(),
        }
    }

    pub fn interrupt(&self) -> &Arc<Interrupt> {
        &self.interrupt
    }

    /// Hardware state. Only the CPU holder touches it, so the lock is never
    /// contended; take it after the kernel tables, never before.
    pub fn processor(&self) -> TicketMutexGuard<'_, Processor> {
        self.processor.lock()
    }

    pub fn cpu(&self) -> &SleepLock {
        &self.cpu
    }
}
