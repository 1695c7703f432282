use crate::threading::process::{AtomicTid, Tid};
use crate::threading::scheduling::WaitQueue;
use crate::threading::thread_sleep::current_tid;
use core::fmt;
use core::sync::atomic::Ordering::{AcqRel, Acquire, Release};
use spin::mutex::TicketMutex;

/// A lock that puts contending threads to sleep instead of spinning.
///
/// Ownership is handed directly to the longest waiting thread on release, so
/// a woken thread never has to race for the lock again.
pub struct SleepLock {
    holding_thread: AtomicTid,
    wait_queue: TicketMutex<WaitQueue>,
}

impl SleepLock {
    pub const fn new() -> Self {
        Self {
            holding_thread: AtomicTid::new(0),
            wait_queue: TicketMutex::new(WaitQueue::new()),
        }
    }

    pub fn acquire(&self) {
        let current_tid = current_tid();
        assert!(
            !self.is_held_by_current_thread(),
            "thread {} acquired a SleepLock it already holds",
            current_tid
        );

        let mut wait_queue = self.wait_queue.lock();
        if self
            .holding_thread
            .compare_exchange(0, current_tid, AcqRel, Acquire)
            .is_ok()
        {
            return;
        }
        let token = wait_queue.push_current();
        drop(wait_queue);

        // release() stores our tid before waking us.
        token.wait();
        debug_assert_eq!(self.holding_thread.load(Acquire), current_tid);
    }

    pub fn release(&self) {
        assert!(
            self.is_held_by_current_thread(),
            "SleepLock released by a thread that does not hold it"
        );

        let mut wait_queue = self.wait_queue.lock();
        match wait_queue.pop_front() {
            None => self.holding_thread.store(0, Release),
            Some(next_thread) => {
                self.holding_thread.store(next_thread.tid(), Release);
                next_thread.wake();
            }
        }
    }

    pub fn try_acquire(&self) -> bool {
        let _wait_queue = self.wait_queue.lock();
        self.holding_thread
            .compare_exchange(0, current_tid(), AcqRel, Acquire)
            .is_ok()
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        self.holding_thread.load(Acquire) == current_tid()
    }

    pub fn is_locked(&self) -> bool {
        self.holding_thread.load(Acquire) != 0
    }

    pub fn holder(&self) -> Option<Tid> {
        match self.holding_thread.load(Acquire) {
            0 => None,
            tid => Some(tid),
        }
    }

    /// Number of threads blocked in [`SleepLock::acquire`].
    pub fn waiters(&self) -> usize {
        self.wait_queue.lock().len()
    }
}

impl Default for SleepLock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SleepLock {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SleepLock")
            .field("holder", &self.holder())
            .field("waiters", &self.waiters())
            .finish()
    }
}
