use crate::threading::process::Tid;
use crate::threading::thread_sleep::{current_tid, thread_sleep, thread_wakeup};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, Thread};

/// A thread parked in a [`WaitQueue`].
pub struct Waiter {
    tid: Tid,
    thread: Thread,
    woken: Arc<AtomicBool>,
}

impl Waiter {
    pub fn tid(&self) -> Tid {
        self.tid
    }

    /// Marks the waiter runnable and unparks it.
    pub fn wake(self) {
        self.woken.store(true, Ordering::Release);
        thread_wakeup(&self.thread);
    }
}

/// Returned to a thread that queued itself; waiting on it blocks until the
/// matching [`Waiter`] is woken.
#[must_use = "a queued thread has to wait on its token"]
pub struct WakeToken(Arc<AtomicBool>);

impl WakeToken {
    pub fn wait(self) {
        while !self.0.load(Ordering::Acquire) {
            thread_sleep();
        }
    }
}

/// FIFO queue of blocked threads. Not synchronized on its own; owners keep it
/// behind whatever lock protects the state being waited for.
#[derive(Default)]
pub struct WaitQueue {
    waiters: VecDeque<Waiter>,
}

impl WaitQueue {
    pub const fn new() -> Self {
        Self {
            waiters: VecDeque::new(),
        }
    }

    /// Enqueues the calling thread. The caller must drop any lock guarding this
    /// queue before waiting on the returned token.
    pub fn push_current(&mut self) -> WakeToken {
        let tid = current_tid();
        assert!(
            !self.contains(tid),
            "thread {} already in wait queue",
            tid
        );

        let woken = Arc::new(AtomicBool::new(false));
        self.waiters.push_back(Waiter {
            tid,
            thread: thread::current(),
            woken: woken.clone(),
        });
        WakeToken(woken)
    }

    pub fn pop_front(&mut self) -> Option<Waiter> {
        self.waiters.pop_front()
    }

    /// Wakes the longest waiting thread, if any.
    pub fn wake_one(&mut self) -> bool {
        self.pop_front().map(Waiter::wake).is_some()
    }

    /// Wakes every waiting thread and returns how many there were.
    pub fn wake_all(&mut self) -> usize {
        let count = self.waiters.len();
        self.waiters.drain(..).for_each(Waiter::wake);
        count
    }

    pub fn contains(&self, tid: Tid) -> bool {
        self.waiters.iter().any(|waiter| waiter.tid == tid)
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}
