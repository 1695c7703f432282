use super::process::{AtomicTid, Tid};
use core::sync::atomic::Ordering;
use std::thread::{self, Thread};

static NEXT_TID: AtomicTid = AtomicTid::new(1);

thread_local! {
    static CURRENT_TID: Tid = NEXT_TID.fetch_add(1, Ordering::Relaxed);
}

/// Id of the calling thread. Never 0, which lock words use for "nobody".
pub fn current_tid() -> Tid {
    CURRENT_TID.with(|tid| *tid)
}

/// Takes the calling thread off the ready set until [`thread_wakeup`] is called
/// on it. Can return spuriously, so callers re-check whatever they wait for.
pub fn thread_sleep() {
    thread::park();
}

/// Puts `thread` back on the ready set.
pub fn thread_wakeup(thread: &Thread) {
    thread.unpark();
}
