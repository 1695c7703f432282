use super::mutex::SleepLock;
use crate::threading::scheduling::WaitQueue;
use spin::mutex::TicketMutex;
use std::sync::Arc;

/// A condition variable bound to one [`SleepLock`].
///
/// Every operation requires the calling thread to hold that lock. A sleeper is
/// queued before the lock is released, so a wake issued by the next holder of
/// the lock cannot be lost.
pub struct Condition {
    lock: Arc<SleepLock>,
    wait_queue: TicketMutex<WaitQueue>,
}

impl Condition {
    pub fn new(lock: Arc<SleepLock>) -> Self {
        Self {
            lock,
            wait_queue: TicketMutex::new(WaitQueue::new()),
        }
    }

    /// Releases the lock, sleeps until woken, then reacquires the lock.
    pub fn sleep(&self) {
        self.assert_held();

        let token = self.wait_queue.lock().push_current();
        self.lock.release();
        token.wait();
        self.lock.acquire();
    }

    /// Wakes at most one sleeping thread.
    pub fn wake(&self) -> bool {
        self.assert_held();
        self.wait_queue.lock().wake_one()
    }

    /// Wakes every sleeping thread and returns how many were woken.
    pub fn wake_all(&self) -> usize {
        self.assert_held();
        self.wait_queue.lock().wake_all()
    }

    pub fn sleepers(&self) -> usize {
        self.wait_queue.lock().len()
    }

    fn assert_held(&self) {
        assert!(
            self.lock.is_held_by_current_thread(),
            "condition variable used without holding its lock"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;

    fn wait_for_sleepers(condition: &Condition, count: usize) {
        while condition.sleepers() < count {
            thread::yield_now();
        }
    }

    #[test]
    fn test_sleep_until_woken() {
        let lock = Arc::new(SleepLock::new());
        let condition = Condition::new(lock.clone());
        let ready = AtomicBool::new(false);

        thread::scope(|s| {
            s.spawn(|| {
                lock.acquire();
                while !ready.load(Ordering::SeqCst) {
                    condition.sleep();
                }
                assert!(lock.is_held_by_current_thread());
                lock.release();
            });

            wait_for_sleepers(&condition, 1);
            lock.acquire();
            ready.store(true, Ordering::SeqCst);
            assert!(condition.wake());
            lock.release();
        });

        assert!(!lock.is_locked());
    }

    #[test]
    fn test_wake_wakes_one_at_a_time() {
        let lock = Arc::new(SleepLock::new());
        let condition = Condition::new(lock.clone());
        let permits = AtomicUsize::new(0);
        let done = AtomicUsize::new(0);

        thread::scope(|s| {
            for _ in 0..2 {
                s.spawn(|| {
                    lock.acquire();
                    while permits.load(Ordering::SeqCst) == 0 {
                        condition.sleep();
                    }
                    permits.fetch_sub(1, Ordering::SeqCst);
                    done.fetch_add(1, Ordering::SeqCst);
                    lock.release();
                });
            }
            wait_for_sleepers(&condition, 2);

            lock.acquire();
            permits.fetch_add(1, Ordering::SeqCst);
            condition.wake();
            lock.release();

            while done.load(Ordering::SeqCst) == 0 {
                thread::yield_now();
            }
            assert_eq!(condition.sleepers(), 1);

            lock.acquire();
            permits.fetch_add(1, Ordering::SeqCst);
            condition.wake();
            lock.release();
        });

        assert_eq!(done.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_wake_all() {
        let lock = Arc::new(SleepLock::new());
        let condition = Condition::new(lock.clone());
        let open = AtomicBool::new(false);

        thread::scope(|s| {
            for _ in 0..3 {
                s.spawn(|| {
                    lock.acquire();
                    while !open.load(Ordering::SeqCst) {
                        condition.sleep();
                    }
                    lock.release();
                });
            }
            wait_for_sleepers(&condition, 3);

            lock.acquire();
            open.store(true, Ordering::SeqCst);
            assert_eq!(condition.wake_all(), 3);
            lock.release();
        });
    }

    #[test]
    #[should_panic(expected = "without holding its lock")]
    fn test_wake_requires_lock() {
        let condition = Condition::new(Arc::new(SleepLock::new()));
        condition.wake();
    }
}
