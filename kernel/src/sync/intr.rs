use crate::threading::process::AtomicTid;
use crate::threading::thread_sleep::current_tid;
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntrLevel {
    IntrOn,
    IntrOff,
}

/// The simulated machine's interrupt controller.
///
/// Disabling interrupts keeps every other thread out of the kernel's critical
/// region until the disabling thread turns them back on. Disables nest: only
/// the outermost enable lets other threads in again.
pub struct Interrupt {
    owner: AtomicTid,
    disable_count: AtomicUsize,
}

impl Interrupt {
    pub const fn new() -> Self {
        Self {
            owner: AtomicTid::new(0),
            disable_count: AtomicUsize::new(0),
        }
    }

    pub fn disable(&self) {
        let current = current_tid();
        if self.owner.load(Ordering::Acquire) == current {
            self.disable_count.fetch_add(1, Ordering::Relaxed);
            return;
        }

        while self
            .owner
            .compare_exchange_weak(0, current, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            core::hint::spin_loop();
            thread::yield_now();
        }
        self.disable_count.store(1, Ordering::Relaxed);
    }

    pub fn enable(&self) {
        assert_eq!(
            self.owner.load(Ordering::Acquire),
            current_tid(),
            "interrupts enabled by a thread that did not disable them"
        );

        // fetch_sub returns the count before the decrement.
        if self.disable_count.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.owner.store(0, Ordering::Release);
        }
    }

    /// Interrupt level as seen by the calling thread.
    pub fn level(&self) -> IntrLevel {
        if self.owner.load(Ordering::Acquire) == current_tid() {
            IntrLevel::IntrOff
        } else {
            IntrLevel::IntrOn
        }
    }

    /// Disables interrupts until the returned guard is dropped.
    pub fn hold(&self) -> InterruptsGuard<'_> {
        self.disable();
        InterruptsGuard { interrupt: self }
    }
}

impl Default for Interrupt {
    fn default() -> Self {
        Self::new()
    }
}

/// Re-enables interrupts when dropped.
pub struct InterruptsGuard<'a> {
    interrupt: &'a Interrupt,
}

impl Drop for InterruptsGuard<'_> {
    fn drop(&mut self) {
        self.interrupt.enable();
    }
}

/// Data that may only be touched with interrupts disabled.
pub struct InterruptLock<T> {
    interrupt: Arc<Interrupt>,
    borrowed: AtomicBool,
    data: UnsafeCell<T>,
}

// SAFETY: the data is only reachable through a guard, and a guard only exists
// while its thread holds interrupts off.
unsafe impl<T: Send> Sync for InterruptLock<T> {}
unsafe impl<T: Send> Send for InterruptLock<T> {}

impl<T> InterruptLock<T> {
    pub fn new(interrupt: Arc<Interrupt>, data: T) -> Self {
        Self {
            interrupt,
            borrowed: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    /// Disables interrupts and hands out the data.
    ///
    /// Interrupts nest, but this lock does not: locking it again from the
    /// thread already holding the guard is a kernel bug and panics.
    pub fn lock(&self) -> InterruptLockGuard<'_, T> {
        let guard = self.interrupt.hold();
        assert!(
            !self.borrowed.swap(true, Ordering::Acquire),
            "InterruptLock re-entered while already held"
        );
        InterruptLockGuard {
            lock: self,
            _interrupts: guard,
        }
    }

    pub fn interrupt(&self) -> &Interrupt {
        &self.interrupt
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

pub struct InterruptLockGuard<'a, T> {
    lock: &'a InterruptLock<T>,
    // Dropped after `Drop::drop` below clears the borrow flag.
    _interrupts: InterruptsGuard<'a>,
}

impl<T> Deref for InterruptLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for InterruptLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for InterruptLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.borrowed.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disable_nests() {
        let interrupt = Interrupt::new();
        assert_eq!(interrupt.level(), IntrLevel::IntrOn);

        interrupt.disable();
        interrupt.disable();
        assert_eq!(interrupt.level(), IntrLevel::IntrOff);
        interrupt.enable();
        assert_eq!(interrupt.level(), IntrLevel::IntrOff);
        interrupt.enable();
        assert_eq!(interrupt.level(), IntrLevel::IntrOn);
    }

    #[test]
    fn test_level_is_per_thread() {
        let interrupt = Interrupt::new();
        let _held = interrupt.hold();
        thread::scope(|s| {
            let level = s.spawn(|| interrupt.level()).join().expect("thread panicked");
            assert_eq!(level, IntrLevel::IntrOn);
        });
        assert_eq!(interrupt.level(), IntrLevel::IntrOff);
    }

    #[test]
    fn test_lock_excludes_other_threads() {
        let lock = InterruptLock::new(Arc::new(Interrupt::new()), 0usize);

        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..1000 {
                        let mut count = lock.lock();
                        let seen = *count;
                        thread::yield_now();
                        *count = seen + 1;
                    }
                });
            }
        });

        assert_eq!(*lock.lock(), 4000);
        assert_eq!(lock.interrupt().level(), IntrLevel::IntrOn);
    }

    #[test]
    fn test_lock_inside_held_interrupts() {
        let interrupt = Arc::new(Interrupt::new());
        let lock = InterruptLock::new(interrupt.clone(), 5);
        let _held = interrupt.hold();
        {
            let value = lock.lock();
            assert_eq!(*value, 5);
        }
        assert_eq!(interrupt.level(), IntrLevel::IntrOff);
    }

    #[test]
    #[should_panic(expected = "re-entered")]
    fn test_reentering_lock_panics() {
        let lock = InterruptLock::new(Arc::new(Interrupt::new()), ());
        let _first = lock.lock();
        let _second = lock.lock();
    }
}
