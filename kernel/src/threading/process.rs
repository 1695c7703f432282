use core::sync::atomic::{AtomicU16, AtomicU64, Ordering};

pub type Pid = u16;
pub type Tid = u64;
pub type AtomicPid = AtomicU16;
pub type AtomicTid = AtomicU64;

/// Hands out process ids. Pid 0 is never returned.
pub struct PidAllocator {
    next_pid: AtomicPid,
}

impl PidAllocator {
    pub const fn new() -> Self {
        Self {
            next_pid: AtomicPid::new(1),
        }
    }

    pub fn allocate_pid(&self) -> Pid {
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        if pid == 0 {
            panic!("PID overflow");
        }
        pid
    }
}

impl Default for PidAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pids_are_unique_and_nonzero() {
        let pids = PidAllocator::new();
        let first = pids.allocate_pid();
        let second = pids.allocate_pid();
        assert_ne!(first, 0);
        assert_ne!(first, second);
        assert_eq!(second, first + 1);
    }
}
