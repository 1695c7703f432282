//! The kernel object: the machine, the shared memory tables, and the swap
//! waiting discipline.

use crate::config::{ConfigError, KernelConfig, ReplacementKind};
use crate::machine::Machine;
use crate::mem::{
    Clock, CoreMap, FrameId, PageReplacementPolicy, PageTable, PageTableEntry, PageTables,
    RandomEviction,
};
use crate::random::Random;
use crate::swapping::{BackingStore, FileStore, MemoryStore, SwapSlot, SwapSpace};
use crate::sync::{Condition, InterruptLock, InterruptLockGuard, SleepLock};
use crate::threading::process::{Pid, PidAllocator};
use crate::user_program::{Executable, RunningProcess, VmProcess};
use crate::vm_error::VmError;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::io;
use std::sync::Arc;
use swapos_shared::mem::MAX_PAGE_NUMBER;

/// Everything shared between processes. Only reachable with interrupts off.
pub struct KernelTables {
    pub core_map: CoreMap,
    pub replacement: Box<dyn PageReplacementPolicy>,
    pub swap: SwapSpace,
    pub page_tables: PageTables,
    /// Picks translation-cache slots to overwrite.
    pub rng: Random,
}

pub type Tables<'a> = InterruptLockGuard<'a, KernelTables>;

/// Running totals of paging activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VmStats {
    pub tlb_misses: usize,
    pub page_faults: usize,
    pub evictions: usize,
    pub swap_outs: usize,
    pub swap_ins: usize,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub tlb_misses: AtomicUsize,
    pub page_faults: AtomicUsize,
    pub evictions: AtomicUsize,
    pub swap_outs: AtomicUsize,
    pub swap_ins: AtomicUsize,
}

impl Counters {
    pub fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> VmStats {
        VmStats {
            tlb_misses: self.tlb_misses.load(Ordering::Relaxed),
            page_faults: self.page_faults.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            swap_outs: self.swap_outs.load(Ordering::Relaxed),
            swap_ins: self.swap_ins.load(Ordering::Relaxed),
        }
    }
}

pub struct VmKernel {
    config: KernelConfig,
    machine: Machine,
    tables: InterruptLock<KernelTables>,
    /// Guards `slot_freed`. Taken after the tables, never before.
    swap_lock: Arc<SleepLock>,
    slot_freed: Condition,
    swap_waiters: AtomicUsize,
    pids: PidAllocator,
    pub(crate) counters: Counters,
}

impl VmKernel {
    /// Boots the machine described by `config`, opening the swap file if one
    /// is configured.
    pub fn initialize(config: KernelConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let store: Box<dyn BackingStore> = match &config.swap_path {
            Some(path) => Box::new(FileStore::open(path, config.swap_len())?),
            None => Box::new(MemoryStore::new(config.swap_len())),
        };
        Self::with_store(config, store)
    }

    /// Boots the machine with an explicit backing store for swap.
    pub fn with_store(
        config: KernelConfig,
        store: Box<dyn BackingStore>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        if store.len() < config.swap_len() {
            return Err(ConfigError::Invalid("the swap store is smaller than the swap extent"));
        }

        let machine = Machine::new(config.num_phys_pages, config.page_size, config.tlb_size);
        let replacement: Box<dyn PageReplacementPolicy> = match config.replacement {
            ReplacementKind::Clock => Box::new(Clock::new()),
            ReplacementKind::Random => Box::new(RandomEviction::new(config.random_seed)),
        };
        let tables = KernelTables {
            core_map: CoreMap::new(config.num_phys_pages),
            replacement,
            swap: SwapSpace::new(store, config.page_size),
            page_tables: PageTables::new(),
            rng: Random::new(config.random_seed.rotate_left(32)),
        };

        log::info!(
            "kernel up: {} frames of {} bytes, {} translation slots, {} swap slots, {} replacement",
            config.num_phys_pages,
            config.page_size,
            config.tlb_size,
            tables.swap.num_slots(),
            tables.replacement.name()
        );

        let swap_lock = Arc::new(SleepLock::new());
        Ok(Self {
            tables: InterruptLock::new(machine.interrupt().clone(), tables),
            machine,
            slot_freed: Condition::new(swap_lock.clone()),
            swap_lock,
            swap_waiters: AtomicUsize::new(0),
            pids: PidAllocator::new(),
            counters: Counters::default(),
            config,
        })
    }

    /// Shuts the kernel down and deletes the swap extent.
    pub fn terminate(self) -> io::Result<()> {
        let mut tables = self.tables.lock();
        tables.swap.remove()?;
        log::info!("kernel down: {:?}", self.counters.snapshot());
        Ok(())
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    pub(crate) fn tables(&self) -> Tables<'_> {
        self.tables.lock()
    }

    /// Builds an address space for `image`: its sections followed by the
    /// stack. No page is resident until first touched.
    pub fn spawn(&self, image: Arc<dyn Executable>) -> Result<VmProcess, VmError> {
        if image.page_size() != self.config.page_size {
            return Err(VmError::PageSizeMismatch {
                image: image.page_size(),
                machine: self.config.page_size,
            });
        }
        let num_pages = image.end_vpn().saturating_add(self.config.stack_pages);
        if num_pages > MAX_PAGE_NUMBER + 1 {
            return Err(VmError::AddressSpaceTooLarge { num_pages });
        }

        let pid = self.pids.allocate_pid();
        self.tables()
            .page_tables
            .insert(pid, PageTable::new(num_pages));
        log::info!("spawned process {} with {} pages", pid, num_pages);

        Ok(VmProcess::new(pid, image, num_pages))
    }

    /// Takes the CPU and starts executing on behalf of `process`.
    pub fn run<'a>(&'a self, process: &'a VmProcess) -> RunningProcess<'a> {
        RunningProcess::start(self, process)
    }

    /// Number of threads blocked waiting for a swap slot.
    pub fn swap_waiters(&self) -> usize {
        self.swap_waiters.load(Ordering::Acquire)
    }

    /// Blocks the calling thread until a swap slot is released.
    ///
    /// The caller holds the CPU and must already have saved its translation
    /// state; the CPU is given up for the duration of the wait and held again
    /// on return.
    pub(crate) fn wait_for_free_slot(&self) {
        self.swap_waiters.fetch_add(1, Ordering::AcqRel);
        self.swap_lock.acquire();
        self.machine.cpu().release();

        self.slot_freed.sleep();

        self.swap_lock.release();
        self.swap_waiters.fetch_sub(1, Ordering::AcqRel);
        self.machine.cpu().acquire();
    }

    /// Wakes one thread waiting for a swap slot. Must not be called with the
    /// tables locked.
    pub(crate) fn notify_slot_freed(&self) {
        if self.swap_waiters() == 0 {
            return;
        }
        self.swap_lock.acquire();
        self.slot_freed.wake();
        self.swap_lock.release();
    }

    /// Wakes every thread waiting for a swap slot.
    pub(crate) fn notify_all(&self) {
        if self.swap_waiters() == 0 {
            return;
        }
        self.swap_lock.acquire();
        let woken = self.slot_freed.wake_all();
        self.swap_lock.release();
        log::debug!("woke {} swap waiters", woken);
    }

    pub fn free_frames(&self) -> usize {
        self.tables().core_map.free_count()
    }

    pub fn free_swap_slots(&self) -> usize {
        self.tables().swap.free_slots()
    }

    /// The `(pid, vpn)` resident in `frame`.
    pub fn frame_owner(&self, frame: FrameId) -> Option<(Pid, usize)> {
        self.tables().core_map.owner(frame)
    }

    /// Owner of every frame, in frame order.
    pub fn core_map_snapshot(&self) -> Vec<Option<(Pid, usize)>> {
        let tables = self.tables();
        (0..tables.core_map.len())
            .map(|frame| tables.core_map.owner(frame))
            .collect()
    }

    pub fn page_entry(&self, pid: Pid, vpn: usize) -> Result<PageTableEntry, VmError> {
        self.tables()
            .page_tables
            .get(pid)
            .and_then(|table| table.lookup(vpn).copied())
    }

    pub fn page_table_snapshot(&self, pid: Pid) -> Result<Vec<PageTableEntry>, VmError> {
        let tables = self.tables();
        let table = tables.page_tables.get(pid)?;
        Ok(table.iter().map(|(_, entry)| *entry).collect())
    }

    pub fn swap_slot_of(&self, pid: Pid, vpn: usize) -> Option<SwapSlot> {
        self.tables().swap.lookup(pid, vpn)
    }

    /// Keeps `frame` from being evicted until [`VmKernel::unpin_frame`].
    pub fn pin_frame(&self, frame: FrameId) {
        self.tables().core_map.pin(frame);
    }

    pub fn unpin_frame(&self, frame: FrameId) {
        self.tables().core_map.unpin(frame);
    }

    pub fn stats(&self) -> VmStats {
        self.counters.snapshot()
    }

    /// Checks that the inverted table and the page tables describe the same
    /// mappings, and that the swap maps agree with the free-slot list.
    pub fn audit(&self) -> Result<(), VmError> {
        let tables = self.tables();
        let KernelTables {
            core_map,
            swap,
            page_tables,
            ..
        } = &*tables;

        for frame in 0..core_map.len() {
            let corrupt = VmError::FrameTableCorrupt { frame };
            match core_map.owner(frame) {
                Some((pid, vpn)) => {
                    let entry = page_tables
                        .get(pid)
                        .and_then(|table| table.lookup(vpn))
                        .map_err(|_| VmError::FrameTableCorrupt { frame })?;
                    if !entry.valid || entry.frame != Some(frame) {
                        return Err(corrupt);
                    }
                }
                // reserved frames are always pinned by whoever reserved them
                None if core_map.is_allocated(frame) && !core_map.is_pinned(frame) => {
                    return Err(corrupt)
                }
                None if !core_map.is_allocated(frame) && !core_map.is_free(frame) => {
                    return Err(corrupt)
                }
                None => {}
            }
        }

        for (pid, table) in page_tables.iter() {
            for (vpn, frame) in table.resident_pages() {
                if core_map.owner(frame) != Some((pid, vpn)) {
                    return Err(VmError::FrameTableCorrupt { frame });
                }
            }
        }

        swap.audit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::user_program::{ExecutableImage, Section};

    fn config(frames: usize, slots: usize) -> KernelConfig {
        KernelConfig {
            num_phys_pages: frames,
            tlb_size: 4,
            page_size: 64,
            swap_slots: slots,
            swap_path: None,
            stack_pages: 4,
            replacement: ReplacementKind::Clock,
            random_seed: 1,
        }
    }

    fn empty_image() -> Arc<dyn Executable> {
        Arc::new(ExecutableImage::new(Vec::new(), 64).expect("valid image"))
    }

    #[test]
    fn test_initialize_checks_config() {
        let bad = KernelConfig {
            page_size: 3,
            ..config(2, 2)
        };
        assert!(matches!(
            VmKernel::initialize(bad),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            VmKernel::with_store(config(2, 4), Box::new(MemoryStore::new(64))),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_fresh_kernel() {
        let kernel = VmKernel::initialize(config(3, 5)).expect("valid config");
        assert_eq!(kernel.free_frames(), 3);
        assert_eq!(kernel.free_swap_slots(), 5);
        assert_eq!(kernel.core_map_snapshot(), vec![None; 3]);
        assert_eq!(kernel.stats(), VmStats::default());
        assert_eq!(kernel.swap_waiters(), 0);
        kernel.audit().expect("consistent");
        kernel.terminate().expect("memory store");
    }

    #[test]
    fn test_spawn_sizes_address_space() {
        let kernel = VmKernel::initialize(config(2, 2)).expect("valid config");
        let image: Arc<dyn Executable> = Arc::new(
            ExecutableImage::new(vec![Section::new(0, 3, true, vec![1])], 64).expect("valid"),
        );

        let process = kernel.spawn(image).expect("fits");
        assert_eq!(process.num_pages(), 3 + 4);
        let snapshot = kernel.page_table_snapshot(process.pid()).expect("spawned");
        assert_eq!(snapshot.len(), 7);
        assert!(snapshot.iter().all(|entry| !entry.valid && entry.frame.is_none()));
        assert!(matches!(
            kernel.page_entry(process.pid(), 7),
            Err(VmError::OutOfRange { vpn: 7, .. })
        ));
    }

    #[test]
    fn test_spawn_rejects_huge_address_space() {
        let kernel = VmKernel::initialize(KernelConfig {
            stack_pages: MAX_PAGE_NUMBER + 2,
            ..config(2, 2)
        })
        .expect("valid config");
        assert!(matches!(
            kernel.spawn(empty_image()),
            Err(VmError::AddressSpaceTooLarge { .. })
        ));
    }

    #[test]
    fn test_spawn_rejects_foreign_page_size() {
        let kernel = VmKernel::initialize(config(2, 2)).expect("valid config");
        let image: Arc<dyn Executable> = Arc::new(
            ExecutableImage::new(vec![Section::new(0, 1, false, vec![0x5A; 1000])], 1024)
                .expect("fits 1024-byte pages"),
        );

        assert!(matches!(
            kernel.spawn(image),
            Err(VmError::PageSizeMismatch {
                image: 1024,
                machine: 64
            })
        ));
        kernel.audit().expect("nothing was built");
        assert!(kernel.page_table_snapshot(1).is_err());
    }

    #[test]
    fn test_pids_are_distinct() {
        let kernel = VmKernel::initialize(config(2, 2)).expect("valid config");
        let first = kernel.spawn(empty_image()).expect("fits");
        let second = kernel.spawn(empty_image()).expect("fits");
        assert_ne!(first.pid(), second.pid());
    }

    #[test]
    fn test_file_backed_swap_is_removed_on_terminate() {
        let path = std::env::temp_dir().join(format!("swapos-kernel-{}.swap", std::process::id()));
        let kernel = VmKernel::initialize(KernelConfig {
            swap_path: Some(path.clone()),
            ..config(2, 2)
        })
        .expect("temp dir is writable");
        assert!(path.exists());

        kernel.terminate().expect("removable");
        assert!(!path.exists());
    }
}
