//! A process's view of the machine and the exception handlers that keep its
//! pages resident.
//!
//! A faulting access walks `TlbMiss -> PageFault -> Resident`: the
//! translation-miss handler checks the page table, the page-fault handler
//! finds a frame (evicting one if none is free) and fills it, and control
//! returns to the miss handler, which loads the translation cache. The access
//! is then retried.

use crate::machine::ExceptionCause;
use crate::mem::{tlb, FrameId};
use crate::system::{Counters, KernelTables, Tables, VmKernel};
use crate::threading::process::Pid;
use crate::user_program::Executable;
use crate::vm_error::{Severity, VmError};
use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use swapos_shared::mem::{make_address, offset_from_address, page_from_address};

/// A process's identity and executable. Its page table lives in the kernel.
pub struct VmProcess {
    pid: Pid,
    image: Arc<dyn Executable>,
    num_pages: usize,
    exited: AtomicBool,
}

impl VmProcess {
    pub(crate) fn new(pid: Pid, image: Arc<dyn Executable>, num_pages: usize) -> Self {
        Self {
            pid,
            image,
            num_pages,
            exited: AtomicBool::new(false),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn num_pages(&self) -> usize {
        self.num_pages
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }
}

/// A process holding the CPU. Dropping it saves the process's translation
/// state and gives the CPU up.
pub struct RunningProcess<'a> {
    kernel: &'a VmKernel,
    process: &'a VmProcess,
}

impl<'a> RunningProcess<'a> {
    pub(crate) fn start(kernel: &'a VmKernel, process: &'a VmProcess) -> Self {
        kernel.machine().cpu().acquire();
        let running = Self { kernel, process };
        running.restore_state();
        running
    }

    pub fn pid(&self) -> Pid {
        self.process.pid
    }

    fn page_size(&self) -> usize {
        self.kernel.config().page_size
    }

    fn ensure_alive(&self) -> Result<(), VmError> {
        if self.process.has_exited() {
            return Err(VmError::NoSuchProcess {
                pid: self.process.pid,
            });
        }
        Ok(())
    }

    /// A user load from `vaddr`.
    pub fn read_byte(&mut self, vaddr: usize) -> Result<u8, VmError> {
        self.ensure_alive()?;
        loop {
            let result = self.kernel.machine().processor().read_byte(vaddr);
            match result {
                Ok(value) => return Ok(value),
                Err(cause) => self.handle_exception(cause)?,
            }
        }
    }

    /// A user store to `vaddr`.
    pub fn write_byte(&mut self, vaddr: usize, value: u8) -> Result<(), VmError> {
        self.ensure_alive()?;
        loop {
            let result = self.kernel.machine().processor().write_byte(vaddr, value);
            match result {
                Ok(()) => return Ok(()),
                Err(cause) => self.handle_exception(cause)?,
            }
        }
    }

    /// Copies from the process's memory at `vaddr` into `buf`, stopping at the
    /// end of the address space. Returns the number of bytes copied.
    pub fn read_virtual_memory(&mut self, vaddr: usize, buf: &mut [u8]) -> Result<usize, VmError> {
        let len = buf.len();
        self.for_each_page(vaddr, len, false, |page, copied| {
            buf[copied..copied + page.len()].copy_from_slice(page);
        })
    }

    /// Copies `buf` into the process's memory at `vaddr`, stopping at the end
    /// of the address space or at a read-only page. Returns the number of
    /// bytes copied.
    pub fn write_virtual_memory(&mut self, vaddr: usize, buf: &[u8]) -> Result<usize, VmError> {
        self.for_each_page(vaddr, buf.len(), true, |page, copied| {
            page.copy_from_slice(&buf[copied..copied + page.len()]);
        })
    }

    /// Walks `len` bytes from `vaddr` a page at a time. Each page is faulted
    /// in and pinned while `visit` sees the part of its frame in range,
    /// together with the number of bytes already visited.
    fn for_each_page(
        &mut self,
        vaddr: usize,
        len: usize,
        writing: bool,
        mut visit: impl FnMut(&mut [u8], usize),
    ) -> Result<usize, VmError> {
        self.ensure_alive()?;
        let page_size = self.page_size();
        let mut copied = 0;

        while copied < len {
            let address = vaddr + copied;
            let vpn = page_from_address(address, page_size);
            if vpn >= self.process.num_pages {
                break;
            }
            let Some(frame) = self.pin_page(vpn, writing)? else {
                break;
            };

            let offset = offset_from_address(address, page_size);
            let amount = (page_size - offset).min(len - copied);
            {
                let mut processor = self.kernel.machine().processor();
                let bytes = &mut processor.frame_mut(frame)[offset..offset + amount];
                visit(bytes, copied);
            }
            self.kernel.tables().core_map.unpin(frame);
            copied += amount;
        }

        Ok(copied)
    }

    /// Makes `vpn` resident and pins its frame. `None` if the page is
    /// read-only and `writing` is set.
    fn pin_page(&mut self, vpn: usize, writing: bool) -> Result<Option<FrameId>, VmError> {
        loop {
            {
                let mut tables = self.kernel.tables();
                let KernelTables {
                    core_map,
                    page_tables,
                    ..
                } = &mut *tables;
                let entry = page_tables.get_mut(self.process.pid)?.lookup_mut(vpn)?;
                if let (true, Some(frame)) = (entry.valid, entry.frame) {
                    if writing && entry.read_only {
                        return Ok(None);
                    }
                    entry.referenced = true;
                    entry.dirty |= writing;
                    core_map.pin(frame);
                    return Ok(Some(frame));
                }
            }

            let vaddr = make_address(vpn, 0, self.page_size());
            let result = self.handle_tlb_miss(vaddr);
            self.settle(result)?;
        }
    }

    /// Gives the CPU to any other runnable thread and takes it back.
    pub fn yield_cpu(&mut self) {
        self.save_state();
        self.kernel.machine().cpu().release();
        thread::yield_now();
        self.kernel.machine().cpu().acquire();
        self.restore_state();
    }

    /// Ends the process, returning every frame and swap slot it holds.
    pub fn exit(self) {
        if !self.process.exited.swap(true, Ordering::AcqRel) {
            self.teardown();
            log::info!("process {} exited", self.process.pid);
        }
    }

    /// Called when the process stops executing: the translation cache's bits
    /// go back to the page table and the cache is emptied.
    pub fn save_state(&self) {
        let result = self.sync_out(&mut self.kernel.tables());
        if let Err(err) = result {
            self.abort(err);
        }
    }

    fn sync_out(&self, tables: &mut KernelTables) -> Result<(), VmError> {
        log::trace!("context switch out: process {}", self.process.pid);
        let mut processor = self.kernel.machine().processor();
        match tables.page_tables.get_mut(self.process.pid) {
            Ok(table) => tlb::sync_down(&mut processor, table, true),
            // already torn down
            Err(_) => {
                tlb::flush(&mut processor);
                Ok(())
            }
        }
    }

    /// Called when the process resumes executing.
    pub fn restore_state(&self) {
        log::trace!("context switch in: process {}", self.process.pid);
        // Translations are rebuilt lazily by the miss handler.
        tlb::flush(&mut self.kernel.machine().processor());
    }

    /// Entry point for a trap raised by the processor.
    pub fn handle_exception(&mut self, cause: ExceptionCause) -> Result<(), VmError> {
        let result = self.dispatch(cause);
        self.settle(result)
    }

    fn dispatch(&mut self, cause: ExceptionCause) -> Result<(), VmError> {
        let vaddr = self.kernel.machine().processor().bad_vaddr();
        match cause {
            ExceptionCause::TlbMiss => self.handle_tlb_miss(vaddr),
            ExceptionCause::ReadOnly => Err(VmError::ReadOnlyViolation { vaddr }),
            ExceptionCause::BusError => {
                let vpn = page_from_address(vaddr, self.page_size());
                let processor = self.kernel.machine().processor();
                let frame = processor
                    .tlb_entries()
                    .iter()
                    .find(|entry| entry.valid() && entry.virtual_page() == vpn)
                    .map_or(vpn, |entry| entry.physical_page());
                Err(VmError::FrameTableCorrupt { frame })
            }
        }
    }

    /// Applies the failure policy: process-fatal errors end the process,
    /// anything else reaching this far stops the machine.
    fn settle<T>(&self, result: Result<T, VmError>) -> Result<T, VmError> {
        let err = match result {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        match err.severity() {
            Severity::ProcessFatal => {
                log::warn!("process {} killed: {}", self.process.pid, err);
                if !self.process.exited.swap(true, Ordering::AcqRel) {
                    self.teardown();
                }
                Err(err)
            }
            Severity::KernelFatal | Severity::Recoverable | Severity::Guarded => self.abort(err),
        }
    }

    fn abort(&self, err: VmError) -> ! {
        log::error!("kernel fatal in process {}: {}", self.process.pid, err);
        panic!("kernel fatal: {err}");
    }

    fn handle_tlb_miss(&mut self, vaddr: usize) -> Result<(), VmError> {
        Counters::bump(&self.kernel.counters.tlb_misses);
        let pid = self.process.pid;
        let vpn = page_from_address(vaddr, self.page_size());

        let mut tables = self.kernel.tables();
        let entry = *tables
            .page_tables
            .get(pid)?
            .lookup(vpn)
            .map_err(|_| VmError::SegmentationFault { vaddr })?;

        let mut wakeups = 0;
        if !entry.valid {
            (tables, wakeups) = self.handle_page_fault(tables, vpn)?;
        }

        let KernelTables {
            page_tables, rng, ..
        } = &mut *tables;
        let table = page_tables.get_mut(pid)?;
        let entry = *table.lookup(vpn)?;
        {
            let mut processor = self.kernel.machine().processor();
            let index = tlb::claim_slot(&mut processor, table, rng)?;
            tlb::install(&mut processor, index, vpn, &entry);
        }
        drop(tables);

        for _ in 0..wakeups {
            self.kernel.notify_slot_freed();
        }
        Ok(())
    }

    /// Makes `vpn` valid. Returns the tables (they may have been released
    /// and retaken while waiting for swap) and how many swap waiters to wake
    /// once they are dropped.
    fn handle_page_fault(
        &mut self,
        tables: Tables<'a>,
        vpn: usize,
    ) -> Result<(Tables<'a>, usize), VmError> {
        Counters::bump(&self.kernel.counters.page_faults);
        log::debug!("page fault: process {} page {}", self.process.pid, vpn);

        let (mut tables, frame, passed_on) = self.obtain_frame(tables)?;
        let slot_freed = self.populate(&mut tables, vpn, frame)?;
        Ok((tables, usize::from(passed_on) + usize::from(slot_freed)))
    }

    /// A frame for a new page, pinned and with no owner: a free one if there
    /// is one, otherwise an evicted victim.
    ///
    /// The flag is set when this thread was woken for a swap slot it ended up
    /// not using; the wakeup has to be handed to the next waiter.
    fn obtain_frame(
        &mut self,
        mut tables: Tables<'a>,
    ) -> Result<(Tables<'a>, FrameId, bool), VmError> {
        if let Some(frame) = tables.core_map.acquire() {
            return Ok((tables, frame, false));
        }

        {
            let KernelTables {
                page_tables, ..
            } = &mut *tables;
            let mut processor = self.kernel.machine().processor();
            tlb::sync_down(&mut processor, page_tables.get_mut(self.process.pid)?, false)?;
        }
        let victim = {
            let KernelTables {
                core_map,
                replacement,
                page_tables,
                ..
            } = &mut *tables;
            replacement.select_victim(core_map, page_tables)?
        };
        tables.core_map.pin(victim);

        loop {
            match self.evict(&mut tables, victim) {
                Ok(()) => return Ok((tables, victim, false)),
                Err(VmError::SwapExhausted) => {}
                Err(err) => {
                    tables.core_map.unpin(victim);
                    return Err(err);
                }
            }

            tables = self.wait_for_swap_slot(tables)?;

            // Someone may have exited while we slept.
            if let Some(frame) = tables.core_map.acquire() {
                tables.core_map.unpin(victim);
                let passed_on = tables.swap.free_slots() > 0;
                return Ok((tables, frame, passed_on));
            }
        }
    }

    /// Pushes `victim`'s page out of memory. The frame stays pinned and ends up
    /// with no owner.
    fn evict(&mut self, tables: &mut Tables<'a>, victim: FrameId) -> Result<(), VmError> {
        let KernelTables {
            core_map,
            swap,
            page_tables,
            ..
        } = &mut **tables;
        // The owner exited while we waited for swap; the frame is already ours.
        let Some((owner, vpn)) = core_map.owner(victim) else {
            return Ok(());
        };

        let corrupt = |_| VmError::FrameTableCorrupt { frame: victim };
        let table = page_tables.get_mut(owner).map_err(corrupt)?;
        let entry = *table.lookup(vpn).map_err(corrupt)?;
        if !entry.valid || entry.frame != Some(victim) {
            return Err(VmError::FrameTableCorrupt { frame: victim });
        }

        let mut processor = self.kernel.machine().processor();
        if entry.dirty {
            swap.write_out(owner, vpn, processor.frame(victim))?;
            Counters::bump(&self.kernel.counters.swap_outs);
        }
        tlb::invalidate_stale(&mut processor, victim, table, vpn)?;
        core_map.detach(victim);

        Counters::bump(&self.kernel.counters.evictions);
        log::debug!(
            "evicted page {} of process {} from frame {}{}",
            vpn,
            owner,
            victim,
            if entry.dirty { " to swap" } else { "" }
        );
        Ok(())
    }

    /// Sleeps until a swap slot frees up, with the CPU given away meanwhile.
    fn wait_for_swap_slot(&mut self, mut tables: Tables<'a>) -> Result<Tables<'a>, VmError> {
        log::debug!("process {} waiting for a swap slot", self.process.pid);
        self.sync_out(&mut tables)?;
        drop(tables);

        self.kernel.wait_for_free_slot();

        self.restore_state();
        Ok(self.kernel.tables())
    }

    /// Fills `frame` with page `vpn` and maps it. Returns whether a swap slot
    /// was freed along the way.
    fn populate(
        &mut self,
        tables: &mut Tables<'a>,
        vpn: usize,
        frame: FrameId,
    ) -> Result<bool, VmError> {
        let pid = self.process.pid;
        let KernelTables {
            core_map,
            swap,
            page_tables,
            ..
        } = &mut **tables;
        let resident = match page_tables.get(pid) {
            Ok(table) => table.lookup(vpn)?.valid,
            Err(err) => {
                core_map.unpin(frame);
                return Err(err);
            }
        };
        // Another thread of this process faulted the page in while we slept.
        if resident {
            core_map.unpin(frame);
            return Ok(false);
        }

        let section = self.process.image.find_section(vpn);
        let mut processor = self.kernel.machine().processor();
        let page = processor.frame_mut(frame);

        let from_swap = match swap.lookup(pid, vpn) {
            Some(slot) => match swap.read_in(pid, vpn, slot, page) {
                Ok(()) => true,
                Err(err @ VmError::SlotOwnerMismatch { .. }) => {
                    log::warn!("{}; loading page {} of process {} afresh", err, vpn, pid);
                    false
                }
                Err(err) => return Err(err),
            },
            None => false,
        };

        if from_swap {
            Counters::bump(&self.kernel.counters.swap_ins);
        } else {
            match section {
                Some((index, info)) => {
                    self.process
                        .image
                        .load_page(index, vpn - info.first_vpn, page)
                }
                None => page.fill(0),
            }
        }
        drop(processor);

        let read_only = section.is_some_and(|(_, info)| info.read_only);
        let table = page_tables.get_mut(pid)?;
        table.install(vpn, frame, read_only)?;
        // The slot is gone, so memory holds the only copy.
        table.lookup_mut(vpn)?.dirty = from_swap;
        core_map.install(frame, pid, vpn);

        Ok(from_swap)
    }

    fn teardown(&self) {
        let pid = self.process.pid;
        let mut tables = self.kernel.tables();
        tlb::flush(&mut self.kernel.machine().processor());

        let KernelTables {
            core_map,
            swap,
            page_tables,
            ..
        } = &mut *tables;
        let mut frames = 0;
        if let Some(table) = page_tables.remove(pid) {
            for (_, frame) in table.resident_pages() {
                core_map.release(frame);
                frames += 1;
            }
        }
        let slots = swap.release_process(pid);
        drop(tables);

        log::debug!(
            "process {} released {} frames and {} swap slots",
            pid,
            frames,
            slots
        );
        self.kernel.notify_all();
    }
}

impl Drop for RunningProcess<'_> {
    fn drop(&mut self) {
        let result = if thread::panicking() || self.process.has_exited() {
            Ok(())
        } else {
            self.sync_out(&mut self.kernel.tables())
        };
        self.kernel.machine().cpu().release();
        if let Err(err) = result {
            self.abort(err);
        }
    }
}
