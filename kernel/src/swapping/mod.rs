//! The swap extent: a free-slot list plus the maps that say which process's
//! page lives in which slot.
//!
//! Slot `i` occupies bytes `i * page_size .. (i + 1) * page_size` of the
//! backing store. Whether a slot is in use is tracked only here.

pub mod backing_store;

pub use backing_store::{BackingStore, FileStore, MemoryStore};

use crate::threading::process::Pid;
use crate::vm_error::VmError;
use std::collections::{BTreeMap, VecDeque};
use std::io;

/// Index of a page-sized slot in the swap extent.
pub type SwapSlot = usize;

pub struct SwapSpace {
    store: Box<dyn BackingStore>,
    page_size: usize,
    num_slots: usize,
    free_slots: VecDeque<SwapSlot>,
    /// `(pid, vpn)` -> slot holding that page.
    resident: BTreeMap<(Pid, usize), SwapSlot>,
    /// slot -> process whose page it holds.
    owners: BTreeMap<SwapSlot, Pid>,
}

impl SwapSpace {
    /// Carves `store` into page-sized slots, all free.
    pub fn new(store: Box<dyn BackingStore>, page_size: usize) -> Self {
        assert!(page_size > 0);
        let num_slots = store.len() / page_size;

        Self {
            store,
            page_size,
            num_slots,
            free_slots: (0..num_slots).collect(),
            resident: BTreeMap::new(),
            owners: BTreeMap::new(),
        }
    }

    pub fn num_slots(&self) -> usize {
        self.num_slots
    }

    pub fn free_slots(&self) -> usize {
        self.free_slots.len()
    }

    pub fn lookup(&self, pid: Pid, vpn: usize) -> Option<SwapSlot> {
        self.resident.get(&(pid, vpn)).copied()
    }

    pub fn owner(&self, slot: SwapSlot) -> Option<Pid> {
        self.owners.get(&slot).copied()
    }

    /// Stores page `vpn` of `pid` in a free slot.
    ///
    /// Fails with [`VmError::SwapExhausted`] when every slot is taken; the
    /// caller is expected to wait for [`SwapSpace::read_in`] or
    /// [`SwapSpace::release_process`] to free one and try again.
    pub fn write_out(&mut self, pid: Pid, vpn: usize, page: &[u8]) -> Result<SwapSlot, VmError> {
        assert_eq!(page.len(), self.page_size, "swap writes whole pages");
        if let Some(slot) = self.lookup(pid, vpn) {
            return Err(VmError::SwapTableCorrupt { slot });
        }

        let slot = self.free_slots.pop_front().ok_or(VmError::SwapExhausted)?;
        if let Err(err) = self.store.write(slot * self.page_size, page) {
            self.free_slots.push_front(slot);
            return Err(err.into());
        }

        self.resident.insert((pid, vpn), slot);
        self.owners.insert(slot, pid);
        log::debug!("swapped out page {} of process {} to slot {}", vpn, pid, slot);
        Ok(slot)
    }

    /// Reads `slot` back into `frame` and frees the slot.
    ///
    /// The slot must currently hold page `vpn` of `pid`; otherwise the lookup
    /// that produced it is stale and [`VmError::SlotOwnerMismatch`] is
    /// returned without touching `frame`.
    pub fn read_in(
        &mut self,
        pid: Pid,
        vpn: usize,
        slot: SwapSlot,
        frame: &mut [u8],
    ) -> Result<(), VmError> {
        assert_eq!(frame.len(), self.page_size, "swap reads whole pages");
        let found = self.owner(slot);
        if found != Some(pid) || self.lookup(pid, vpn) != Some(slot) {
            return Err(VmError::SlotOwnerMismatch {
                slot,
                expected: pid,
                found,
            });
        }

        self.store.read(slot * self.page_size, frame)?;

        self.resident.remove(&(pid, vpn));
        self.owners.remove(&slot);
        self.free_slots.push_back(slot);
        log::debug!("swapped in page {} of process {} from slot {}", vpn, pid, slot);
        Ok(())
    }

    /// Frees every slot held by `pid`, returning how many there were.
    pub fn release_process(&mut self, pid: Pid) -> usize {
        let pages: Vec<(usize, SwapSlot)> = self
            .resident
            .range((pid, 0)..=(pid, usize::MAX))
            .map(|(&(_, vpn), &slot)| (vpn, slot))
            .collect();

        for &(vpn, slot) in &pages {
            self.resident.remove(&(pid, vpn));
            self.owners.remove(&slot);
            self.free_slots.push_back(slot);
        }
        pages.len()
    }

    /// Checks that every slot is either free or mapped, never both, and that
    /// the two maps agree.
    pub fn audit(&self) -> Result<(), VmError> {
        let mut seen = vec![false; self.num_slots];

        for &slot in &self.free_slots {
            match seen.get_mut(slot) {
                Some(seen) if !*seen => *seen = true,
                _ => return Err(VmError::SwapTableCorrupt { slot }),
            }
        }
        for (&(pid, _), &slot) in &self.resident {
            match seen.get_mut(slot) {
                Some(seen) if !*seen => *seen = true,
                _ => return Err(VmError::SwapTableCorrupt { slot }),
            }
            if self.owner(slot) != Some(pid) {
                return Err(VmError::SwapTableCorrupt { slot });
            }
        }
        if let Some(slot) = seen.iter().position(|seen| !seen) {
            return Err(VmError::SwapTableCorrupt { slot });
        }
        if self.owners.len() != self.resident.len() {
            let slot = self
                .owners
                .keys()
                .copied()
                .find(|slot| !self.resident.values().any(|used| used == slot))
                .unwrap_or_default();
            return Err(VmError::SwapTableCorrupt { slot });
        }
        Ok(())
    }

    /// Deletes the backing extent. Every slot's contents are lost.
    pub fn remove(&mut self) -> io::Result<()> {
        self.resident.clear();
        self.owners.clear();
        self.free_slots = (0..self.num_slots).collect();
        self.store.remove()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: usize = 8;

    fn swap(slots: usize) -> SwapSpace {
        SwapSpace::new(Box::new(MemoryStore::new(slots * PAGE)), PAGE)
    }

    struct BrokenStore;

    impl BackingStore for BrokenStore {
        fn read(&mut self, _: usize, _: &mut [u8]) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::Other, "read failed"))
        }
        fn write(&mut self, _: usize, _: &[u8]) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::Other, "write failed"))
        }
        fn len(&self) -> usize {
            PAGE
        }
        fn remove(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_round_trip_frees_slot() {
        let mut swap = swap(2);
        let page = [7u8, 6, 5, 4, 3, 2, 1, 0];

        let slot = swap.write_out(1, 9, &page).expect("free slot");
        assert_eq!(swap.lookup(1, 9), Some(slot));
        assert_eq!(swap.owner(slot), Some(1));
        assert_eq!(swap.free_slots(), 1);
        swap.audit().expect("consistent");

        let mut frame = [0; PAGE];
        swap.read_in(1, 9, slot, &mut frame).expect("owned slot");
        assert_eq!(frame, page);
        assert_eq!(swap.lookup(1, 9), None);
        assert_eq!(swap.free_slots(), 2);
        swap.audit().expect("consistent");
    }

    #[test]
    fn test_exhaustion() {
        let mut swap = swap(1);
        swap.write_out(1, 0, &[1; PAGE]).expect("free slot");
        assert!(matches!(
            swap.write_out(2, 0, &[2; PAGE]),
            Err(VmError::SwapExhausted)
        ));
        swap.audit().expect("consistent");
    }

    #[test]
    fn test_read_in_checks_owner() {
        let mut swap = swap(2);
        let slot = swap.write_out(1, 3, &[1; PAGE]).expect("free slot");
        let mut frame = [0xFF; PAGE];

        assert!(matches!(
            swap.read_in(2, 3, slot, &mut frame),
            Err(VmError::SlotOwnerMismatch {
                expected: 2,
                found: Some(1),
                ..
            })
        ));
        assert!(matches!(
            swap.read_in(1, 3, slot + 1, &mut frame),
            Err(VmError::SlotOwnerMismatch { found: None, .. })
        ));
        assert_eq!(frame, [0xFF; PAGE]);
        assert_eq!(swap.lookup(1, 3), Some(slot));
    }

    #[test]
    fn test_release_process_only_frees_its_slots() {
        let mut swap = swap(4);
        swap.write_out(1, 0, &[0; PAGE]).expect("free slot");
        swap.write_out(2, 0, &[0; PAGE]).expect("free slot");
        swap.write_out(1, 5, &[0; PAGE]).expect("free slot");

        assert_eq!(swap.release_process(1), 2);
        assert_eq!(swap.free_slots(), 3);
        assert!(swap.lookup(2, 0).is_some());
        assert_eq!(swap.release_process(1), 0);
        swap.audit().expect("consistent");
    }

    #[test]
    fn test_write_failure_keeps_slot_free() {
        let mut swap = SwapSpace::new(Box::new(BrokenStore), PAGE);
        let err = swap.write_out(1, 0, &[0; PAGE]).expect_err("broken store");
        assert!(matches!(err, VmError::SwapIo(_)));
        assert_eq!(swap.free_slots(), 1);
        swap.audit().expect("consistent");
    }

    #[test]
    fn test_double_write_out_is_corruption() {
        let mut swap = swap(2);
        let slot = swap.write_out(1, 0, &[0; PAGE]).expect("free slot");
        assert!(matches!(
            swap.write_out(1, 0, &[0; PAGE]),
            Err(VmError::SwapTableCorrupt { slot: found }) if found == slot
        ));
    }

    #[test]
    fn test_remove_forgets_everything() {
        let mut swap = swap(2);
        swap.write_out(1, 0, &[0; PAGE]).expect("free slot");
        swap.remove().expect("memory store");
        assert_eq!(swap.free_slots(), 2);
        assert_eq!(swap.lookup(1, 0), None);
    }
}
