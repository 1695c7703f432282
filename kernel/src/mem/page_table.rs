use crate::mem::FrameId;
use crate::threading::process::Pid;
use crate::vm_error::VmError;
use std::collections::BTreeMap;

/// One virtual page of a process.
///
/// `valid` implies `frame` is set and that frame's inverted entry names this
/// page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageTableEntry {
    pub frame: Option<FrameId>,
    pub valid: bool,
    pub dirty: bool,
    pub referenced: bool,
    pub read_only: bool,
}

/// A process's page table: one entry per virtual page, indexed by page number.
#[derive(Debug, Clone)]
pub struct PageTable {
    entries: Box<[PageTableEntry]>,
}

impl PageTable {
    /// A table of `num_pages` entries, none of them valid.
    pub fn new(num_pages: usize) -> Self {
        Self {
            entries: vec![PageTableEntry::default(); num_pages].into_boxed_slice(),
        }
    }

    pub fn num_pages(&self) -> usize {
        self.entries.len()
    }

    pub fn lookup(&self, vpn: usize) -> Result<&PageTableEntry, VmError> {
        let num_pages = self.num_pages();
        self.entries
            .get(vpn)
            .ok_or(VmError::OutOfRange { vpn, num_pages })
    }

    pub fn lookup_mut(&mut self, vpn: usize) -> Result<&mut PageTableEntry, VmError> {
        let num_pages = self.num_pages();
        self.entries
            .get_mut(vpn)
            .ok_or(VmError::OutOfRange { vpn, num_pages })
    }

    /// Forgets the page's frame. Its contents must already be saved elsewhere
    /// (or be reproducible) by the time this is called.
    pub fn mark_invalid(&mut self, vpn: usize) -> Result<(), VmError> {
        let entry = self.lookup_mut(vpn)?;
        entry.frame = None;
        entry.valid = false;
        entry.dirty = false;
        entry.referenced = false;
        Ok(())
    }

    pub fn install(&mut self, vpn: usize, frame: FrameId, read_only: bool) -> Result<(), VmError> {
        let entry = self.lookup_mut(vpn)?;
        *entry = PageTableEntry {
            frame: Some(frame),
            valid: true,
            dirty: false,
            referenced: false,
            read_only,
        };
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &PageTableEntry)> {
        self.entries.iter().enumerate()
    }

    /// `(vpn, frame)` for every valid entry.
    pub fn resident_pages(&self) -> impl Iterator<Item = (usize, FrameId)> + '_ {
        self.iter()
            .filter(|(_, entry)| entry.valid)
            .filter_map(|(vpn, entry)| entry.frame.map(|frame| (vpn, frame)))
    }
}

/// Every live process's page table, keyed by pid.
#[derive(Debug, Default)]
pub struct PageTables {
    tables: BTreeMap<Pid, PageTable>,
}

impl PageTables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, pid: Pid, table: PageTable) {
        assert!(
            !self.tables.contains_key(&pid),
            "page table for pid {} already present",
            pid
        );
        self.tables.insert(pid, table);
    }

    pub fn remove(&mut self, pid: Pid) -> Option<PageTable> {
        self.tables.remove(&pid)
    }

    pub fn get(&self, pid: Pid) -> Result<&PageTable, VmError> {
        self.tables.get(&pid).ok_or(VmError::NoSuchProcess { pid })
    }

    pub fn get_mut(&mut self, pid: Pid) -> Result<&mut PageTable, VmError> {
        self.tables.get_mut(&pid).ok_or(VmError::NoSuchProcess { pid })
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.tables.contains_key(&pid)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Pid, &PageTable)> {
        self.tables.iter().map(|(pid, table)| (*pid, table))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_table_is_all_invalid() {
        let table = PageTable::new(4);
        assert_eq!(table.num_pages(), 4);
        assert!(table.iter().all(|(_, entry)| *entry == PageTableEntry::default()));
        assert_eq!(table.resident_pages().count(), 0);
    }

    #[test]
    fn test_lookup_is_bounds_checked() {
        let mut table = PageTable::new(2);
        assert!(table.lookup(1).is_ok());
        assert!(matches!(
            table.lookup(2),
            Err(VmError::OutOfRange { vpn: 2, num_pages: 2 })
        ));
        assert!(table.install(5, 0, false).is_err());
        assert!(table.mark_invalid(2).is_err());
    }

    #[test]
    fn test_install_then_invalidate() {
        let mut table = PageTable::new(3);
        table.install(1, 7, true).expect("in range");

        let entry = *table.lookup(1).expect("in range");
        assert!(entry.valid && entry.read_only);
        assert_eq!(entry.frame, Some(7));
        assert_eq!(table.resident_pages().collect::<Vec<_>>(), vec![(1, 7)]);

        let entry = table.lookup_mut(1).expect("in range");
        entry.dirty = true;
        entry.referenced = true;

        table.mark_invalid(1).expect("in range");
        let entry = *table.lookup(1).expect("in range");
        assert!(!entry.valid && !entry.dirty && !entry.referenced);
        assert_eq!(entry.frame, None);
    }

    #[test]
    fn test_page_tables_by_pid() {
        let mut tables = PageTables::new();
        tables.insert(3, PageTable::new(1));
        assert!(tables.contains(3));
        assert!(matches!(tables.get(4), Err(VmError::NoSuchProcess { pid: 4 })));
        assert_eq!(tables.get_mut(3).expect("present").num_pages(), 1);
        assert!(tables.remove(3).is_some());
        assert!(!tables.contains(3));
    }
}
