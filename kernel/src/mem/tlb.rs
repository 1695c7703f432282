//! Keeps the translation cache and the running process's page table in step.
//!
//! While a page is mapped by the cache, the cache's `used` and `dirty` bits
//! are the authoritative ones. Everything that reads those bits from a page
//! table (the replacement policy, the swap-out decision) must sync down first.

use crate::machine::Processor;
use crate::mem::frame_allocator::FrameId;
use crate::mem::page_table::{PageTable, PageTableEntry};
use crate::random::Random;
use crate::vm_error::VmError;
use swapos_shared::paging::TranslationEntry;

/// Folds the `used`/`dirty` bits of every valid cache entry into `page_table`
/// and clears the cache's `used` bits. With `invalidate`, the cache is emptied
/// as well.
///
/// `page_table` must belong to the process whose entries the cache holds.
pub fn sync_down(
    processor: &mut Processor,
    page_table: &mut PageTable,
    invalidate: bool,
) -> Result<(), VmError> {
    for index in 0..processor.tlb_size() {
        let cached = processor.read_tlb_entry(index);
        if !cached.valid() {
            continue;
        }

        let frame = cached.physical_page();
        let entry = page_table
            .lookup_mut(cached.virtual_page())
            .map_err(|_| VmError::FrameTableCorrupt { frame })?;
        if !entry.valid || entry.frame != Some(frame) {
            return Err(VmError::FrameTableCorrupt { frame });
        }
        entry.dirty |= cached.dirty();
        entry.referenced |= cached.used();

        let synced = if invalidate {
            TranslationEntry::DEFAULT
        } else {
            cached.with_used(false).with_dirty(entry.dirty)
        };
        processor.write_tlb_entry(index, synced);
    }
    Ok(())
}

/// Drops every cache entry that points at `frame` and invalidates page `vpn`
/// of `page_table`, the frame's current occupant.
///
/// Cached bits are not folded in; callers that care about them sync down
/// before picking the frame.
pub fn invalidate_stale(
    processor: &mut Processor,
    frame: FrameId,
    page_table: &mut PageTable,
    vpn: usize,
) -> Result<(), VmError> {
    for index in 0..processor.tlb_size() {
        let cached = processor.read_tlb_entry(index);
        if cached.valid() && cached.physical_page() == frame {
            log::trace!("dropping stale translation {:?}", cached);
            processor.write_tlb_entry(index, TranslationEntry::DEFAULT);
        }
    }
    page_table.mark_invalid(vpn)
}

/// First invalid cache slot, if there is one.
pub fn free_slot(processor: &Processor) -> Option<usize> {
    processor
        .tlb_entries()
        .iter()
        .position(|entry| !entry.valid())
}

/// Picks the cache slot to overwrite. When the cache is full, the current
/// bits are synced down first and a slot is chosen at random.
pub fn claim_slot(
    processor: &mut Processor,
    page_table: &mut PageTable,
    rng: &mut Random,
) -> Result<usize, VmError> {
    if let Some(index) = free_slot(processor) {
        return Ok(index);
    }

    sync_down(processor, page_table, false)?;
    let index = rng.next_below(processor.tlb_size());
    log::trace!(
        "evicting translation {:?} from slot {}",
        processor.read_tlb_entry(index),
        index
    );
    Ok(index)
}

/// Loads the translation for a valid page-table entry into cache slot `index`.
pub fn install(processor: &mut Processor, index: usize, vpn: usize, entry: &PageTableEntry) {
    let Some(frame) = entry.frame.filter(|_| entry.valid) else {
        panic!("installing a translation for invalid page {vpn}");
    };
    let cached = TranslationEntry::mapping(vpn, frame, entry.read_only).with_dirty(entry.dirty);
    log::trace!("slot {} <- {:?}", index, cached);
    processor.write_tlb_entry(index, cached);
}

/// Invalidates the whole cache without looking at it.
pub fn flush(processor: &mut Processor) {
    for index in 0..processor.tlb_size() {
        processor.write_tlb_entry(index, TranslationEntry::DEFAULT);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: usize = 64;

    fn setup() -> (Processor, PageTable) {
        let mut processor = Processor::new(4, PAGE, 2);
        let mut table = PageTable::new(4);
        table.install(0, 2, false).expect("in range");
        table.install(1, 3, true).expect("in range");
        let entry = *table.lookup(0).expect("in range");
        install(&mut processor, 0, 0, &entry);
        let entry = *table.lookup(1).expect("in range");
        install(&mut processor, 1, 1, &entry);
        (processor, table)
    }

    #[test]
    fn test_sync_down_folds_bits_and_keeps_entries() {
        let (mut processor, mut table) = setup();
        processor.write_byte(5, 0xAB).expect("mapped");
        processor.read_byte(PAGE + 1).expect("mapped");

        sync_down(&mut processor, &mut table, false).expect("consistent");

        let page0 = *table.lookup(0).expect("in range");
        let page1 = *table.lookup(1).expect("in range");
        assert!(page0.referenced && page0.dirty);
        assert!(page1.referenced && !page1.dirty);

        let cached = processor.read_tlb_entry(0);
        assert!(cached.valid() && !cached.used() && cached.dirty());
        assert_eq!(free_slot(&processor), None);
    }

    #[test]
    fn test_sync_down_with_invalidate_empties_cache() {
        let (mut processor, mut table) = setup();
        processor.write_byte(1, 1).expect("mapped");

        sync_down(&mut processor, &mut table, true).expect("consistent");

        assert!(table.lookup(0).expect("in range").dirty);
        assert!(processor.tlb_entries().iter().all(|entry| !entry.valid()));
        assert_eq!(free_slot(&processor), Some(0));
    }

    #[test]
    fn test_sync_down_rejects_mismatched_frame() {
        let (mut processor, mut table) = setup();
        table.install(0, 1, false).expect("in range");

        assert!(matches!(
            sync_down(&mut processor, &mut table, false),
            Err(VmError::FrameTableCorrupt { frame: 2 })
        ));
    }

    #[test]
    fn test_invalidate_stale_hits_cache_and_table() {
        let (mut processor, mut table) = setup();

        invalidate_stale(&mut processor, 3, &mut table, 1).expect("in range");

        assert!(!table.lookup(1).expect("in range").valid);
        assert!(table.lookup(0).expect("in range").valid);
        assert!(processor.read_tlb_entry(0).valid());
        assert!(!processor.read_tlb_entry(1).valid());
    }

    #[test]
    fn test_claim_slot_prefers_free_then_random() {
        let mut processor = Processor::new(4, PAGE, 2);
        let mut table = PageTable::new(4);
        let mut rng = Random::new(7);
        assert_eq!(claim_slot(&mut processor, &mut table, &mut rng).ok(), Some(0));

        let (mut processor, mut table) = setup();
        processor.read_byte(0).expect("mapped");
        let index = claim_slot(&mut processor, &mut table, &mut rng).expect("consistent");
        assert!(index < 2);
        // a full cache is synced down before a slot is sacrificed
        assert!(table.lookup(0).expect("in range").referenced);
    }

    #[test]
    fn test_flush() {
        let (mut processor, _) = setup();
        flush(&mut processor);
        assert_eq!(free_slot(&processor), Some(0));
    }
}
