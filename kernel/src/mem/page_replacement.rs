use crate::mem::frame_allocator::{CoreMap, FrameId};
use crate::mem::page_table::PageTables;
use crate::random::Random;
use crate::vm_error::VmError;

/// Picks which resident page to push out when no frame is free.
///
/// Implementations only look at frames that are owned and unpinned. They may
/// update reference bits in `page_tables`, but never change which frame a page
/// lives in.
pub trait PageReplacementPolicy: Send {
    fn select_victim(
        &mut self,
        core_map: &CoreMap,
        page_tables: &mut PageTables,
    ) -> Result<FrameId, VmError>;

    fn name(&self) -> &'static str;
}

/// Second-chance replacement. The hand sweeps the frames in order, clearing
/// reference bits, and takes the first unreferenced page it meets.
#[derive(Debug, Default)]
pub struct Clock {
    hand: FrameId,
}

impl Clock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hand(&self) -> FrameId {
        self.hand
    }
}

impl PageReplacementPolicy for Clock {
    fn select_victim(
        &mut self,
        core_map: &CoreMap,
        page_tables: &mut PageTables,
    ) -> Result<FrameId, VmError> {
        let num_frames = core_map.len();

        // Two full sweeps: the first may only clear reference bits.
        for _ in 0..2 * num_frames {
            let frame = self.hand % num_frames;
            self.hand = (frame + 1) % num_frames;

            if core_map.is_pinned(frame) {
                continue;
            }
            let Some((pid, vpn)) = core_map.owner(frame) else {
                continue;
            };

            let entry = page_tables
                .get_mut(pid)
                .and_then(|table| table.lookup_mut(vpn))
                .map_err(|_| VmError::FrameTableCorrupt { frame })?;
            if !entry.valid || entry.frame != Some(frame) {
                return Err(VmError::FrameTableCorrupt { frame });
            }

            if entry.referenced {
                entry.referenced = false;
            } else {
                return Ok(frame);
            }
        }

        Err(VmError::NoVictimAvailable)
    }

    fn name(&self) -> &'static str {
        "clock"
    }
}

/// Evicts a uniformly chosen unpinned page.
pub struct RandomEviction {
    rng: Random,
}

impl RandomEviction {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Random::new(seed),
        }
    }
}

impl PageReplacementPolicy for RandomEviction {
    fn select_victim(
        &mut self,
        core_map: &CoreMap,
        _page_tables: &mut PageTables,
    ) -> Result<FrameId, VmError> {
        let candidates: Vec<FrameId> = (0..core_map.len())
            .filter(|&frame| !core_map.is_pinned(frame) && core_map.owner(frame).is_some())
            .collect();

        if candidates.is_empty() {
            return Err(VmError::NoVictimAvailable);
        }

        let index = self.rng.next_below(candidates.len());
        Ok(candidates[index])
    }

    fn name(&self) -> &'static str {
        "random"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::page_table::PageTable;

    const PID: u16 = 1;

    /// `num_frames` frames, each holding the page of the same number.
    fn resident(num_frames: usize) -> (CoreMap, PageTables) {
        let mut core_map = CoreMap::new(num_frames);
        let mut table = PageTable::new(num_frames + 1);
        for vpn in 0..num_frames {
            let frame = core_map.acquire().expect("free frame");
            core_map.install(frame, PID, vpn);
            table.install(vpn, frame, false).expect("in range");
        }
        let mut page_tables = PageTables::new();
        page_tables.insert(PID, table);
        (core_map, page_tables)
    }

    fn reference(page_tables: &mut PageTables, vpn: usize) {
        let entry = page_tables
            .get_mut(PID)
            .and_then(|table| table.lookup_mut(vpn))
            .expect("mapped page");
        entry.referenced = true;
    }

    #[test]
    fn test_clock_takes_first_unreferenced_frame() {
        let (core_map, mut page_tables) = resident(3);
        let mut clock = Clock::new();

        assert_eq!(clock.select_victim(&core_map, &mut page_tables).ok(), Some(0));
        assert_eq!(clock.hand(), 1);
        assert_eq!(clock.select_victim(&core_map, &mut page_tables).ok(), Some(1));
    }

    #[test]
    fn test_clock_gives_second_chance() {
        let (core_map, mut page_tables) = resident(3);
        reference(&mut page_tables, 0);
        reference(&mut page_tables, 1);
        let mut clock = Clock::new();

        assert_eq!(clock.select_victim(&core_map, &mut page_tables).ok(), Some(2));
        let table = page_tables.get(PID).expect("present");
        assert!(!table.lookup(0).expect("mapped").referenced);
        assert!(!table.lookup(1).expect("mapped").referenced);
    }

    #[test]
    fn test_clock_wraps_when_everything_is_referenced() {
        let (core_map, mut page_tables) = resident(2);
        reference(&mut page_tables, 0);
        reference(&mut page_tables, 1);
        let mut clock = Clock::new();

        assert_eq!(clock.select_victim(&core_map, &mut page_tables).ok(), Some(0));
    }

    #[test]
    fn test_clock_skips_pinned_frames() {
        let (mut core_map, mut page_tables) = resident(3);
        core_map.pin(0);
        core_map.pin(1);
        let mut clock = Clock::new();

        assert_eq!(clock.select_victim(&core_map, &mut page_tables).ok(), Some(2));
    }

    #[test]
    fn test_clock_reports_no_victim_when_all_pinned() {
        let (mut core_map, mut page_tables) = resident(2);
        core_map.pin(0);
        core_map.pin(1);

        assert!(matches!(
            Clock::new().select_victim(&core_map, &mut page_tables),
            Err(VmError::NoVictimAvailable)
        ));
    }

    #[test]
    fn test_clock_detects_disagreeing_tables() {
        let (core_map, mut page_tables) = resident(2);
        page_tables
            .get_mut(PID)
            .and_then(|table| table.mark_invalid(0))
            .expect("mapped page");

        assert!(matches!(
            Clock::new().select_victim(&core_map, &mut page_tables),
            Err(VmError::FrameTableCorrupt { frame: 0 })
        ));
    }

    #[test]
    fn test_random_only_picks_candidates() {
        let (mut core_map, mut page_tables) = resident(4);
        core_map.pin(1);
        core_map.pin(3);
        let mut policy = RandomEviction::new(42);

        for _ in 0..64 {
            let frame = policy
                .select_victim(&core_map, &mut page_tables)
                .expect("two candidates");
            assert!(frame == 0 || frame == 2);
        }

        core_map.pin(0);
        core_map.pin(2);
        assert!(matches!(
            policy.select_victim(&core_map, &mut page_tables),
            Err(VmError::NoVictimAvailable)
        ));
    }
}
