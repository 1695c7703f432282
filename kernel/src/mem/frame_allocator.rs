// Frame and page numbers are bounds-checked before they are narrowed into the
// packed fields below.
#![allow(clippy::cast_possible_truncation)]

use crate::threading::process::Pid;
use arbitrary_int::{u24, u7};
use bitbybit::bitfield;
use std::collections::VecDeque;
use swapos_shared::mem::MAX_PAGE_NUMBER;

/// Largest pin count the packed entry can hold.
const MAX_PINS: u8 = 0x7f;

/// Index of a physical frame.
pub type FrameId = usize;

/// Inverted table entry: who, if anyone, currently lives in a frame.
#[bitfield(u64, default = 0)]
pub struct CoreMapEntry {
    #[bit(0, rw)]
    allocated: bool,
    /// Number of outstanding pins. A pinned frame is never chosen for eviction.
    #[bits(1..=7, rw)]
    pin_count: u7,
    #[bits(8..=23, rw)]
    pid: u16,
    #[bit(24, rw)]
    owned: bool,
    #[bits(32..=55, rw)]
    vpn: u24,
}

/// The inverted page table plus the free-frame list.
///
/// Every frame is in exactly one of three states: free (on the free list),
/// reserved (allocated, pinned, no owner yet) or owned by a `(pid, vpn)`.
pub struct CoreMap {
    entries: Box<[CoreMapEntry]>,
    free_frames: VecDeque<FrameId>,
}

impl CoreMap {
    pub fn new(num_frames: usize) -> Self {
        assert!(num_frames > 0, "a machine needs at least one frame");
        assert!(num_frames - 1 <= MAX_PAGE_NUMBER);

        Self {
            entries: vec![CoreMapEntry::DEFAULT; num_frames].into_boxed_slice(),
            free_frames: (0..num_frames).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn free_count(&self) -> usize {
        self.free_frames.len()
    }

    /// Takes a frame off the free list. The frame comes back pinned with no
    /// owner, so that it cannot be stolen before [`CoreMap::install`].
    pub fn acquire(&mut self) -> Option<FrameId> {
        let frame = self.free_frames.pop_front()?;
        let entry = &mut self.entries[frame];
        assert!(!entry.allocated(), "free frame {frame} is marked allocated");
        *entry = CoreMapEntry::DEFAULT
            .with_allocated(true)
            .with_pin_count(u7::new(1));
        Some(frame)
    }

    /// Records `(pid, vpn)` as the frame's occupant and drops every pin.
    pub fn install(&mut self, frame: FrameId, pid: Pid, vpn: usize) {
        assert!(vpn <= MAX_PAGE_NUMBER, "vpn {vpn} does not fit the inverted table");
        let entry = &mut self.entries[frame];
        assert!(entry.allocated(), "installing into free frame {frame}");
        *entry = CoreMapEntry::DEFAULT
            .with_allocated(true)
            .with_owned(true)
            .with_pid(pid)
            .with_vpn(u24::new(vpn as u32));
    }

    /// Forgets the frame's occupant but keeps the frame reserved, for a victim
    /// about to be handed to a new page.
    pub fn detach(&mut self, frame: FrameId) {
        let entry = &mut self.entries[frame];
        assert!(entry.allocated(), "detaching free frame {frame}");
        *entry = CoreMapEntry::DEFAULT
            .with_allocated(true)
            .with_pin_count(entry.pin_count());
    }

    /// Gives the frame back. A pinned frame is in the middle of an eviction by
    /// someone else; it only loses its owner and that evictor keeps it.
    pub fn release(&mut self, frame: FrameId) {
        let entry = self.entries[frame];
        assert!(entry.allocated(), "releasing free frame {frame}");
        if entry.pin_count().value() > 0 {
            self.detach(frame);
        } else {
            self.entries[frame] = CoreMapEntry::DEFAULT;
            debug_assert!(!self.free_frames.contains(&frame));
            self.free_frames.push_back(frame);
        }
    }

    pub fn pin(&mut self, frame: FrameId) {
        let entry = &mut self.entries[frame];
        assert!(entry.allocated(), "pinning free frame {frame}");
        let pins = entry.pin_count().value();
        assert!(pins < MAX_PINS, "frame {frame} pinned too many times");
        *entry = entry.with_pin_count(u7::new(pins + 1));
    }

    /// Drops one pin. A reserved frame that loses its last pin without ever
    /// being installed goes back on the free list.
    pub fn unpin(&mut self, frame: FrameId) {
        let entry = self.entries[frame];
        let pins = entry.pin_count().value();
        assert!(pins > 0, "unpinning frame {frame} which is not pinned");

        if pins == 1 && !entry.owned() {
            self.entries[frame] = CoreMapEntry::DEFAULT;
            self.free_frames.push_back(frame);
        } else {
            self.entries[frame] = entry.with_pin_count(u7::new(pins - 1));
        }
    }

    pub fn is_pinned(&self, frame: FrameId) -> bool {
        self.entries[frame].pin_count().value() > 0
    }

    pub fn is_allocated(&self, frame: FrameId) -> bool {
        self.entries[frame].allocated()
    }

    pub fn is_free(&self, frame: FrameId) -> bool {
        self.free_frames.contains(&frame)
    }

    /// The `(pid, vpn)` living in the frame, if any.
    pub fn owner(&self, frame: FrameId) -> Option<(Pid, usize)> {
        let entry = self.entries.get(frame)?;
        entry
            .owned()
            .then(|| (entry.pid(), entry.vpn().value() as usize))
    }
}
