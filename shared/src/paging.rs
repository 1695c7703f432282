// Translation entries are what the simulated MMU's translation cache holds.
// The layout is fixed by the hardware: one 64-bit word per entry.

// Page and frame numbers are bounds-checked against MAX_PAGE_NUMBER before
// they are narrowed into the 24-bit fields below.
#![allow(clippy::cast_possible_truncation)]

use crate::mem::MAX_PAGE_NUMBER;
use arbitrary_int::u24;
use bitbybit::bitfield;
use core::fmt;

#[bitfield(u64, default = 0)]
pub struct TranslationEntry {
    #[bit(0, rw)]
    valid: bool,
    #[bit(1, rw)]
    read_only: bool,
    #[bit(2, rw)]
    used: bool,
    #[bit(3, rw)]
    dirty: bool,
    #[bits(8..=31, rw)]
    ppn: u24,
    #[bits(32..=55, rw)]
    vpn: u24,
}

impl TranslationEntry {
    /// A valid entry mapping virtual page `vpn` onto frame `ppn`.
    ///
    /// Panics if either number does not fit in 24 bits.
    pub fn mapping(vpn: usize, ppn: usize, read_only: bool) -> Self {
        assert!(vpn <= MAX_PAGE_NUMBER, "vpn {vpn} does not fit a translation entry");
        assert!(ppn <= MAX_PAGE_NUMBER, "ppn {ppn} does not fit a translation entry");

        Self::DEFAULT
            .with_vpn(u24::new(vpn as u32))
            .with_ppn(u24::new(ppn as u32))
            .with_read_only(read_only)
            .with_valid(true)
    }

    pub fn virtual_page(&self) -> usize {
        self.vpn().value() as usize
    }

    pub fn physical_page(&self) -> usize {
        self.ppn().value() as usize
    }
}

impl fmt::Debug for TranslationEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TranslationEntry")
            .field("vpn", &self.virtual_page())
            .field("ppn", &self.physical_page())
            .field("valid", &self.valid())
            .field("read_only", &self.read_only())
            .field("used", &self.used())
            .field("dirty", &self.dirty())
            .finish()
    }
}

impl PartialEq for TranslationEntry {
    fn eq(&self, other: &Self) -> bool {
        self.raw_value() == other.raw_value()
    }
}

impl Eq for TranslationEntry {}
