use swapos_shared::mem::{make_address, offset_from_address, page_from_address};
use swapos_shared::paging::TranslationEntry;

/// Why the processor trapped into the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionCause {
    /// No valid translation-cache entry for the address.
    TlbMiss,
    /// A write through a read-only translation.
    ReadOnly,
    /// A translation pointing past the end of physical memory.
    BusError,
}

/// Physical memory, the translation cache and the fault registers.
pub struct Processor {
    page_size: usize,
    num_phys_pages: usize,
    memory: Box<[u8]>,
    tlb: Box<[TranslationEntry]>,
    bad_vaddr: usize,
}

impl Processor {
    pub fn new(num_phys_pages: usize, page_size: usize, tlb_size: usize) -> Self {
        Self {
            page_size,
            num_phys_pages,
            memory: vec![0; num_phys_pages * page_size].into_boxed_slice(),
            tlb: vec![TranslationEntry::DEFAULT; tlb_size].into_boxed_slice(),
            bad_vaddr: 0,
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn tlb_size(&self) -> usize {
        self.tlb.len()
    }

    pub fn read_tlb_entry(&self, index: usize) -> TranslationEntry {
        self.tlb[index]
    }

    pub fn write_tlb_entry(&mut self, index: usize, entry: TranslationEntry) {
        self.tlb[index] = entry;
    }

    pub fn tlb_entries(&self) -> &[TranslationEntry] {
        &self.tlb
    }

    /// The virtual address that caused the last exception.
    pub fn bad_vaddr(&self) -> usize {
        self.bad_vaddr
    }

    pub fn frame(&self, ppn: usize) -> &[u8] {
        let start = ppn * self.page_size;
        &self.memory[start..start + self.page_size]
    }

    pub fn frame_mut(&mut self, ppn: usize) -> &mut [u8] {
        let start = ppn * self.page_size;
        &mut self.memory[start..start + self.page_size]
    }

    /// Translates `vaddr` through the translation cache the way the MMU would,
    /// setting the used bit (and the dirty bit on writes) of the entry hit.
    pub fn translate(&mut self, vaddr: usize, writing: bool) -> Result<usize, ExceptionCause> {
        let vpn = page_from_address(vaddr, self.page_size);
        let offset = offset_from_address(vaddr, self.page_size);

        let Some(index) = self
            .tlb
            .iter()
            .position(|entry| entry.valid() && entry.virtual_page() == vpn)
        else {
            return self.raise(vaddr, ExceptionCause::TlbMiss);
        };

        let entry = self.tlb[index];
        if writing && entry.read_only() {
            return self.raise(vaddr, ExceptionCause::ReadOnly);
        }

        let ppn = entry.physical_page();
        if ppn >= self.num_phys_pages {
            return self.raise(vaddr, ExceptionCause::BusError);
        }

        self.tlb[index] = entry.with_used(true).with_dirty(entry.dirty() || writing);
        Ok(make_address(ppn, offset, self.page_size))
    }

    pub fn read_byte(&mut self, vaddr: usize) -> Result<u8, ExceptionCause> {
        let paddr = self.translate(vaddr, false)?;
        Ok(self.memory[paddr])
    }

    pub fn write_byte(&mut self, vaddr: usize, value: u8) -> Result<(), ExceptionCause> {
        let paddr = self.translate(vaddr, true)?;
        self.memory[paddr] = value;
        Ok(())
    }

    fn raise<T>(&mut self, vaddr: usize, cause: ExceptionCause) -> Result<T, ExceptionCause> {
        self.bad_vaddr = vaddr;
        Err(cause)
    }
}
