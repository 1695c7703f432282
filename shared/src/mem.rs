use crate::sizes::KB;

// Geometry of the simulated machine when nothing else is configured.
pub const DEFAULT_PAGE_SIZE: usize = KB;
pub const DEFAULT_NUM_PHYS_PAGES: usize = 16;
pub const DEFAULT_TLB_SIZE: usize = 4;
pub const DEFAULT_SWAP_SLOTS: usize = 16;
pub const DEFAULT_STACK_PAGES: usize = 8;

/// Largest page or frame number a translation entry can hold (24 bits).
pub const MAX_PAGE_NUMBER: usize = (1 << 24) - 1;

/// Virtual page number containing `addr`.
#[inline]
pub const fn page_from_address(addr: usize, page_size: usize) -> usize {
    addr / page_size
}

/// Offset of `addr` inside its page.
#[inline]
pub const fn offset_from_address(addr: usize, page_size: usize) -> usize {
    addr % page_size
}

/// Address of byte `offset` in page `page`.
#[inline]
pub const fn make_address(page: usize, offset: usize, page_size: usize) -> usize {
    page * page_size + offset
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_arithmetic() {
        let page_size = DEFAULT_PAGE_SIZE;
        let addr = make_address(3, 17, page_size);
        assert_eq!(addr, 3 * 1024 + 17);
        assert_eq!(page_from_address(addr, page_size), 3);
        assert_eq!(offset_from_address(addr, page_size), 17);
        assert_eq!(page_from_address(page_size - 1, page_size), 0);
        assert_eq!(page_from_address(page_size, page_size), 1);
    }
}
