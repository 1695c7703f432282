//! Physical memory bookkeeping: page tables, the inverted frame table,
//! eviction policies and the translation-cache sync layer.

pub mod frame_allocator;
pub mod page_replacement;
pub mod page_table;
pub mod tlb;

pub use frame_allocator::{CoreMap, FrameId};
pub use page_replacement::{Clock, PageReplacementPolicy, RandomEviction};
pub use page_table::{PageTable, PageTableEntry, PageTables};
