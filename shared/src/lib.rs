pub mod mem;
pub mod paging;
pub mod sizes;
