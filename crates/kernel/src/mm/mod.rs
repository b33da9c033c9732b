//! Memory management
//!
//! Layering, bottom to top:
//!
//! - [`page`] - frame arithmetic shared by everything below
//! - [`bitmap`] - the frame-granular allocation bitmap with a rotating hint
//! - [`buddy`] - power-of-two block allocator, orders 0..=10
//! - [`zone`] - DMA / NORMAL / HIGH zones combining one bitmap and one buddy
//! - [`pmm`] - the zone registry initialized from the boot memory map
//!
//! Virtual memory (the 4-level page-table walker) is architecture code and
//! lives in `arch::x86_64::paging`; the heap sits above both in `heap`.

pub mod bitmap;
pub mod buddy;
pub mod page;
pub mod pmm;
pub mod zone;

pub use page::{pa_to_pfn, pfn_to_pa, page_align_down, page_align_up, PhysAddr, Pfn, MAX_ORDER, PAGE_SIZE};
pub use pmm::{alloc_contiguous, alloc_page, free_contiguous, free_page, init_pmm, zero_page};
pub use zone::ZoneType;
