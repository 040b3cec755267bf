//! Constants for the emulation core.

/// Size of memory area that a page can point to.
pub const PAGE_SIZE: usize = 4096;
/// Bit width of the in-page offset.
pub const PAGE_SHIFT: usize = 12;
/// Mask selecting the page number bits of an address.
pub const PAGE_MASK: usize = !(PAGE_SIZE - 1);

/// Size of one shadow page-table node.
pub const PT_NODE_SIZE: usize = PAGE_SIZE;
/// Shadow page-table memory carved out per hart (4 MiB).
pub const PT_SPACE_SIZE: usize = 0x40_0000;
/// Alignment of the shadow page-table region.
pub const PT_ALIGN: usize = 0x20_0000;

/// Maximum number of HARTs.
pub const MAX_HART_NUM: usize = 8;

/// Machine previous privilege: U-mode.
pub const PRV_U: usize = 0;
/// Machine previous privilege: S-mode.
pub const PRV_S: usize = 1;
/// Machine previous privilege: M-mode.
pub const PRV_M: usize = 3;
