//! Self-mirroring address arithmetic.
//!
//! The last directory slot points back at the directory's own frame, which
//! makes the directory and every page table visible at fixed kernel-virtual
//! addresses: table `i` at `MIRROR_BASE + i * 4 KiB`, the directory itself
//! at the very top of the region. Entry lookup becomes plain address
//! arithmetic with no external bookkeeping; only the arithmetic lives here,
//! dereferencing the results is the hardware backend's business.

use crate::memory::addr::VirtAddress;
use crate::memory::page::PAGE_SHIFT;

use super::{pd_index, pt_index};

/// Directory slot holding the mirror entry.
pub const MIRROR_INDEX: usize = 1023;

/// First virtual address covered by the mirror.
pub const MIRROR_BASE: VirtAddress = VirtAddress::from_raw(0xFFC0_0000);

/// Whether an address falls inside the mirror region. Such addresses must
/// never be mapped or unmapped directly.
pub const fn is_mirror(va: VirtAddress) -> bool {
    va.as_raw() >= MIRROR_BASE.as_raw()
}

/// Kernel-virtual address of the directory entry covering `va` in the
/// current address space.
pub const fn pde_vaddr(va: VirtAddress) -> VirtAddress {
    VirtAddress::from_raw(
        MIRROR_BASE.as_raw()
            + ((pd_index(MIRROR_BASE) as u32) << PAGE_SHIFT)
            + ((pd_index(va) as u32) << 2),
    )
}

/// Kernel-virtual address of the table entry covering `va` in the current
/// address space. Only meaningful while the covering directory entry is
/// present.
pub const fn pte_vaddr(va: VirtAddress) -> VirtAddress {
    VirtAddress::from_raw(
        MIRROR_BASE.as_raw()
            + ((pd_index(va) as u32) << PAGE_SHIFT)
            + ((pt_index(va) as u32) << 2),
    )
}
