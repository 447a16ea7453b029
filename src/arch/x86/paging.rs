//! The real page tables, seen through the self-mirroring directory slot.
//!
//! The last directory entry points at the directory's own frame, so the
//! directory and every page table appear at fixed addresses near the top of
//! the kernel space and entry lookup is plain arithmetic
//! (`shared::paging::mirror`). TLB maintenance is per-page `invlpg` where
//! the affected range is known and a full reload otherwise.

use core::ptr::NonNull;

use shared::error::MemoryError;
use shared::memory::addr::{Length, PhysAddress, VirtAddress};
use shared::memory::frame::{AllocFlags, FrameTable};
use shared::memory::page::{Frame, Page, KERNEL_BASE, PAGE_SIZE};
use shared::paging::mirror::{self, MIRROR_BASE, MIRROR_INDEX};
use shared::paging::{
    pd_index, pt_index, page_offset, Access, AddressSpace, EntryFlags, MapFlags, PageDirectory,
    TableEntry, KERNEL_PD_INDEX,
};

use super::cpu;

/// The kernel's own page directory. Structurally fixed after `remap_kernel`;
/// the lock covers the construction and copy paths.
static KERNEL_PD: spin::Mutex<PageDirectory> = spin::Mutex::new(PageDirectory::zero());

mod linker {
    //! Addresses provided by the linker script. Zero-sized; only their
    //! addresses are meaningful and they must never be dereferenced.
    #![allow(improper_ctypes)]

    extern "C" {
        pub static _text_start: ();
        pub static _text_end: ();
        pub static _rodata_start: ();
        pub static _rodata_end: ();
        pub static _data_start: ();
        pub static _data_end: ();
        pub static _init_start: ();
        pub static _init_end: ();
        pub static _bss_start: ();
        pub static _bss_end: ();
        pub static _end: ();
    }
}

fn sym(sym: &'static ()) -> VirtAddress {
    VirtAddress::from_raw(sym as *const () as usize as u32)
}

/// End of the loaded kernel image, kernel-virtual.
pub fn kernel_image_end() -> VirtAddress {
    // SAFETY: only the address is taken.
    unsafe { sym(&linker::_end) }
}

/// The `.init` region, reclaimed once boot finishes.
pub fn init_section() -> (VirtAddress, VirtAddress) {
    // SAFETY: only the addresses are taken.
    unsafe { (sym(&linker::_init_start), sym(&linker::_init_end)) }
}

fn kernel_pd_phys(pd: &PageDirectory) -> PhysAddress {
    PhysAddress::from_raw(pd as *const _ as usize as u32 - KERNEL_BASE.as_raw())
}

/// Maps one page into `pd` while the directory is still being built and the
/// boot identity mapping is active: page tables are reached through their
/// physical addresses.
fn boot_map_page(
    pd: &mut PageDirectory,
    frames: &FrameTable<'_>,
    va: VirtAddress,
    pa: PhysAddress,
    access: Access,
) {
    let pde = pd.entry_mut(pd_index(va));
    if !pde.is_present() {
        let (pt, _) = frames
            .allocate(AllocFlags::empty())
            .unwrap_or_else(|| panic!("failed to allocate a boot page table"));
        pde.set_addr(pt.start());
        pde.insert_flags(EntryFlags::PRESENT | EntryFlags::WRITE);
        // SAFETY: the boot identity mapping makes the fresh table reachable
        // at its physical address.
        unsafe {
            core::ptr::write_bytes(pt.start().as_raw() as *mut u8, 0, PAGE_SIZE.as_raw() as usize);
        }
    }
    // SAFETY: same identity-mapping argument; the slot is within the table.
    let pte = unsafe {
        &mut *((pd.entry(pd_index(va)).addr().as_raw() as usize
            + pt_index(va) * core::mem::size_of::<TableEntry>()) as *mut TableEntry)
    };
    if pte.is_present() {
        panic!("mapping page at {:#010x}: already mapped", va.as_raw());
    }
    pte.set_addr(pa);
    pte.insert_flags(EntryFlags::PRESENT);
    if access.contains(Access::WRITE) {
        pte.insert_flags(EntryFlags::WRITE);
    }
}

fn boot_map_segment(
    pd: &mut PageDirectory,
    frames: &FrameTable<'_>,
    start: VirtAddress,
    end: VirtAddress,
    access: Access,
) {
    let mut va = start.align_down(PAGE_SIZE.as_raw());
    while va < end {
        boot_map_page(pd, frames, va, PhysAddress::from_raw(va.as_raw() - KERNEL_BASE.as_raw()), access);
        va += PAGE_SIZE;
    }
}

/// Builds and loads the kernel page directory: the first 3 GiB identity
/// mapped with large pages, each kernel segment mapped at its proper rights,
/// the mirror slot installed, and every kernel-range directory entry
/// preallocated so user directories can copy the first 768 entries by value
/// and share the rest forever.
pub fn remap_kernel(frames: &FrameTable<'_>) {
    let mut pd = KERNEL_PD.lock();
    *pd = PageDirectory::zero();

    for i in 0..KERNEL_PD_INDEX {
        let pde = pd.entry_mut(i);
        pde.set_addr(PhysAddress::from_raw((i as u32) << 22));
        pde.insert_flags(EntryFlags::PRESENT | EntryFlags::WRITE | EntryFlags::LARGE);
    }

    // SAFETY: only the linker symbol addresses are taken.
    let segments = unsafe {
        [
            (sym(&linker::_text_start), sym(&linker::_text_end), Access::READ | Access::EXECUTE),
            (sym(&linker::_rodata_start), sym(&linker::_rodata_end), Access::READ),
            (sym(&linker::_data_start), sym(&linker::_data_end), Access::READ | Access::WRITE),
            (
                sym(&linker::_init_start),
                sym(&linker::_init_end),
                Access::READ | Access::WRITE | Access::EXECUTE,
            ),
            (sym(&linker::_bss_start), sym(&linker::_bss_end), Access::READ | Access::WRITE),
        ]
    };
    for (start, end, access) in segments {
        boot_map_segment(&mut pd, frames, start, end, access);
    }

    let pd_phys = kernel_pd_phys(&pd);
    let mirror = pd.entry_mut(MIRROR_INDEX);
    mirror.set_addr(pd_phys);
    mirror.insert_flags(EntryFlags::PRESENT | EntryFlags::WRITE);

    // SAFETY: the directory maps the whole kernel at this point.
    unsafe {
        cpu::set_cr3(pd_phys);
    }

    for i in KERNEL_PD_INDEX..MIRROR_INDEX {
        if pd.entry(i).is_present() {
            continue;
        }
        let (pt, _) = frames
            .allocate(AllocFlags::empty())
            .unwrap_or_else(|| panic!("failed to preallocate a kernel page table"));
        // SAFETY: the identity mapping installed above still covers the
        // frame.
        unsafe {
            core::ptr::write_bytes(pt.start().as_raw() as *mut u8, 0, PAGE_SIZE.as_raw() as usize);
        }
        let pde = pd.entry_mut(i);
        pde.set_addr(pt.start());
        pde.insert_flags(EntryFlags::PRESENT | EntryFlags::WRITE);
    }
    cpu::flush_tlb();
}

/// Zeroes the user half of the kernel directory once the boot identity
/// mapping is no longer needed. User directory entries of the kernel
/// directory stay zero forever after.
pub fn clear_userspace() {
    let mut pd = KERNEL_PD.lock();
    for i in 0..KERNEL_PD_INDEX {
        pd.entry_mut(i).clear();
    }
    cpu::flush_tlb();
}

/// The machine-backed address space. All operations act on the directory
/// currently loaded in CR3, through the mirror region.
pub struct MirrorSpace;

fn pde_ref(va: VirtAddress) -> &'static mut TableEntry {
    // SAFETY: the mirror slot makes this address the PDE for `va` in the
    // current address space; single CPU, callers serialize through the
    // allocator locks.
    unsafe { &mut *(mirror::pde_vaddr(va).as_raw() as usize as *mut TableEntry) }
}

/// Snapshot read of the PDE covering `va`.
fn pde_value(va: VirtAddress) -> TableEntry {
    // SAFETY: as in `pde_ref`, read-only.
    unsafe { *(mirror::pde_vaddr(va).as_raw() as usize as *const TableEntry) }
}

fn pte_ref(va: VirtAddress) -> Option<&'static mut TableEntry> {
    if !pde_value(va).is_present() {
        return None;
    }
    // SAFETY: as in `pde_ref`; the covering table is present.
    Some(unsafe { &mut *(mirror::pte_vaddr(va).as_raw() as usize as *mut TableEntry) })
}

/// Virtual address at which the mirror exposes the page table covering
/// `va`.
fn table_page(va: VirtAddress) -> VirtAddress {
    VirtAddress::from_raw(MIRROR_BASE.as_raw() + ((pd_index(va) as u32) << 12))
}

// SAFETY: mappings go through the mirror of the loaded directory, page-table
// frames come from the given frame table, and `page_ptr` is the identity:
// a mapped kernel-virtual address is exactly the pointer to its payload.
unsafe impl AddressSpace for MirrorSpace {
    fn map_page(
        &self,
        page: Page,
        frame: Frame,
        access: Access,
        flags: MapFlags,
        frames: &FrameTable<'_>,
    ) -> Result<(), MemoryError> {
        let va = page.start();
        assert!(!mirror::is_mirror(va));
        assert!(!va.is_zero());
        assert!(!frame.start().is_zero());

        let pde = pde_ref(va);
        if !pde.is_present() {
            let (pt, _) = frames
                .allocate(AllocFlags::empty())
                .ok_or(MemoryError::OutOfMemory)?;
            pde.set_addr(pt.start());
            pde.insert_flags(EntryFlags::PRESENT | EntryFlags::WRITE);
            if va < KERNEL_BASE {
                pde.insert_flags(EntryFlags::USER);
            }
            cpu::invlpg(table_page(va));
            // The new table is visible through the mirror now; scrub it
            // there before any entry in it can be interpreted.
            // SAFETY: the mirror exposes exactly this one frame as a page.
            unsafe {
                core::ptr::write_bytes(
                    table_page(va).as_raw() as *mut u8,
                    0,
                    PAGE_SIZE.as_raw() as usize,
                );
            }
        }

        let pte = pte_ref(va).expect("covering table just installed");
        if pte.is_present() {
            panic!("mapping page at {:#010x}: already mapped", va.as_raw());
        }
        pte.set_addr(frame.start());
        let mut entry_flags = EntryFlags::empty();
        if access.contains(Access::WRITE) {
            entry_flags |= EntryFlags::WRITE;
        }
        if access.contains(Access::USER) {
            entry_flags |= EntryFlags::USER;
        }
        if flags.contains(MapFlags::PRESENT) {
            entry_flags |= EntryFlags::PRESENT;
        }
        if flags.contains(MapFlags::GLOBAL) {
            entry_flags |= EntryFlags::GLOBAL;
        }
        pte.insert_flags(entry_flags);
        cpu::invlpg(va);
        Ok(())
    }

    fn unmap_page(&self, page: Page) -> Option<Frame> {
        let va = page.start();
        assert!(!mirror::is_mirror(va));
        assert!(!va.is_zero());

        let pte = pte_ref(va)?;
        if !pte.is_present() {
            return None;
        }
        // Page tables themselves are never freed.
        // TODO: reclaim a table frame once its last entry is cleared.
        let frame = Frame::new(pte.addr());
        pte.clear();
        cpu::invlpg(va);
        Some(frame)
    }

    fn set_rights(&self, page: Page, access: Access) -> Result<(), MemoryError> {
        let va = page.start();
        let pte = pte_ref(va).ok_or(MemoryError::NotMapped)?;
        pte.remove_flags(EntryFlags::WRITE | EntryFlags::USER);
        if access.contains(Access::WRITE) {
            pte.insert_flags(EntryFlags::WRITE);
        }
        if access.contains(Access::USER) {
            pte.insert_flags(EntryFlags::USER);
        }
        cpu::invlpg(va);
        Ok(())
    }

    fn set_flags(&self, page: Page, flags: MapFlags) -> Result<(), MemoryError> {
        let va = page.start();
        let pte = pte_ref(va).ok_or(MemoryError::NotMapped)?;
        pte.remove_flags(EntryFlags::PRESENT | EntryFlags::GLOBAL);
        if flags.contains(MapFlags::PRESENT) {
            pte.insert_flags(EntryFlags::PRESENT);
        }
        if flags.contains(MapFlags::GLOBAL) {
            pte.insert_flags(EntryFlags::GLOBAL);
        }
        cpu::invlpg(va);
        Ok(())
    }

    fn rights(&self, page: Page) -> Option<Access> {
        let va = page.start();
        let pde = pde_value(va);
        if !pde.is_present() {
            return None;
        }
        let pte = pte_ref(va)?;
        let mut access = Access::READ | Access::EXECUTE;
        // The directory entry gates the effective right; a copy-on-write
        // staged mapping reads back non-writable.
        if pte.flags().contains(EntryFlags::WRITE)
            && (va >= KERNEL_BASE || pde.flags().contains(EntryFlags::WRITE))
        {
            access |= Access::WRITE;
        }
        if pte.flags().contains(EntryFlags::USER) {
            access |= Access::USER;
        }
        Some(access)
    }

    fn flags(&self, page: Page) -> Option<MapFlags> {
        let pte = pte_ref(page.start())?;
        let mut flags = MapFlags::empty();
        if pte.flags().contains(EntryFlags::PRESENT) {
            flags |= MapFlags::PRESENT;
        }
        if pte.flags().contains(EntryFlags::GLOBAL) {
            flags |= MapFlags::GLOBAL;
        }
        Some(flags)
    }

    fn translate(&self, va: VirtAddress) -> Option<PhysAddress> {
        let pte = pte_ref(va)?;
        if !pte.is_present() {
            return None;
        }
        Some(PhysAddress::from_raw(pte.addr().as_raw() + page_offset(va)))
    }

    fn page_ptr(&self, page: Page) -> Option<NonNull<u8>> {
        self.translate(page.start())?;
        NonNull::new(page.start().as_raw() as usize as *mut u8)
    }

    fn init_user_pd(&self, pd: VirtAddress) {
        assert!(pd.is_aligned_to(PAGE_SIZE.as_raw()));
        let kernel = KERNEL_PD.lock();
        // SAFETY: `pd` is a mapped, page-aligned kernel page owned by the
        // caller.
        unsafe {
            core::ptr::copy_nonoverlapping(
                &*kernel as *const PageDirectory,
                pd.as_raw() as usize as *mut PageDirectory,
                1,
            );
        }
        drop(kernel);

        let pd_phys = self
            .translate(pd)
            .expect("user directory page is not mapped");
        // SAFETY: same page, mirror slot within it.
        let mirror_entry = unsafe {
            &mut *((pd.as_raw() as usize + MIRROR_INDEX * core::mem::size_of::<TableEntry>())
                as *mut TableEntry)
        };
        mirror_entry.clear();
        mirror_entry.set_addr(pd_phys);
        mirror_entry.insert_flags(EntryFlags::PRESENT | EntryFlags::WRITE);
    }

    fn clone_user_mappings(
        &self,
        dst_pd: VirtAddress,
        src_pd: VirtAddress,
        frames: &FrameTable<'_>,
    ) {
        self.init_user_pd(dst_pd);
        for i in 0..KERNEL_PD_INDEX {
            // SAFETY: both directory pages are mapped kernel pages owned by
            // their contexts.
            let src = unsafe {
                &mut *((src_pd.as_raw() as usize + i * core::mem::size_of::<TableEntry>())
                    as *mut TableEntry)
            };
            if !src.is_present() {
                continue;
            }
            frames.reference(src.addr());
            src.remove_flags(EntryFlags::WRITE);
            let dst = unsafe {
                &mut *((dst_pd.as_raw() as usize + i * core::mem::size_of::<TableEntry>())
                    as *mut TableEntry)
            };
            *dst = *src;
        }
        cpu::flush_tlb();
    }

    fn drop_user_mappings(&self, frames: &FrameTable<'_>) {
        for i in 0..KERNEL_PD_INDEX {
            let base = VirtAddress::from_raw((i as u32) << 22);
            let pde = pde_ref(base);
            if !pde.is_present() {
                continue;
            }
            let table = pde.addr();
            {
                let _guard = frames.lock(table);
                // A table shared with another context keeps its data pages.
                if frames.counter(table) == Some(1) {
                    for j in 0..1024u32 {
                        let va = base + Length::from_raw(j << 12);
                        if let Some(pte) = pte_ref(va) {
                            if pte.is_present() {
                                frames.free(pte.addr());
                            }
                        }
                    }
                }
            }
            frames.free(table);
            pde.clear();
        }
        cpu::flush_tlb();
    }

    fn make_current(&self, pd: VirtAddress) {
        let pd_phys = self
            .translate(pd)
            .expect("directory page is not mapped");
        // SAFETY: the directory was initialized from the kernel directory
        // and therefore maps the kernel.
        unsafe {
            cpu::set_cr3(pd_phys);
        }
    }

    fn use_kernel_pd(&self) {
        let pd = KERNEL_PD.lock();
        let pd_phys = kernel_pd_phys(&pd);
        // SAFETY: the kernel directory always maps the kernel.
        unsafe {
            cpu::set_cr3(pd_phys);
        }
    }
}
