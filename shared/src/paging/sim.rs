//! Simulated address space for the hosted test suite.
//!
//! Page tables are modeled structurally: user directories are keyed by the
//! frame backing the directory page, page tables by the frame they would
//! occupy, and the kernel half of the address space is a single shared
//! mapping set, matching the real kernel where every directory shares the
//! preallocated kernel page tables. Frame payloads are materialized lazily
//! as boxed host pages filled with a poison byte, so a path that skips
//! zeroing shows up as garbage instead of conveniently fresh memory.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;

use core::ptr::NonNull;

use crate::error::MemoryError;
use crate::memory::addr::{PhysAddress, VirtAddress};
use crate::memory::frame::{AllocFlags, FrameTable};
use crate::memory::page::{Frame, Page, KERNEL_BASE, PAGE_SHIFT, PAGE_SIZE};

use super::{pd_index, pt_index, page_offset, Access, AddressSpace, MapFlags};

/// Sentinel "frame" of the kernel's own directory, which lives in the kernel
/// image rather than allocated memory.
const KERNEL_PD: u32 = u32::MAX;

pub const POISON_BYTE: u8 = 0xA5;

#[repr(align(4096))]
struct Payload([u8; PAGE_SIZE.as_raw() as usize]);

#[derive(Clone, Copy)]
struct SimPte {
    frame: u32,
    access: Access,
    flags: MapFlags,
}

#[derive(Clone, Copy)]
struct SimPde {
    /// Frame index of the page table.
    table: u32,
    write: bool,
    user: bool,
}

#[derive(Default)]
struct SimDir {
    /// Present user-range directory entries by directory index.
    pdes: BTreeMap<usize, SimPde>,
}

struct SimInner {
    /// Frame payloads, created on first access.
    payloads: BTreeMap<u32, Box<Payload>>,
    /// Kernel-half mappings shared by every directory, by page index.
    kernel: BTreeMap<u32, SimPte>,
    /// User directories by the frame backing the directory page.
    dirs: BTreeMap<u32, SimDir>,
    /// Page tables by the frame that holds them, each a map from table index
    /// to entry.
    tables: BTreeMap<u32, BTreeMap<usize, SimPte>>,
    /// The loaded directory; stands in for CR3.
    current: u32,
}

pub struct SimSpace {
    inner: spin::Mutex<SimInner>,
}

impl SimSpace {
    pub fn new() -> SimSpace {
        let mut dirs = BTreeMap::new();
        dirs.insert(KERNEL_PD, SimDir::default());
        SimSpace {
            inner: spin::Mutex::new(SimInner {
                payloads: BTreeMap::new(),
                kernel: BTreeMap::new(),
                dirs,
                tables: BTreeMap::new(),
                current: KERNEL_PD,
            }),
        }
    }

    /// Copies the payload of a physical frame; the test suite's stand-in for
    /// inspecting memory through a scratch mapping.
    pub fn frame_bytes(&self, frame: Frame, buf: &mut [u8; PAGE_SIZE.as_raw() as usize]) {
        let mut inner = self.inner.lock();
        let payload = payload(&mut inner, frame.index());
        buf.copy_from_slice(&payload.0);
    }

    /// True when the loaded directory can reach `va`.
    pub fn is_mapped(&self, va: VirtAddress) -> bool {
        self.lookup(Page::containing(va)).is_some()
    }

    fn lookup(&self, page: Page) -> Option<SimPte> {
        let inner = self.inner.lock();
        lookup_in(&inner, page)
    }
}

impl Default for SimSpace {
    fn default() -> SimSpace {
        SimSpace::new()
    }
}

fn payload<'m>(inner: &'m mut SimInner, frame: u32) -> &'m mut Payload {
    inner
        .payloads
        .entry(frame)
        .or_insert_with(|| Box::new(Payload([POISON_BYTE; PAGE_SIZE.as_raw() as usize])))
}

fn lookup_in(inner: &SimInner, page: Page) -> Option<SimPte> {
    if page.start() >= KERNEL_BASE {
        return inner.kernel.get(&page.index()).copied();
    }
    let dir = inner.dirs.get(&inner.current)?;
    let pde = dir.pdes.get(&pd_index(page.start()))?;
    let pte = inner.tables.get(&pde.table)?.get(&pt_index(page.start()))?;
    // Effective write right is gated by the directory entry; this is what
    // the copy-on-write staging relies on.
    let mut pte = *pte;
    if !pde.write {
        pte.access.remove(Access::WRITE);
    }
    if !pde.user {
        pte.access.remove(Access::USER);
    }
    Some(pte)
}

fn entry_slot<'m>(inner: &'m mut SimInner, page: Page) -> Option<&'m mut SimPte> {
    if page.start() >= KERNEL_BASE {
        return inner.kernel.get_mut(&page.index());
    }
    let current = inner.current;
    let pde = *inner
        .dirs
        .get(&current)?
        .pdes
        .get(&pd_index(page.start()))?;
    inner.tables.get_mut(&pde.table)?.get_mut(&pt_index(page.start()))
}

// SAFETY: payloads are boxed host pages that are never dropped while the
// space is alive, so `page_ptr` results stay valid; the mapping operations
// below mirror the hardware backend's bookkeeping.
unsafe impl AddressSpace for SimSpace {
    fn map_page(
        &self,
        page: Page,
        frame: Frame,
        access: Access,
        flags: MapFlags,
        frames: &FrameTable<'_>,
    ) -> Result<(), MemoryError> {
        let mut inner = self.inner.lock();
        let pte = SimPte {
            frame: frame.index(),
            access,
            flags,
        };
        if page.start() >= KERNEL_BASE {
            if let Some(old) = inner.kernel.get(&page.index()) {
                if old.flags.contains(MapFlags::PRESENT) {
                    panic!(
                        "mapping page at {:#010x}: already mapped",
                        page.start().as_raw()
                    );
                }
            }
            inner.kernel.insert(page.index(), pte);
            return Ok(());
        }

        let current = inner.current;
        let pdi = pd_index(page.start());
        let existing = inner
            .dirs
            .get(&current)
            .expect("no current user directory")
            .pdes
            .get(&pdi)
            .map(|pde| pde.table);
        let table = match existing {
            Some(table) => table,
            None => {
                let (pt_frame, _) = frames
                    .allocate(AllocFlags::CLEAR)
                    .ok_or(MemoryError::OutOfMemory)?;
                let table = pt_frame.index();
                inner.tables.insert(table, BTreeMap::new());
                inner.dirs.get_mut(&current).unwrap().pdes.insert(
                    pdi,
                    SimPde {
                        table,
                        write: true,
                        user: true,
                    },
                );
                table
            }
        };

        let pt = inner.tables.get_mut(&table).unwrap();
        if let Some(old) = pt.get(&pt_index(page.start())) {
            if old.flags.contains(MapFlags::PRESENT) {
                panic!(
                    "mapping page at {:#010x}: already mapped",
                    page.start().as_raw()
                );
            }
        }
        pt.insert(pt_index(page.start()), pte);
        Ok(())
    }

    fn unmap_page(&self, page: Page) -> Option<Frame> {
        let mut inner = self.inner.lock();
        let removed = if page.start() >= KERNEL_BASE {
            inner.kernel.remove(&page.index())
        } else {
            let current = inner.current;
            let pde = *inner.dirs.get(&current)?.pdes.get(&pd_index(page.start()))?;
            inner
                .tables
                .get_mut(&pde.table)?
                .remove(&pt_index(page.start()))
        };
        let removed = removed?;
        if !removed.flags.contains(MapFlags::PRESENT) {
            return None;
        }
        Some(Frame::from_index(removed.frame))
    }

    fn set_rights(&self, page: Page, access: Access) -> Result<(), MemoryError> {
        let mut inner = self.inner.lock();
        let pte = entry_slot(&mut inner, page).ok_or(MemoryError::NotMapped)?;
        pte.access = access;
        Ok(())
    }

    fn set_flags(&self, page: Page, flags: MapFlags) -> Result<(), MemoryError> {
        let mut inner = self.inner.lock();
        let pte = entry_slot(&mut inner, page).ok_or(MemoryError::NotMapped)?;
        pte.flags = flags;
        Ok(())
    }

    fn rights(&self, page: Page) -> Option<Access> {
        let pte = self.lookup(page)?;
        let mut access = Access::READ | Access::EXECUTE;
        access |= pte.access & (Access::WRITE | Access::USER);
        Some(access)
    }

    fn flags(&self, page: Page) -> Option<MapFlags> {
        Some(self.lookup(page)?.flags)
    }

    fn translate(&self, va: VirtAddress) -> Option<PhysAddress> {
        let pte = self.lookup(Page::containing(va))?;
        if !pte.flags.contains(MapFlags::PRESENT) {
            return None;
        }
        Some(PhysAddress::from_raw(
            (pte.frame << PAGE_SHIFT) + page_offset(va),
        ))
    }

    fn page_ptr(&self, page: Page) -> Option<NonNull<u8>> {
        let mut inner = self.inner.lock();
        let pte = lookup_in(&inner, page)?;
        if !pte.flags.contains(MapFlags::PRESENT) {
            return None;
        }
        let payload = payload(&mut inner, pte.frame);
        NonNull::new(payload.0.as_mut_ptr())
    }

    fn init_user_pd(&self, pd: VirtAddress) {
        let mut inner = self.inner.lock();
        let frame = lookup_in(&inner, Page::containing(pd))
            .expect("user directory page is not mapped")
            .frame;
        // A fresh directory starts as a copy of the kernel directory, whose
        // user half is empty.
        inner.dirs.insert(frame, SimDir::default());
    }

    fn clone_user_mappings(
        &self,
        dst_pd: VirtAddress,
        src_pd: VirtAddress,
        frames: &FrameTable<'_>,
    ) {
        self.init_user_pd(dst_pd);
        let mut inner = self.inner.lock();
        let src = lookup_in(&inner, Page::containing(src_pd))
            .expect("source directory page is not mapped")
            .frame;
        let dst = lookup_in(&inner, Page::containing(dst_pd))
            .expect("destination directory page is not mapped")
            .frame;

        let src_dir = inner.dirs.get_mut(&src).expect("source is not a directory");
        let mut staged: BTreeMap<usize, SimPde> = BTreeMap::new();
        for (&index, pde) in src_dir.pdes.iter_mut() {
            frames.reference(Frame::from_index(pde.table).start());
            pde.write = false;
            staged.insert(index, *pde);
        }
        inner.dirs.get_mut(&dst).unwrap().pdes = staged;
    }

    fn drop_user_mappings(&self, frames: &FrameTable<'_>) {
        let mut inner = self.inner.lock();
        let current = inner.current;
        let pdes = core::mem::take(
            &mut inner
                .dirs
                .get_mut(&current)
                .expect("no current user directory")
                .pdes,
        );
        for pde in pdes.values() {
            let table_addr = Frame::from_index(pde.table).start();
            {
                let _guard = frames.lock(table_addr);
                if frames.counter(table_addr) == Some(1) {
                    if let Some(pt) = inner.tables.get(&pde.table) {
                        for pte in pt.values() {
                            if pte.flags.contains(MapFlags::PRESENT) {
                                frames.free(Frame::from_index(pte.frame).start());
                            }
                        }
                    }
                }
            }
            frames.free(table_addr);
            if frames.counter(table_addr) == Some(0) {
                inner.tables.remove(&pde.table);
            }
        }
    }

    fn make_current(&self, pd: VirtAddress) {
        let mut inner = self.inner.lock();
        let frame = lookup_in(&inner, Page::containing(pd))
            .expect("directory page is not mapped")
            .frame;
        assert!(
            inner.dirs.contains_key(&frame),
            "loading a page that is not a directory"
        );
        inner.current = frame;
    }

    fn use_kernel_pd(&self) {
        self.inner.lock().current = KERNEL_PD;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::frame::{mark_available, FrameInfo};
    use crate::memory::map::{Map, MapEntry, MemoryType};
    use crate::memory::addr::PhysExtent;
    use crate::paging::read_bytes;

    use std::boxed::Box as StdBox;
    use std::vec::Vec;

    fn table(frame_count: u32) -> FrameTable<'static> {
        let frames: Vec<FrameInfo> = (0..frame_count).map(FrameInfo::new).collect();
        let frames: &'static [FrameInfo] = StdBox::leak(frames.into_boxed_slice());
        let map = Map::from_entries([MapEntry {
            extent: PhysExtent::from_raw(0, frame_count * PAGE_SIZE.as_raw()),
            mem_type: MemoryType::Available,
        }]);
        mark_available(frames, &map);
        let table = FrameTable::new(frames);
        table.reserve(Frame::from_index(0));
        table
    }

    #[test]
    fn kernel_mappings_are_shared_and_fault_when_absent() {
        let space = SimSpace::new();
        let frames = table(64);
        let page = Page::new(VirtAddress::from_raw(0xC040_0000));
        assert!(!space.is_mapped(page.start()));

        let (frame, _) = frames.allocate(AllocFlags::empty()).unwrap();
        space
            .map_page(
                page,
                frame,
                Access::READ | Access::WRITE,
                MapFlags::PRESENT,
                &frames,
            )
            .unwrap();
        assert!(space.is_mapped(page.start()));
        assert_eq!(
            space.translate(VirtAddress::from_raw(0xC040_0123)),
            Some(PhysAddress::from_raw(frame.start().as_raw() + 0x123))
        );

        assert_eq!(space.unmap_page(page), Some(frame));
        assert!(!space.is_mapped(page.start()));
    }

    #[test]
    fn fresh_payload_is_poisoned() {
        let space = SimSpace::new();
        let frames = table(64);
        let page = Page::new(VirtAddress::from_raw(0xC040_0000));
        let (frame, _) = frames.allocate(AllocFlags::empty()).unwrap();
        space
            .map_page(page, frame, Access::READ, MapFlags::PRESENT, &frames)
            .unwrap();

        let mut buf = [0u8; 16];
        read_bytes(&space, page.start(), &mut buf);
        assert_eq!(buf, [POISON_BYTE; 16]);
    }

    #[test]
    #[should_panic(expected = "already mapped")]
    fn double_map_panics() {
        let space = SimSpace::new();
        let frames = table(64);
        let page = Page::new(VirtAddress::from_raw(0xC040_0000));
        let (frame, _) = frames.allocate(AllocFlags::empty()).unwrap();
        space
            .map_page(page, frame, Access::READ, MapFlags::PRESENT, &frames)
            .unwrap();
        space
            .map_page(page, frame, Access::READ, MapFlags::PRESENT, &frames)
            .unwrap();
    }

    #[test]
    fn user_tables_allocate_frames() {
        let space = SimSpace::new();
        let frames = table(64);

        // A user directory needs a mapped directory page first.
        let pd_va = VirtAddress::from_raw(0xC080_0000);
        let (pd_frame, _) = frames.allocate(AllocFlags::empty()).unwrap();
        space
            .map_page(
                Page::new(pd_va),
                pd_frame,
                Access::READ | Access::WRITE,
                MapFlags::PRESENT,
                &frames,
            )
            .unwrap();
        space.init_user_pd(pd_va);
        space.make_current(pd_va);

        let user = Page::new(VirtAddress::from_raw(0x0804_8000));
        let (data, _) = frames.allocate(AllocFlags::empty()).unwrap();
        let before = frames.free_frames(crate::memory::frame::Pool::Bios);
        space
            .map_page(
                user,
                data,
                Access::READ | Access::USER,
                MapFlags::PRESENT,
                &frames,
            )
            .unwrap();
        // One frame went to the new page table.
        let after = frames.free_frames(crate::memory::frame::Pool::Bios);
        assert_eq!(before - 1, after);

        space.use_kernel_pd();
        assert!(!space.is_mapped(user.start()));
        space.make_current(pd_va);
        assert!(space.is_mapped(user.start()));
    }
}
