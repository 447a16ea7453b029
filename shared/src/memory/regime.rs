//! Composition of the whole memory stack.
//!
//! One `MemoryRegime` owns the frame table, the paging backend, the slub
//! root, the vmalloc carver and the kmalloc class table. The bootstrap order
//! is the only valid topological sort of the stack's dependencies:
//! frame table and paging first (built by the caller), then the slub seed
//! slabs, then vmalloc with its hand-mapped seed range, then the kmalloc
//! classes.

use log::error;

use crate::error::MemoryError;
use crate::memory::addr::{Length, PhysAddress, VirtAddress};
use crate::memory::frame::{AllocFlags, FrameTable};
use crate::memory::kmalloc::Kmalloc;
use crate::memory::page::{pages_in, Frame, Page, PAGE_SIZE};
use crate::memory::slub::{self, SlubAllocator, SlubFlags, SlubRoot, SlubStats, SlabView};
use crate::memory::slub::{
    SLUB_DEFAULT_SLAB_COUNT, SLUB_MIN_OBJECT_ALIGN, SLUB_MIN_OBJECT_LENGTH,
    SLUB_MIN_OBJECT_PER_SLAB,
};
use crate::memory::vmalloc::Vmalloc;
use crate::paging::{fill, Access, AddressSpace, MapFlags};

/// Fixed virtual addresses the caller prepares before bootstrap.
pub struct BootstrapLayout {
    /// Two mapped, page-aligned, zeroed buffers seeding the slub machinery.
    pub seed1: VirtAddress,
    pub seed2: VirtAddress,
    /// Page-aligned scratch page used to zero frames; need not be mapped.
    pub clear_window: VirtAddress,
}

pub struct MemoryRegime<'t, A: AddressSpace> {
    space: A,
    frames: FrameTable<'t>,
    /// The frame-clearing window is a process-wide resource; this mutex is
    /// what serializes it.
    clear_window: spin::Mutex<VirtAddress>,
    slub: SlubRoot,
    vmalloc: Vmalloc,
    kmalloc: Kmalloc,
}

impl<'t, A: AddressSpace> MemoryRegime<'t, A> {
    /// Brings the allocator stack up over an initialized frame table and
    /// paging backend.
    pub fn bootstrap(
        space: A,
        frames: FrameTable<'t>,
        layout: BootstrapLayout,
    ) -> Result<Self, MemoryError> {
        assert!(layout.clear_window.is_aligned_to(PAGE_SIZE.as_raw()));
        let slub = SlubRoot::bootstrap(&space, layout.seed1, layout.seed2);
        let regime = MemoryRegime {
            space,
            frames,
            clear_window: spin::Mutex::new(layout.clear_window),
            slub,
            vmalloc: Vmalloc::new(),
            kmalloc: Kmalloc::new(),
        };
        regime.vmalloc_setup()?;
        regime.kmalloc_setup()?;
        Ok(regime)
    }

    pub fn space(&self) -> &A {
        &self.space
    }

    pub fn frames(&self) -> &FrameTable<'t> {
        &self.frames
    }

    pub(crate) fn vmalloc_state(&self) -> &Vmalloc {
        &self.vmalloc
    }

    pub(crate) fn kmalloc_state(&self) -> &Kmalloc {
        &self.kmalloc
    }

    // Frame front end.

    /// Allocates one frame, zeroing it through the clearing window when
    /// `CLEAR` is requested.
    pub fn page_alloc(&self, flags: AllocFlags) -> Option<Frame> {
        let (frame, must_clear) = self.frames.allocate(flags)?;
        if must_clear {
            self.clear_frame(frame);
        }
        Some(frame)
    }

    pub fn page_free(&self, paddr: PhysAddress) {
        self.frames.free(paddr);
    }

    fn clear_frame(&self, frame: Frame) {
        let window = self.clear_window.lock();
        let page = Page::new(*window);
        let _ = self.space.unmap_page(page);
        self.space
            .map_page(page, frame, Access::WRITE, MapFlags::PRESENT, &self.frames)
            .expect("clearing window cannot be mapped");
        fill(&self.space, *window, PAGE_SIZE.as_raw(), 0);
    }

    // Paging front end.

    pub fn map_page(
        &self,
        page: Page,
        frame: Frame,
        access: Access,
        flags: MapFlags,
    ) -> Result<(), MemoryError> {
        self.space.map_page(page, frame, access, flags, &self.frames)
    }

    pub fn unmap_page(&self, page: Page) -> Option<Frame> {
        self.space.unmap_page(page)
    }

    pub fn set_rights(&self, page: Page, access: Access) -> Result<(), MemoryError> {
        self.space.set_rights(page, access)
    }

    pub fn rights(&self, page: Page) -> Option<Access> {
        self.space.rights(page)
    }

    pub fn flags(&self, page: Page) -> Option<MapFlags> {
        self.space.flags(page)
    }

    pub fn translate(&self, va: VirtAddress) -> Option<PhysAddress> {
        self.space.translate(va)
    }

    /// Maps `[start, end)` page by page, backing each page with a zeroed
    /// frame. On failure the partially mapped prefix is unwound before the
    /// error is reported; leaving it behind would turn the next use of the
    /// range into a double-map panic.
    pub fn map_interval(
        &self,
        start: VirtAddress,
        end: VirtAddress,
        access: Access,
    ) -> Result<(), MemoryError> {
        let mut va = start;
        while va < end {
            let frame = match self.page_alloc(AllocFlags::CLEAR) {
                Some(frame) => frame,
                None => {
                    self.unmap_interval(start, va);
                    return Err(MemoryError::OutOfMemory);
                }
            };
            if let Err(err) =
                self.space
                    .map_page(Page::new(va), frame, access, MapFlags::PRESENT, &self.frames)
            {
                self.frames.free(frame.start());
                self.unmap_interval(start, va);
                return Err(err);
            }
            va += PAGE_SIZE;
        }
        Ok(())
    }

    /// Unmaps `[start, end)` and frees the backing frames.
    pub fn unmap_interval(&self, start: VirtAddress, end: VirtAddress) {
        for page in pages_in(start, end) {
            if let Some(frame) = self.space.unmap_page(page) {
                self.frames.free(frame.start());
            }
        }
    }

    /// Changes the rights of every page in `[start, end)`; stops at the
    /// first unmapped page.
    pub fn change_rights_interval(
        &self,
        start: VirtAddress,
        end: VirtAddress,
        access: Access,
    ) -> Result<(), MemoryError> {
        for page in pages_in(start, end) {
            self.space.set_rights(page, access)?;
        }
        Ok(())
    }

    // Slub front end.

    /// Allocates one object, growing the pool from vmalloc when it runs dry
    /// or crosses its low-water mark.
    pub fn slub_allocate(&self, allocator_va: VirtAddress) -> Option<VirtAddress> {
        slub::allocate_raw(&self.space, allocator_va, |allocator, lists| {
            let slab_va = self.create_slab(allocator)?;
            slub::attach_slab(&self.space, allocator, lists, slab_va);
            Some(slab_va)
        })
    }

    /// Frees `object` if `allocator_va` owns it.
    pub fn slub_free(&self, allocator_va: VirtAddress, object: VirtAddress) -> bool {
        slub::free_raw(&self.space, allocator_va, object)
    }

    /// Creates a slab sized by the allocator's hints: a vmalloc'd backing
    /// range plus a descriptor from the slab-descriptor pool.
    fn create_slab(&self, allocator: &SlubAllocator) -> Option<VirtAddress> {
        let length = Length::from_raw(
            allocator
                .object_per_slab()
                .checked_mul(allocator.object_size())?,
        )
        .align_up(PAGE_SIZE.as_raw());
        let start = self.vmalloc(length, crate::memory::vmalloc::VmallocFlags::MAP)?;
        let slab_va = match self.slub_allocate(self.slub.slab_allocator()) {
            Some(va) => va,
            None => {
                self.vmfree(start);
                return None;
            }
        };
        // SAFETY: the descriptor slot and the backing range are both
        // exclusively ours.
        unsafe {
            slub::place_slab(
                &self.space,
                slab_va,
                start,
                start + length,
                allocator.object_size(),
                allocator.object_align(),
            );
        }
        Some(slab_va)
    }

    fn grow_allocator(&self, allocator_va: VirtAddress) -> Option<()> {
        // SAFETY: allocator descriptors are placed once and never move.
        let allocator: &SlubAllocator = unsafe { crate::paging::descr(&self.space, allocator_va) };
        let slab_va = self.create_slab(allocator)?;
        let mut lists = allocator.lists_lock();
        slub::attach_slab(&self.space, allocator, &mut lists, slab_va);
        Some(())
    }

    /// Creates a slub allocator for a class of objects. Floors keep the
    /// geometry sane; `LAZY` suppresses eager slab creation. After eager
    /// creation the pool keeps growing until `min_free` slots are free.
    pub fn create_slub_allocator(
        &self,
        object_size: u32,
        object_align: u32,
        min_free: u32,
        object_per_slab: u32,
        slab_count: u32,
        flags: SlubFlags,
    ) -> Option<VirtAddress> {
        let allocator_va = self.slub_allocate(self.slub.allocator_allocator())?;

        let object_per_slab = object_per_slab.max(SLUB_MIN_OBJECT_PER_SLAB);
        let object_align = object_align.max(SLUB_MIN_OBJECT_ALIGN);
        let object_size = object_size.max(SLUB_MIN_OBJECT_LENGTH);
        let mut slab_count = slab_count.max(SLUB_DEFAULT_SLAB_COUNT);
        if flags.contains(SlubFlags::LAZY) {
            slab_count = 0;
        }

        // SAFETY: a freshly allocated slot, exclusively ours.
        unsafe {
            slub::place_allocator(
                &self.space,
                allocator_va,
                object_size,
                object_align,
                object_per_slab,
                min_free,
            );
        }

        for _ in 0..slab_count {
            if self.grow_allocator(allocator_va).is_none() {
                break;
            }
        }
        while self.slub_stats(allocator_va).free_count < min_free {
            if self.grow_allocator(allocator_va).is_none() {
                error!("slub: cannot reach the requested free floor");
                break;
            }
        }
        Some(allocator_va)
    }

    /// Attaches a pre-mapped region as one slab of `allocator_va`; the
    /// vmalloc bootstrap seeds its descriptor pool this way.
    pub(crate) fn slub_add_memory(
        &self,
        allocator_va: VirtAddress,
        start: VirtAddress,
        end: VirtAddress,
    ) -> Option<()> {
        let slab_va = self.slub_allocate(self.slub.slab_allocator())?;
        slub::add_seed_slab(&self.space, allocator_va, slab_va, start, end);
        Some(())
    }

    pub fn slub_stats(&self, allocator_va: VirtAddress) -> SlubStats {
        slub::stats(&self.space, allocator_va)
    }

    pub fn slub_walk(&self, allocator_va: VirtAddress, f: impl FnMut(SlabView)) {
        slub::walk_slabs(&self.space, allocator_va, f)
    }
}

/// Hosted bootstrap helper: a complete regime over the simulated backend.
#[cfg(any(test, feature = "sim"))]
pub mod sim_boot {
    use alloc::boxed::Box;
    use alloc::vec::Vec;

    use super::*;
    use crate::memory::addr::PhysExtent;
    use crate::memory::frame::{mark_available, FrameInfo};
    use crate::memory::map::{Map, MapEntry, MemoryType};
    use crate::paging::sim::SimSpace;

    pub const SIM_SEED1: VirtAddress = VirtAddress::from_raw(0xC010_0000);
    pub const SIM_SEED2: VirtAddress = VirtAddress::from_raw(0xC010_1000);
    pub const SIM_CLEAR_WINDOW: VirtAddress = VirtAddress::from_raw(0xC010_2000);

    /// Builds a regime over `frame_count` simulated frames, mirroring the
    /// kernel's boot chain: descriptor table, reservations, seed mappings,
    /// then the allocator bootstrap.
    pub fn sim_regime(frame_count: u32) -> MemoryRegime<'static, SimSpace> {
        let frames: Vec<FrameInfo> = (0..frame_count).map(FrameInfo::new).collect();
        let frames: &'static [FrameInfo] = Box::leak(frames.into_boxed_slice());
        let map = Map::from_entries([MapEntry {
            extent: PhysExtent::from_raw(0, frame_count.checked_mul(PAGE_SIZE.as_raw()).unwrap()),
            mem_type: MemoryType::Available,
        }]);
        mark_available(frames, &map);
        let table = FrameTable::new(frames);
        table.reserve(Frame::from_index(0));

        let space = SimSpace::new();
        for seed in [SIM_SEED1, SIM_SEED2] {
            let (frame, _) = table
                .allocate(AllocFlags::CLEAR)
                .expect("sim boot: no frame for the seed page");
            space
                .map_page(
                    Page::new(seed),
                    frame,
                    Access::READ | Access::WRITE,
                    MapFlags::PRESENT,
                    &table,
                )
                .expect("sim boot: seed mapping failed");
            // The seed buffers are zeroed statics on the real kernel.
            fill(&space, seed, PAGE_SIZE.as_raw(), 0);
        }

        MemoryRegime::bootstrap(
            space,
            table,
            BootstrapLayout {
                seed1: SIM_SEED1,
                seed2: SIM_SEED2,
                clear_window: SIM_CLEAR_WINDOW,
            },
        )
        .expect("sim bootstrap failed")
    }
}

#[cfg(test)]
mod tests {
    use super::sim_boot::*;
    use super::*;
    use crate::memory::frame::Pool;
    use crate::memory::page::{VMALLOC_END, VMALLOC_START};
    use crate::memory::slub::SlabState;
    use crate::memory::vmalloc::VmallocFlags;
    use crate::paging::sim::SimSpace;
    use crate::paging::{read_bytes, read_u32, write_u32};

    use pretty_assertions::assert_eq;
    use std::vec::Vec;

    #[test]
    fn bootstrap_comes_up() {
        let regime = sim_regime(512);
        // The vmarea pool was seeded with two pages of 32-byte descriptors,
        // one of which holds the initial full-range area.
        let stats = regime.slub_stats(regime.vmalloc_state().allocator());
        assert_eq!(stats.total_count, 256);
        assert_eq!(stats.free_count, 255);

        // Every kmalloc class exists and is still slab-less.
        for size in [1u32, 32, 33, 65536] {
            let class = regime.kmalloc_class(size).unwrap();
            assert_eq!(regime.slub_stats(class).total_count, 0);
        }
        assert_eq!(regime.kmalloc_class(65537), None);
    }

    #[test]
    fn single_frame_alloc_and_free() {
        // A cleared frame is aligned, zeroed, singly referenced, and
        // freeable.
        let regime = sim_regime(8192);
        let frame = regime.page_alloc(AllocFlags::CLEAR).unwrap();
        assert!(frame.start().as_raw() >= 0x0010_0000);
        assert!(frame.start().is_aligned_to(PAGE_SIZE.as_raw()));

        let mut payload = [0xFFu8; PAGE_SIZE.as_raw() as usize];
        regime.space().frame_bytes(frame, &mut payload);
        assert!(payload.iter().all(|&b| b == 0));

        assert_eq!(regime.frames().counter(frame.start()), Some(1));
        regime.page_free(frame.start());
        assert_eq!(regime.frames().counter(frame.start()), Some(0));
    }

    #[test]
    fn kmalloc_routes_by_size_class() {
        // Neighboring allocations in the 64-byte class sit 64 bytes
        // apart, and a freed slot is reused LIFO.
        let regime = sim_regime(512);
        let p1 = regime.kmalloc(40).unwrap();
        let p2 = regime.kmalloc(60).unwrap();
        assert_eq!(p2.as_raw() - p1.as_raw(), 64);

        regime.kfree(p1);
        let p3 = regime.kmalloc(50).unwrap();
        assert_eq!(p3, p1);

        regime.kfree(p2);
        regime.kfree(p3);
    }

    #[test_log::test]
    fn kmalloc_rejects_oversize_and_foreign_pointers() {
        let regime = sim_regime(512);
        assert_eq!(regime.kmalloc(65537), None);
        // Logged and ignored.
        regime.kfree(VirtAddress::from_raw(0xDEAD_0000));
    }

    #[test]
    fn kmalloc_round_trip_restores_free_count() {
        // free(malloc(n)) returns the class pool to its free count.
        let regime = sim_regime(512);
        // Warm the class up so the slab exists.
        let warm = regime.kmalloc(100).unwrap();
        regime.kfree(warm);

        let class = regime.kmalloc_class(100).unwrap();
        let before = regime.slub_stats(class);
        let p = regime.kmalloc(100).unwrap();
        regime.kfree(p);
        let after = regime.slub_stats(class);
        assert_eq!(before, after);
    }

    #[test]
    fn vmalloc_maps_and_zeroes() {
        // A mapped-and-zeroed area reads back zero and faults once
        // freed.
        let regime = sim_regime(512);
        let area = regime
            .vmalloc(Length::from_raw(8192), VmallocFlags::MAP | VmallocFlags::ZERO)
            .unwrap();
        assert!(area >= VMALLOC_START && area < VMALLOC_END);

        let mut buf = [0xFFu8; 256];
        read_bytes(regime.space(), area, &mut buf);
        assert!(buf.iter().all(|&b| b == 0));
        read_bytes(
            regime.space(),
            area + Length::from_raw(8192 - 256),
            &mut buf,
        );
        assert!(buf.iter().all(|&b| b == 0));

        regime.vmfree(area);
        assert!(!regime.space().is_mapped(area));

        // The area went back to the free list.
        let mut found = false;
        regime.vmalloc_walk(|base, _, used| {
            if base == area {
                assert!(!used);
                found = true;
            }
        });
        assert!(found);
    }

    #[test_log::test]
    fn vmfree_of_unknown_address_is_ignored() {
        let regime = sim_regime(512);
        regime.vmfree(VirtAddress::from_raw(0xD800_0000));
    }

    fn assert_vmalloc_partition(regime: &MemoryRegime<'static, SimSpace>) {
        // Free and used areas tile [VMALLOC_START, VMALLOC_END) exactly.
        let mut areas: Vec<(u32, u32)> = Vec::new();
        regime.vmalloc_walk(|base, len, _| areas.push((base.as_raw(), len.as_raw())));
        areas.sort_unstable();
        let mut cursor = VMALLOC_START.as_raw();
        for (base, len) in areas {
            assert_eq!(base, cursor, "gap or overlap at {base:#010x}");
            cursor += len;
        }
        assert_eq!(cursor, VMALLOC_END.as_raw());
    }

    #[test]
    fn vmalloc_partition_is_preserved() {
        let regime = sim_regime(512);
        assert_vmalloc_partition(&regime);

        let a = regime.vmalloc(Length::from_raw(PAGE_SIZE.as_raw()), VmallocFlags::empty()).unwrap();
        let b = regime
            .vmalloc(Length::from_raw(3 * PAGE_SIZE.as_raw()), VmallocFlags::MAP)
            .unwrap();
        assert_vmalloc_partition(&regime);

        regime.vmfree(a);
        assert_vmalloc_partition(&regime);
        regime.vmfree(b);
        assert_vmalloc_partition(&regime);
    }

    fn exhaust_and_release(regime: &MemoryRegime<'static, SimSpace>) -> usize {
        let mut held = Vec::new();
        while let Some(area) = regime.vmalloc(PAGE_SIZE, VmallocFlags::MAP) {
            held.push(area);
        }
        let n = held.len();
        for area in held {
            regime.vmfree(area);
        }
        n
    }

    #[test]
    fn vmalloc_oom_is_graceful() {
        // Drive the carver to frame exhaustion and back, twice; the
        // second cycle must see the same capacity and leak no descriptors.
        let regime = sim_regime(96);
        let first = exhaust_and_release(&regime);
        assert!(first > 0);
        let descriptor_stats = regime.slub_stats(regime.vmalloc_state().allocator());

        let second = exhaust_and_release(&regime);
        assert_eq!(first, second);
        assert_eq!(
            regime.slub_stats(regime.vmalloc_state().allocator()),
            descriptor_stats
        );
        assert_vmalloc_partition(&regime);
    }

    #[test]
    fn slub_membership_invariant_under_churn() {
        // Slab list membership must hold with real slab growth through vmalloc.
        let regime = sim_regime(1024);
        let class = regime.kmalloc_class(32).unwrap();

        let mut held = Vec::new();
        for i in 0..700u32 {
            held.push(regime.kmalloc(32).unwrap());
            if i % 3 == 0 {
                regime.kfree(held.remove(held.len() / 2));
            }
        }
        regime.slub_walk(class, |slab| match slab.state {
            SlabState::Free => assert_eq!(slab.objects_used, 0),
            SlabState::Partial => {
                assert!(slab.objects_used > 0 && slab.objects_used < slab.objects_max)
            }
            SlabState::Full => assert_eq!(slab.objects_used, slab.objects_max),
        });
        for p in held {
            regime.kfree(p);
        }
    }

    #[test]
    fn context_clone_stages_copy_on_write() {
        // After a clone both contexts read the page, neither may
        // write it, and the shared page table is doubly referenced.
        let regime = sim_regime(8192);
        let ctx1 = regime.context_create().unwrap();
        regime.context_set(ctx1);

        let user = VirtAddress::from_raw(0x0804_8000);
        let frame = regime.page_alloc(AllocFlags::CLEAR).unwrap();
        regime
            .map_page(
                Page::new(user),
                frame,
                Access::READ | Access::WRITE | Access::USER,
                MapFlags::PRESENT,
            )
            .unwrap();
        write_u32(regime.space(), user, 0x5111C1A1);

        let ctx2 = regime.context_clone(ctx1).unwrap();

        for ctx in [ctx1, ctx2] {
            regime.context_set(ctx);
            assert_eq!(read_u32(regime.space(), user), 0x5111C1A1);
            let rights = regime.rights(Page::new(user)).unwrap();
            assert!(!rights.contains(Access::WRITE));
        }

        // Exactly one frame (the shared page table) is doubly referenced.
        let mut doubly = 0;
        for index in 0..regime.frames().frame_count() as u32 {
            if regime.frames().counter(Frame::from_index(index).start()) == Some(2) {
                doubly += 1;
            }
        }
        assert_eq!(doubly, 1);

        // Tearing down the clone keeps the shared table and data alive.
        regime.context_set(ctx2);
        regime.context_drop(ctx2);
        regime.context_set(ctx1);
        assert_eq!(read_u32(regime.space(), user), 0x5111C1A1);

        // The last drop releases the data page and the table.
        regime.context_drop(ctx1);
        assert_eq!(regime.frames().counter(frame.start()), Some(0));
    }

    #[test]
    fn context_usage_counting() {
        let regime = sim_regime(512);
        let ctx = regime.context_create().unwrap();
        regime.context_use(ctx);
        assert_eq!(regime.context_usage(ctx), 2);
        regime.context_set(ctx);
        regime.context_drop(ctx);
        assert_eq!(regime.context_usage(ctx), 1);
        regime.context_drop(ctx);
    }

    #[test]
    fn write_fault_hook_stays_unresolved() {
        let regime = sim_regime(512);
        assert_eq!(
            regime.on_write_fault(VirtAddress::from_raw(0x0804_8000)),
            crate::memory::context::ResolveOutcome::Unresolved
        );
    }

    #[test]
    fn map_interval_unwinds_on_exhaustion() {
        // A failing multi-page mapping must not leave a poisoned prefix
        // behind.
        let regime = sim_regime(64);
        let free_before: usize = [Pool::Bios, Pool::Isa, Pool::Normal]
            .iter()
            .map(|&p| regime.frames().free_frames(p))
            .sum();

        let start = VirtAddress::from_raw(0xE000_0000);
        let end = VirtAddress::from_raw(0xE000_0000 + 128 * PAGE_SIZE.as_raw());
        assert_eq!(
            regime.map_interval(start, end, Access::READ | Access::WRITE),
            Err(MemoryError::OutOfMemory)
        );

        let free_after: usize = [Pool::Bios, Pool::Isa, Pool::Normal]
            .iter()
            .map(|&p| regime.frames().free_frames(p))
            .sum();
        assert_eq!(free_before, free_after);
        assert!(!regime.space().is_mapped(start));

        // The range is reusable afterwards.
        let short_end = VirtAddress::from_raw(0xE000_0000 + 2 * PAGE_SIZE.as_raw());
        regime
            .map_interval(start, short_end, Access::READ | Access::WRITE)
            .unwrap();
        regime.unmap_interval(start, short_end);
    }

    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        // The address-range partition must hold under random alloc/free interleavings.
        #[test]
        fn vmalloc_partition_under_churn(ops in proptest::collection::vec((1u32..8, any::<bool>()), 1..24)) {
            let regime = sim_regime(256);
            let mut held: Vec<VirtAddress> = Vec::new();
            for (pages, free_one) in ops {
                if free_one && !held.is_empty() {
                    let area = held.swap_remove(pages as usize % held.len());
                    regime.vmfree(area);
                } else if let Some(area) =
                    regime.vmalloc(Length::from_raw(pages * PAGE_SIZE.as_raw()), VmallocFlags::empty())
                {
                    held.push(area);
                }
                assert_vmalloc_partition(&regime);
            }
            for area in held {
                regime.vmfree(area);
            }
            assert_vmalloc_partition(&regime);
        }
    }
}
