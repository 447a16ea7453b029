//! Physical frame accounting: one descriptor per 4 KiB frame and the
//! three-pool free-frame allocator.
//!
//! Allocation and free are O(1) list operations. The allocator does not
//! support contiguous multi-frame allocations; nothing in the kernel needs
//! them.
//!
//! The descriptor array is storage borrowed from the caller: the kernel
//! carves it out of boot memory (and later re-maps it into kernel virtual
//! space, constructing a fresh `FrameTable` over the moved slice), tests hand
//! in an owned array.

use core::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use log::error;

use super::addr::PhysAddress;
use super::map::{Map, MemoryType};
use super::page::{Frame, PAGE_SHIFT, PAGE_SIZE};

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct FrameFlags: u8 {
        /// Never allocatable; not on any free list.
        const RESERVED = 1 << 0;
        /// Below 1 MiB.
        const BIOS = 1 << 1;
        /// Below 16 MiB.
        const ISA = 1 << 2;
    }
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct AllocFlags: u8 {
        /// Allocate from the sub-1 MiB pool.
        const BIOS = 1 << 0;
        /// Allocate from the sub-16 MiB pool.
        const ISA = 1 << 1;
        /// Hand the frame back zeroed.
        const CLEAR = 1 << 2;
    }
}

/// Free-list link sentinel.
pub const NO_FRAME: u32 = u32::MAX;

const BIOS_LIMIT_FRAME: u32 = 0x0010_0000 >> PAGE_SHIFT;
const ISA_LIMIT_FRAME: u32 = 0x0100_0000 >> PAGE_SHIFT;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Pool {
    Bios,
    Isa,
    Normal,
}

/// One descriptor per physical frame.
///
/// `count` is guarded by the per-frame lock, the free-list links by the
/// table's pool lock. The pool classification bits are fixed at
/// construction.
pub struct FrameInfo {
    index: u32,
    count: AtomicU32,
    flags: AtomicU8,
    lock: spin::Mutex<()>,
    next_free: AtomicU32,
    prev_free: AtomicU32,
}

impl FrameInfo {
    pub const fn new(index: u32) -> FrameInfo {
        let mut flags = FrameFlags::RESERVED.bits();
        if index < BIOS_LIMIT_FRAME {
            flags |= FrameFlags::BIOS.bits();
        }
        if index < ISA_LIMIT_FRAME {
            flags |= FrameFlags::ISA.bits();
        }
        FrameInfo {
            index,
            count: AtomicU32::new(0),
            flags: AtomicU8::new(flags),
            lock: spin::Mutex::new(()),
            next_free: AtomicU32::new(NO_FRAME),
            prev_free: AtomicU32::new(NO_FRAME),
        }
    }

    pub fn flags(&self) -> FrameFlags {
        FrameFlags::from_bits_truncate(self.flags.load(Ordering::Relaxed))
    }

    pub fn pool(&self) -> Pool {
        let flags = self.flags();
        if flags.contains(FrameFlags::BIOS) {
            Pool::Bios
        } else if flags.contains(FrameFlags::ISA) {
            Pool::Isa
        } else {
            Pool::Normal
        }
    }

    fn is_reserved(&self) -> bool {
        self.flags().contains(FrameFlags::RESERVED)
    }

    fn set_reserved(&self) {
        self.flags
            .fetch_or(FrameFlags::RESERVED.bits(), Ordering::Relaxed);
    }

    fn clear_reserved(&self) {
        self.flags
            .fetch_and(!FrameFlags::RESERVED.bits(), Ordering::Relaxed);
    }
}

/// Clears the reserved bit of every frame fully contained in an `Available`
/// region. Runs on the bare descriptor array before the pools are built.
pub fn mark_available(frames: &[FrameInfo], map: &Map) {
    for extent in map.iter_type(MemoryType::Available) {
        let mut addr = extent.address().align_up(PAGE_SIZE.as_raw());
        let end = match extent.end_address() {
            Some(end) => end.as_raw(),
            None => u32::MAX & !(PAGE_SIZE.as_raw() - 1),
        };
        while addr.as_raw().checked_add(PAGE_SIZE.as_raw()).map_or(false, |e| e <= end) {
            let index = (addr.as_raw() >> PAGE_SHIFT) as usize;
            if index < frames.len() {
                frames[index].clear_reserved();
            }
            addr += PAGE_SIZE;
        }
    }
}

struct FreePools {
    bios: u32,
    isa: u32,
    normal: u32,
}

impl FreePools {
    fn head(&mut self, pool: Pool) -> &mut u32 {
        match pool {
            Pool::Bios => &mut self.bios,
            Pool::Isa => &mut self.isa,
            Pool::Normal => &mut self.normal,
        }
    }
}

/// The frame allocator. Owns the three free pools over a borrowed descriptor
/// array.
pub struct FrameTable<'a> {
    frames: &'a [FrameInfo],
    pools: spin::Mutex<FreePools>,
}

impl<'a> FrameTable<'a> {
    /// Builds the free pools from the current descriptor state: every frame
    /// that is neither reserved nor referenced goes on its pool's list. Also
    /// used to rebuild the pools after the descriptor array has been re-mapped
    /// to its kernel-virtual home.
    pub fn new(frames: &'a [FrameInfo]) -> FrameTable<'a> {
        let mut pools = FreePools {
            bios: NO_FRAME,
            isa: NO_FRAME,
            normal: NO_FRAME,
        };
        // Walk backwards so each pool pops frames in ascending address order.
        for info in frames.iter().rev() {
            info.next_free.store(NO_FRAME, Ordering::Relaxed);
            info.prev_free.store(NO_FRAME, Ordering::Relaxed);
            if info.is_reserved() || info.count.load(Ordering::Relaxed) != 0 {
                continue;
            }
            let head = pools.head(info.pool());
            info.next_free.store(*head, Ordering::Relaxed);
            if *head != NO_FRAME {
                frames[*head as usize]
                    .prev_free
                    .store(info.index, Ordering::Relaxed);
            }
            *head = info.index;
        }
        FrameTable {
            frames,
            pools: spin::Mutex::new(pools),
        }
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    fn get(&self, paddr: PhysAddress) -> Option<&FrameInfo> {
        let index = (paddr.align_down(PAGE_SIZE.as_raw()).as_raw() >> PAGE_SHIFT) as usize;
        self.frames.get(index)
    }

    // Pool list primitives; all callers hold the pool lock.

    fn push_front(&self, pools: &mut FreePools, info: &FrameInfo) {
        let head = pools.head(info.pool());
        info.prev_free.store(NO_FRAME, Ordering::Relaxed);
        info.next_free.store(*head, Ordering::Relaxed);
        if *head != NO_FRAME {
            self.frames[*head as usize]
                .prev_free
                .store(info.index, Ordering::Relaxed);
        }
        *head = info.index;
    }

    fn unlink(&self, pools: &mut FreePools, info: &FrameInfo) {
        let prev = info.prev_free.load(Ordering::Relaxed);
        let next = info.next_free.load(Ordering::Relaxed);
        if prev == NO_FRAME {
            let head = pools.head(info.pool());
            debug_assert_eq!(*head, info.index);
            *head = next;
        } else {
            self.frames[prev as usize]
                .next_free
                .store(next, Ordering::Relaxed);
        }
        if next != NO_FRAME {
            self.frames[next as usize]
                .prev_free
                .store(prev, Ordering::Relaxed);
        }
        info.next_free.store(NO_FRAME, Ordering::Relaxed);
        info.prev_free.store(NO_FRAME, Ordering::Relaxed);
    }

    fn pop_front(&self, pools: &mut FreePools, pool: Pool) -> Option<&FrameInfo> {
        let head = *pools.head(pool);
        if head == NO_FRAME {
            return None;
        }
        let info = &self.frames[head as usize];
        self.unlink(pools, info);
        Some(info)
    }

    /// Marks a frame as permanently unallocatable. Boot-time only.
    ///
    /// # Panics
    ///
    /// Panics if the frame is out of range or currently referenced.
    pub fn reserve(&self, frame: Frame) {
        let info = self
            .get(frame.start())
            .unwrap_or_else(|| panic!("frame {:#010x} is out of range", frame.start().as_raw()));
        if info.count.load(Ordering::Relaxed) != 0 {
            panic!(
                "frame {:#010x} is used and cannot be reserved",
                frame.start().as_raw()
            );
        }
        if info.is_reserved() {
            return;
        }
        let mut pools = self.pools.lock();
        self.unlink(&mut pools, info);
        info.set_reserved();
    }

    /// Takes a known frame out of the free pools with a reference count of
    /// one. Used at boot to claim the kernel image and the descriptor array.
    ///
    /// # Panics
    ///
    /// Panics if the frame is out of range, reserved, or already used.
    pub fn use_frame(&self, frame: Frame) {
        let info = self
            .get(frame.start())
            .unwrap_or_else(|| panic!("frame {:#010x} is out of range", frame.start().as_raw()));
        if info.is_reserved() {
            panic!(
                "frame {:#010x} is reserved and cannot be used",
                frame.start().as_raw()
            );
        }
        if info.count.load(Ordering::Relaxed) != 0 {
            panic!("frame {:#010x} is already used", frame.start().as_raw());
        }
        let mut pools = self.pools.lock();
        self.unlink(&mut pools, info);
        info.count.store(1, Ordering::Relaxed);
    }

    /// `use_frame` over `[start, end)` physical addresses.
    pub fn use_interval(&self, start: PhysAddress, end: PhysAddress) {
        let mut addr = start.align_down(PAGE_SIZE.as_raw());
        while addr < end {
            self.use_frame(Frame::containing(addr));
            addr += PAGE_SIZE;
        }
    }

    /// `use_frame` over `length` bytes starting at `start`.
    pub fn use_area(&self, start: PhysAddress, length: u32) {
        self.use_interval(start, PhysAddress::from_raw(start.as_raw() + length));
    }

    /// Allocates one frame. Pool priority: the normal pool, falling back to
    /// the ISA pool and then the BIOS pool when drained; `ISA`/`BIOS` request
    /// flags force the fallback. Returns the frame and whether the caller
    /// must zero it before handing it out.
    pub fn allocate(&self, flags: AllocFlags) -> Option<(Frame, bool)> {
        let mut pools = self.pools.lock();
        let mut pool = Pool::Normal;
        if flags.contains(AllocFlags::ISA) || *pools.head(Pool::Normal) == NO_FRAME {
            pool = Pool::Isa;
        }
        if flags.contains(AllocFlags::BIOS) || *pools.head(pool) == NO_FRAME {
            pool = Pool::Bios;
        }
        let info = match self.pop_front(&mut pools, pool) {
            Some(info) => info,
            None => {
                error!("page: no free frames");
                return None;
            }
        };
        info.count.store(1, Ordering::Relaxed);
        Some((
            Frame::from_index(info.index),
            flags.contains(AllocFlags::CLEAR),
        ))
    }

    /// Drops one reference; when the count reaches zero the frame goes back
    /// to its original pool.
    ///
    /// # Panics
    ///
    /// Panics on an out-of-range address, a reserved frame, or a frame that
    /// is already free.
    pub fn free(&self, paddr: PhysAddress) {
        let info = self
            .get(paddr)
            .unwrap_or_else(|| panic!("frame {:#010x} is out of range", paddr.as_raw()));
        if info.count.load(Ordering::Relaxed) == 0 {
            panic!(
                "freeing frame {:#010x} that is already free",
                paddr.as_raw()
            );
        }
        if info.is_reserved() {
            panic!("freeing reserved frame {:#010x}", paddr.as_raw());
        }
        let became_free = {
            let _guard = info.lock.lock();
            let count = info.count.load(Ordering::Relaxed);
            info.count.store(count - 1, Ordering::Relaxed);
            count == 1
        };
        if became_free {
            let mut pools = self.pools.lock();
            self.push_front(&mut pools, info);
        }
    }

    /// Adds a reference to a live frame.
    ///
    /// # Panics
    ///
    /// Panics if the frame is free: sharing can only start from an owner.
    pub fn reference(&self, paddr: PhysAddress) {
        let info = self
            .get(paddr)
            .unwrap_or_else(|| panic!("frame {:#010x} is out of range", paddr.as_raw()));
        info.count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |count| {
                if count == 0 {
                    None
                } else {
                    Some(count + 1)
                }
            })
            .unwrap_or_else(|_| panic!("referencing free frame {:#010x}", paddr.as_raw()));
    }

    /// Reference count of a frame, or `None` for reserved or out-of-range
    /// frames. Lock the frame first for a stable reading.
    pub fn counter(&self, paddr: PhysAddress) -> Option<u32> {
        let info = self.get(paddr)?;
        if info.is_reserved() {
            return None;
        }
        Some(info.count.load(Ordering::Relaxed))
    }

    /// Acquires the per-frame lock.
    ///
    /// # Panics
    ///
    /// Panics on reserved or free frames; they have nothing to guard.
    pub fn lock(&self, paddr: PhysAddress) -> spin::MutexGuard<'_, ()> {
        let info = self
            .get(paddr)
            .unwrap_or_else(|| panic!("frame {:#010x} is out of range", paddr.as_raw()));
        if info.count.load(Ordering::Relaxed) == 0 {
            panic!("locking free frame {:#010x}", paddr.as_raw());
        }
        if info.is_reserved() {
            panic!("locking reserved frame {:#010x}", paddr.as_raw());
        }
        info.lock.lock()
    }

    /// Walks one free pool, yielding frame indices. Diagnostic surface, also
    /// used by the invariant tests.
    pub fn walk_free(&self, pool: Pool, mut f: impl FnMut(u32)) {
        let mut pools = self.pools.lock();
        let mut cursor = *pools.head(pool);
        while cursor != NO_FRAME {
            f(cursor);
            cursor = self.frames[cursor as usize]
                .next_free
                .load(Ordering::Relaxed);
        }
    }

    pub fn free_frames(&self, pool: Pool) -> usize {
        let mut n = 0;
        self.walk_free(pool, |_| n += 1);
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::map::MapEntry;

    use std::boxed::Box;
    use std::collections::BTreeSet;
    use std::vec::Vec;

    fn make_table(frame_count: u32) -> FrameTable<'static> {
        let frames: Vec<FrameInfo> = (0..frame_count).map(FrameInfo::new).collect();
        let frames: &'static [FrameInfo] = Box::leak(frames.into_boxed_slice());
        let map = Map::from_entries([MapEntry {
            extent: PhysExtent::from_raw(0, frame_count * PAGE_SIZE.as_raw()),
            mem_type: MemoryType::Available,
        }]);
        mark_available(frames, &map);
        let table = FrameTable::new(frames);
        table.reserve(Frame::from_index(0));
        table
    }

    use crate::memory::addr::PhysExtent;

    #[test]
    fn classification() {
        let table = make_table(8192);
        assert_eq!(table.free_frames(Pool::Bios), 255); // frame 0 reserved
        assert_eq!(table.free_frames(Pool::Isa), 4096 - 256);
        assert_eq!(table.free_frames(Pool::Normal), 8192 - 4096);
    }

    #[test]
    fn pool_priority() {
        let table = make_table(8192);
        let (frame, _) = table.allocate(AllocFlags::empty()).unwrap();
        assert!(frame.index() >= ISA_LIMIT_FRAME);
        let (frame, _) = table.allocate(AllocFlags::ISA).unwrap();
        assert!(frame.index() >= BIOS_LIMIT_FRAME && frame.index() < ISA_LIMIT_FRAME);
        let (frame, _) = table.allocate(AllocFlags::BIOS).unwrap();
        assert!(frame.index() < BIOS_LIMIT_FRAME);
    }

    #[test]
    fn falls_back_when_normal_pool_drains() {
        let table = make_table(4097); // exactly one normal frame
        let (first, _) = table.allocate(AllocFlags::empty()).unwrap();
        assert_eq!(first.index(), 4096);
        let (second, _) = table.allocate(AllocFlags::empty()).unwrap();
        assert!(second.index() < ISA_LIMIT_FRAME);
    }

    #[test]
    fn alloc_free_round_trip_preserves_pool() {
        // The pool is set-equal before and after an alloc/free pair.
        let table = make_table(512);
        let mut before = BTreeSet::new();
        table.walk_free(Pool::Isa, |i| {
            before.insert(i);
        });

        let (frame, _) = table.allocate(AllocFlags::ISA).unwrap();
        assert_eq!(table.counter(frame.start()), Some(1));
        table.free(frame.start());
        assert_eq!(table.counter(frame.start()), Some(0));

        let mut after = BTreeSet::new();
        table.walk_free(Pool::Isa, |i| {
            after.insert(i);
        });
        assert_eq!(before, after);
    }

    #[test]
    fn reference_counting() {
        let table = make_table(512);
        let (frame, _) = table.allocate(AllocFlags::empty()).unwrap();
        table.reference(frame.start());
        assert_eq!(table.counter(frame.start()), Some(2));
        table.free(frame.start());
        assert_eq!(table.counter(frame.start()), Some(1));
        table.free(frame.start());
        assert_eq!(table.counter(frame.start()), Some(0));
    }

    #[test]
    fn counter_of_reserved_is_none() {
        let table = make_table(512);
        assert_eq!(table.counter(PhysAddress::from_raw(0)), None);
        assert_eq!(
            table.counter(PhysAddress::from_raw(512 * PAGE_SIZE.as_raw())),
            None
        );
    }

    #[test]
    #[should_panic(expected = "already free")]
    fn double_free_panics() {
        let table = make_table(512);
        let (frame, _) = table.allocate(AllocFlags::empty()).unwrap();
        table.free(frame.start());
        table.free(frame.start());
    }

    #[test]
    #[should_panic(expected = "referencing free frame")]
    fn reference_free_frame_panics() {
        let table = make_table(512);
        table.reference(PhysAddress::from_raw(8 * PAGE_SIZE.as_raw()));
    }

    #[test]
    #[should_panic(expected = "locking free frame")]
    fn lock_free_frame_panics() {
        let table = make_table(512);
        table.lock(PhysAddress::from_raw(8 * PAGE_SIZE.as_raw()));
    }

    #[test]
    fn exhaustion_is_not_fatal() {
        let table = make_table(4);
        let mut allocated = Vec::new();
        while let Some((frame, _)) = table.allocate(AllocFlags::empty()) {
            allocated.push(frame);
        }
        assert_eq!(allocated.len(), 3);
        for frame in allocated {
            table.free(frame.start());
        }
    }

    use proptest::prelude::*;

    proptest! {
        // Every non-reserved frame is on exactly one free list xor has a
        // positive reference count, across random alloc/free interleavings.
        #[test]
        fn pools_partition_frames(ops in proptest::collection::vec(0u8..4, 1..64)) {
            let table = make_table(64);
            let mut live: Vec<Frame> = Vec::new();
            for op in ops {
                match op {
                    0..=2 => {
                        if let Some((frame, _)) = table.allocate(AllocFlags::empty()) {
                            live.push(frame);
                        }
                    }
                    _ => {
                        if let Some(frame) = live.pop() {
                            table.free(frame.start());
                        }
                    }
                }

                let mut walked = Vec::new();
                for pool in [Pool::Bios, Pool::Isa, Pool::Normal] {
                    table.walk_free(pool, |i| walked.push(i));
                }
                let on_lists: BTreeSet<u32> = walked.iter().copied().collect();
                prop_assert_eq!(on_lists.len(), walked.len(), "frame on two lists");
                for index in 1..64u32 {
                    let paddr = Frame::from_index(index).start();
                    let count = table.counter(paddr).unwrap();
                    prop_assert_eq!(
                        on_lists.contains(&index),
                        count == 0,
                        "frame {} count {} listed {}",
                        index, count, on_lists.contains(&index)
                    );
                }
            }
        }
    }
}
