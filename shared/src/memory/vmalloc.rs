//! The kernel virtual-region carver.
//!
//! `[VMALLOC_START, VMALLOC_END)` is partitioned into areas kept on a free
//! and a used list; allocation is first-fit with a tail split. Area
//! descriptors come from a dedicated slub pool, which is seeded at setup
//! from a hand-mapped range just below `VMALLOC_START` because vmalloc
//! cannot feed the pool before it exists itself.

use core::sync::atomic::{AtomicU32, Ordering};

use log::warn;

use crate::error::MemoryError;
use crate::memory::addr::{Length, VirtAddress};
use crate::memory::page::{PAGE_SIZE, VMALLOC_END, VMALLOC_START};
use crate::memory::slub::{SlubFlags, NIL};
use crate::paging::{descr_mut, raw_slot, Access, AddressSpace};

use super::regime::MemoryRegime;

pub(crate) const VMAREA_MIN_FREE: u32 = 0;
pub(crate) const VMAREA_PER_SLAB: u32 = 64;
pub(crate) const VMAREA_ALIGN: u32 = 16;

/// Length of the hand-mapped descriptor seed range below `VMALLOC_START`.
pub(crate) const VMALLOC_SEED_LENGTH: u32 = 8192;

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct VmallocFlags: u8 {
        /// Back the range with freshly allocated frames.
        const MAP = 1 << 0;
        /// Zero the payload after backing it.
        const ZERO = 1 << 1;
    }
}

/// One area of the managed range. Lives in slab memory; every field is
/// guarded by the vmalloc list lock.
#[repr(C, align(32))]
pub(crate) struct VmArea {
    base: u32,
    length: u32,
    mapped: u32,
    next: u32,
    prev: u32,
}

static_assertions::const_assert_eq!(core::mem::size_of::<VmArea>(), 32);

pub(crate) struct VmLists {
    free: u32,
    used: u32,
}

pub struct Vmalloc {
    lists: spin::Mutex<VmLists>,
    /// Slub pool of `VmArea` descriptors, installed at setup.
    allocator: AtomicU32,
}

impl Vmalloc {
    pub(crate) fn new() -> Vmalloc {
        Vmalloc {
            lists: spin::Mutex::new(VmLists {
                free: NIL,
                used: NIL,
            }),
            allocator: AtomicU32::new(NIL),
        }
    }

    pub(crate) fn allocator(&self) -> VirtAddress {
        VirtAddress::from_raw(self.allocator.load(Ordering::Relaxed))
    }
}

// Area list primitives; all callers hold the vmalloc list lock. Every
// `descr_mut` below is sound for the same reason: the lock serializes all
// access to every `VmArea`.

fn push_front<A: AddressSpace + ?Sized>(space: &A, head: &mut u32, va: u32) {
    let area: &mut VmArea = unsafe { descr_mut(space, VirtAddress::from_raw(va)) };
    area.prev = NIL;
    area.next = *head;
    if *head != NIL {
        let old: &mut VmArea = unsafe { descr_mut(space, VirtAddress::from_raw(*head)) };
        old.prev = va;
    }
    *head = va;
}

fn unlink<A: AddressSpace + ?Sized>(space: &A, head: &mut u32, va: u32) {
    let (prev, next) = {
        let area: &mut VmArea = unsafe { descr_mut(space, VirtAddress::from_raw(va)) };
        let links = (area.prev, area.next);
        area.prev = NIL;
        area.next = NIL;
        links
    };
    if prev == NIL {
        debug_assert_eq!(*head, va);
        *head = next;
    } else {
        let prev_area: &mut VmArea = unsafe { descr_mut(space, VirtAddress::from_raw(prev)) };
        prev_area.next = next;
    }
    if next != NIL {
        let next_area: &mut VmArea = unsafe { descr_mut(space, VirtAddress::from_raw(next)) };
        next_area.prev = prev;
    }
}

impl<'f, A: AddressSpace> MemoryRegime<'f, A> {
    /// Allocates a `VmArea` descriptor from the dedicated pool.
    fn vmarea_allocate(&self) -> Option<VirtAddress> {
        let va = self.slub_allocate(self.vmalloc_state().allocator())?;
        // SAFETY: a freshly allocated slot, exclusively ours.
        unsafe {
            raw_slot::<VmArea, A>(self.space(), va).write(VmArea {
                base: 0,
                length: 0,
                mapped: 0,
                next: NIL,
                prev: NIL,
            });
        }
        Some(va)
    }

    /// Brings up the carver: creates the descriptor pool, seeds it from a
    /// hand-mapped range below `VMALLOC_START`, and installs the initial
    /// free area covering the whole managed range.
    pub(crate) fn vmalloc_setup(&self) -> Result<(), MemoryError> {
        let allocator = self
            .create_slub_allocator(
                core::mem::size_of::<VmArea>() as u32,
                VMAREA_ALIGN,
                VMAREA_MIN_FREE,
                VMAREA_PER_SLAB,
                0,
                SlubFlags::LAZY,
            )
            .ok_or(MemoryError::OutOfMemory)?;
        self.vmalloc_state()
            .allocator
            .store(allocator.as_raw(), Ordering::Relaxed);

        // The pool cannot go through vmalloc yet, so its first slab is a
        // range mapped by hand.
        let seed_start = VMALLOC_START - Length::from_raw(VMALLOC_SEED_LENGTH);
        self.map_interval(seed_start, VMALLOC_START, Access::READ | Access::WRITE)?;
        self.slub_add_memory(allocator, seed_start, VMALLOC_START)
            .ok_or(MemoryError::OutOfMemory)?;

        let initial = self.vmarea_allocate().ok_or(MemoryError::OutOfMemory)?;
        let mut lists = self.vmalloc_state().lists.lock();
        {
            let area: &mut VmArea =
                unsafe { descr_mut(self.space(), initial) };
            area.base = VMALLOC_START.as_raw();
            area.length = VMALLOC_END.as_raw() - VMALLOC_START.as_raw();
            area.mapped = 0;
        }
        push_front(self.space(), &mut lists.free, initial.as_raw());
        Ok(())
    }

    /// Allocates a virtual memory area of `size` bytes (rounded up to whole
    /// pages), first-fit. `MAP` backs it with zeroed frames, `ZERO`
    /// additionally clears the payload. Returns `None` when no free area is
    /// large enough or backing memory runs out.
    pub fn vmalloc(&self, size: Length, flags: VmallocFlags) -> Option<VirtAddress> {
        let size = size.align_up(PAGE_SIZE.as_raw()).as_raw();
        if size == 0 {
            return None;
        }

        let space = self.space();
        let mut lists = self.vmalloc_state().lists.lock();

        let mut cursor = lists.free;
        while cursor != NIL {
            let area: &mut VmArea = unsafe { descr_mut(space, VirtAddress::from_raw(cursor)) };
            if area.length >= size {
                break;
            }
            cursor = area.next;
        }
        if cursor == NIL {
            return None;
        }

        unlink(space, &mut lists.free, cursor);
        push_front(space, &mut lists.used, cursor);

        let (base, length) = {
            let area: &mut VmArea = unsafe { descr_mut(space, VirtAddress::from_raw(cursor)) };
            (area.base, area.length)
        };

        if length > size {
            // Split the tail back into the free list. Allocating the new
            // descriptor can itself grow the descriptor pool.
            match self.vmarea_allocate() {
                Some(rest) => {
                    {
                        let area: &mut VmArea = unsafe { descr_mut(space, rest) };
                        area.base = base + size;
                        area.length = length - size;
                        area.mapped = 0;
                    }
                    push_front(space, &mut lists.free, rest.as_raw());
                    let area: &mut VmArea =
                        unsafe { descr_mut(space, VirtAddress::from_raw(cursor)) };
                    area.length = size;
                }
                None => {
                    unlink(space, &mut lists.used, cursor);
                    push_front(space, &mut lists.free, cursor);
                    return None;
                }
            }
        }

        let base = VirtAddress::from_raw(base);
        if flags.contains(VmallocFlags::MAP) {
            let end = base + Length::from_raw(size);
            if self
                .map_interval(base, end, Access::READ | Access::WRITE)
                .is_err()
            {
                unlink(space, &mut lists.used, cursor);
                push_front(space, &mut lists.free, cursor);
                return None;
            }
            if flags.contains(VmallocFlags::ZERO) {
                crate::paging::fill(space, base, size, 0);
            }
            let area: &mut VmArea = unsafe { descr_mut(space, VirtAddress::from_raw(cursor)) };
            area.mapped = 1;
        }
        Some(base)
    }

    /// Frees an area previously returned by [`Self::vmalloc`], unmapping and
    /// releasing its backing frames if it was mapped. An unknown address is
    /// logged and ignored.
    pub fn vmfree(&self, va: VirtAddress) {
        let space = self.space();
        {
            let mut lists = self.vmalloc_state().lists.lock();
            let mut cursor = lists.used;
            while cursor != NIL {
                let (base, length, mapped) = {
                    let area: &mut VmArea =
                        unsafe { descr_mut(space, VirtAddress::from_raw(cursor)) };
                    (area.base, area.length, area.mapped)
                };
                if base == va.as_raw() {
                    // TODO: merge with adjacent free areas instead of
                    // keeping the split forever.
                    unlink(space, &mut lists.used, cursor);
                    if mapped != 0 {
                        self.unmap_interval(
                            VirtAddress::from_raw(base),
                            VirtAddress::from_raw(base + length),
                        );
                        let area: &mut VmArea =
                            unsafe { descr_mut(space, VirtAddress::from_raw(cursor)) };
                        area.mapped = 0;
                    }
                    push_front(space, &mut lists.free, cursor);
                    return;
                }
                let area: &mut VmArea = unsafe { descr_mut(space, VirtAddress::from_raw(cursor)) };
                cursor = area.next;
            }
        }
        warn!(
            "vmfree: no area starts at {:#010x}, nothing freed",
            va.as_raw()
        );
    }

    /// Walks every area under the list lock: `f(base, length, used)`.
    /// Diagnostic surface, also used by the partition tests.
    pub fn vmalloc_walk(&self, mut f: impl FnMut(VirtAddress, Length, bool)) {
        let space = self.space();
        let lists = self.vmalloc_state().lists.lock();
        for (head, used) in [(lists.free, false), (lists.used, true)] {
            let mut cursor = head;
            while cursor != NIL {
                let area: &mut VmArea = unsafe { descr_mut(space, VirtAddress::from_raw(cursor)) };
                f(
                    VirtAddress::from_raw(area.base),
                    Length::from_raw(area.length),
                    used,
                );
                cursor = area.next;
            }
        }
    }
}
