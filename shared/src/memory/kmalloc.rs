//! The general-purpose kernel allocator: a fixed table of size classes,
//! each backed by a lazily filled slub pool.

use core::sync::atomic::{AtomicU32, Ordering};

use log::error;

use crate::memory::addr::VirtAddress;
use crate::memory::slub::{SlubFlags, NIL};
use crate::paging::AddressSpace;

use super::regime::MemoryRegime;

pub const MALLOC_ALIGNMENT: u32 = 16;

struct ClassDef {
    length: u32,
    obj_per_slab: u32,
    initial_slabs: u32,
}

const CLASSES: [ClassDef; 12] = [
    ClassDef { length: 32, obj_per_slab: 256, initial_slabs: 8 },
    ClassDef { length: 64, obj_per_slab: 128, initial_slabs: 4 },
    ClassDef { length: 128, obj_per_slab: 64, initial_slabs: 4 },
    ClassDef { length: 256, obj_per_slab: 32, initial_slabs: 2 },
    ClassDef { length: 512, obj_per_slab: 16, initial_slabs: 2 },
    ClassDef { length: 1024, obj_per_slab: 8, initial_slabs: 1 },
    ClassDef { length: 2048, obj_per_slab: 8, initial_slabs: 1 },
    ClassDef { length: 4096, obj_per_slab: 8, initial_slabs: 1 },
    ClassDef { length: 8192, obj_per_slab: 4, initial_slabs: 0 },
    ClassDef { length: 16384, obj_per_slab: 4, initial_slabs: 0 },
    ClassDef { length: 32768, obj_per_slab: 4, initial_slabs: 0 },
    ClassDef { length: 65536, obj_per_slab: 2, initial_slabs: 0 },
];

/// The class table; each slot holds the virtual address of the class's slub
/// allocator once `kmalloc_setup` ran.
pub struct Kmalloc {
    allocators: [AtomicU32; CLASSES.len()],
}

impl Kmalloc {
    pub(crate) fn new() -> Kmalloc {
        const EMPTY: AtomicU32 = AtomicU32::new(NIL);
        Kmalloc {
            allocators: [EMPTY; CLASSES.len()],
        }
    }
}

impl<'f, A: AddressSpace> MemoryRegime<'f, A> {
    /// Creates every size class. All classes are lazy: the first allocation
    /// in a class creates its first slab.
    pub(crate) fn kmalloc_setup(&self) -> Result<(), crate::error::MemoryError> {
        for (slot, def) in self.kmalloc_state().allocators.iter().zip(CLASSES.iter()) {
            let allocator = self
                .create_slub_allocator(
                    def.length,
                    MALLOC_ALIGNMENT,
                    0,
                    def.obj_per_slab,
                    def.initial_slabs,
                    SlubFlags::LAZY,
                )
                .ok_or(crate::error::MemoryError::OutOfMemory)?;
            slot.store(allocator.as_raw(), Ordering::Relaxed);
        }
        Ok(())
    }

    /// Allocates `size` bytes from the smallest class that fits, aligned to
    /// `MALLOC_ALIGNMENT`. Sizes above the largest class fail.
    pub fn kmalloc(&self, size: u32) -> Option<VirtAddress> {
        for (slot, def) in self.kmalloc_state().allocators.iter().zip(CLASSES.iter()) {
            if size <= def.length {
                return self.slub_allocate(VirtAddress::from_raw(slot.load(Ordering::Relaxed)));
            }
        }
        error!("kmalloc: allocation of {size} bytes is too big");
        None
    }

    /// Frees a pointer returned by [`Self::kmalloc`] by asking each class in
    /// turn; a pointer no class owns is logged and ignored.
    pub fn kfree(&self, object: VirtAddress) {
        for slot in self.kmalloc_state().allocators.iter() {
            let allocator = VirtAddress::from_raw(slot.load(Ordering::Relaxed));
            if self.slub_free(allocator, object) {
                return;
            }
        }
        error!(
            "kfree: {:#010x} was not allocated with kmalloc",
            object.as_raw()
        );
    }

    /// The slub allocator backing the class that serves `size`, for
    /// diagnostics and tests.
    pub fn kmalloc_class(&self, size: u32) -> Option<VirtAddress> {
        for (slot, def) in self.kmalloc_state().allocators.iter().zip(CLASSES.iter()) {
            if size <= def.length {
                return Some(VirtAddress::from_raw(slot.load(Ordering::Relaxed)));
            }
        }
        None
    }
}
