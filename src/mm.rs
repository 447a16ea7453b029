//! Kernel-side memory management: the global regime and its boot chain.
//!
//! Boot runs the allocator stack in reverse dependency order: the frame
//! descriptor table first (placed past the kernel image, identity-mapped),
//! then the kernel page directory, then the table's move into kernel
//! virtual space, then the slub/vmalloc/kmalloc bootstrap.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, Ordering};

use log::info;
use multiboot2 as mb2;

use shared::memory::addr::{PhysAddress, VirtAddress};
use shared::memory::frame::{self, AllocFlags, FrameInfo, FrameTable};
use shared::memory::page::{Frame, Page, KERNEL_BASE, PAGE_SHIFT, PAGE_SIZE};
use shared::memory::regime::{BootstrapLayout, MemoryRegime};
use shared::memory::vmalloc::VmallocFlags;
use shared::memory::{Length, Map, MemoryType};
use shared::paging::{Access, AddressSpace, MapFlags};

use crate::arch::x86::paging::{self as arch_paging, MirrorSpace};
use crate::multiboot::translate_memory_map;

/// A page-aligned static buffer whose memory the allocators write through
/// raw pointers.
#[repr(C, align(4096))]
struct PageBuf(UnsafeCell<[u8; PAGE_SIZE.as_raw() as usize]>);

static_assertions::assert_eq_size!(PageBuf, [u8; 4096]);

// SAFETY: all access goes through the allocator locks.
unsafe impl Sync for PageBuf {}

impl PageBuf {
    const fn zeroed() -> PageBuf {
        PageBuf(UnsafeCell::new([0; PAGE_SIZE.as_raw() as usize]))
    }

    fn vaddr(&self) -> VirtAddress {
        VirtAddress::from_raw(self.0.get() as usize as u32)
    }
}

/// Seed buffers for the slub bootstrap and the frame-clearing window.
static SLUB_SEED1: PageBuf = PageBuf::zeroed();
static SLUB_SEED2: PageBuf = PageBuf::zeroed();
static CLEAR_WINDOW: PageBuf = PageBuf::zeroed();

static REGIME: spin::Mutex<once_cell::unsync::OnceCell<MemoryRegime<'static, MirrorSpace>>> =
    spin::Mutex::new(once_cell::unsync::OnceCell::new());

/// Runs `f` against the global regime.
///
/// # Panics
///
/// Panics before `init` has completed.
pub fn with<R>(f: impl FnOnce(&MemoryRegime<'static, MirrorSpace>) -> R) -> R {
    let guard = REGIME.lock();
    f(guard.get().expect("memory manager is not initialized"))
}

/// Builds the frame descriptor array at its boot-time location, one
/// descriptor per frame up to the highest usable address.
fn build_boot_frame_table(array_phys: PhysAddress, frame_count: u32) -> &'static [FrameInfo] {
    // SAFETY: the array region is identity-mapped, unused RAM past the
    // kernel image; it is claimed via `use_area` right below.
    let base = array_phys.as_raw() as usize as *mut FrameInfo;
    for index in 0..frame_count {
        unsafe {
            base.add(index as usize).write(FrameInfo::new(index));
        }
    }
    unsafe { core::slice::from_raw_parts(base, frame_count as usize) }
}

fn highest_frame(map: &Map) -> u32 {
    let mut highest = 0;
    for extent in map.iter_type(MemoryType::Available) {
        if let Some(end) = extent.end_address() {
            highest = highest.max(end.as_raw() >> PAGE_SHIFT);
        }
    }
    highest
}

/// Initializes the whole memory-management stack. Must run exactly once,
/// with the boot identity mapping still active.
pub fn init(boot_info: &mb2::BootInformation<'_>) {
    static INITIALIZED: AtomicBool = AtomicBool::new(false);
    assert!(!INITIALIZED.swap(true, Ordering::SeqCst));

    let map = translate_memory_map(boot_info);
    let frame_count = highest_frame(&map);
    assert!(frame_count > 0, "no usable memory reported by the loader");

    let kernel_end = arch_paging::kernel_image_end();
    let kernel_end_phys = PhysAddress::from_raw(kernel_end.as_raw() - KERNEL_BASE.as_raw());
    let array_phys = PhysAddress::from_raw(kernel_end_phys.as_raw() + 0x0010_0000)
        .align_up(PAGE_SIZE.as_raw());
    let array_bytes = frame_count * core::mem::size_of::<FrameInfo>() as u32;

    // Phase one: descriptors at their identity-mapped boot location.
    let frames = build_boot_frame_table(array_phys, frame_count);
    frame::mark_available(frames, &map);
    let table = FrameTable::new(frames);
    table.reserve(Frame::from_index(0));
    table.use_interval(PhysAddress::from_raw(0x0010_0000), kernel_end_phys);
    table.use_area(array_phys, array_bytes);

    // Phase two: the real kernel page directory.
    arch_paging::remap_kernel(&table);
    info!("mm: kernel remapped, {frame_count} frames tracked");

    // Phase three: move the descriptor array into kernel virtual space and
    // rebuild the free pools over the new slice.
    let space = MirrorSpace;
    let array_va = kernel_end.align_up(PAGE_SIZE.as_raw());
    let mut offset = 0;
    while offset < array_bytes {
        space
            .map_page(
                Page::new(array_va + Length::from_raw(offset)),
                Frame::new(PhysAddress::from_raw(array_phys.as_raw() + offset)),
                Access::READ | Access::WRITE,
                MapFlags::PRESENT,
                &table,
            )
            .expect("mapping the frame descriptor array failed");
        offset += PAGE_SIZE.as_raw();
    }
    drop(table);
    // SAFETY: the same descriptors, now visible at their kernel-virtual
    // home.
    let frames = unsafe {
        core::slice::from_raw_parts(
            array_va.as_raw() as usize as *const FrameInfo,
            frame_count as usize,
        )
    };
    let table = FrameTable::new(frames);

    // Phase four: the allocator stack proper.
    let regime = MemoryRegime::bootstrap(
        space,
        table,
        BootstrapLayout {
            seed1: SLUB_SEED1.vaddr(),
            seed2: SLUB_SEED2.vaddr(),
            clear_window: CLEAR_WINDOW.vaddr(),
        },
    )
    .expect("memory bootstrap failed");

    arch_paging::clear_userspace();

    REGIME
        .lock()
        .set(regime)
        .unwrap_or_else(|_| panic!("memory manager initialized twice"));
    info!("mm: allocators online");
}

// Exported front ends; the rest of the kernel allocates through these.

pub fn kmalloc(size: u32) -> Option<VirtAddress> {
    with(|regime| regime.kmalloc(size))
}

pub fn kfree(object: VirtAddress) {
    with(|regime| regime.kfree(object))
}

pub fn vmalloc(size: Length, flags: VmallocFlags) -> Option<VirtAddress> {
    with(|regime| regime.vmalloc(size, flags))
}

pub fn vmfree(va: VirtAddress) {
    with(|regime| regime.vmfree(va))
}

pub fn page_alloc(flags: AllocFlags) -> Option<Frame> {
    with(|regime| regime.page_alloc(flags))
}

pub fn page_free(paddr: PhysAddress) {
    with(|regime| regime.page_free(paddr))
}

/// Gives the physical pages of the `.init` sections back to the allocator
/// once boot is done. The pages stay mapped; nothing runs from them again.
pub fn reclaim_init_sections() {
    let (start, end) = arch_paging::init_section();
    with(|regime| {
        let mut va = start.align_down(PAGE_SIZE.as_raw());
        while va < end {
            regime.page_free(PhysAddress::from_raw(va.as_raw() - KERNEL_BASE.as_raw()));
            va += PAGE_SIZE;
        }
    });
    info!("mm: init sections reclaimed");
}
