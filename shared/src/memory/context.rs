//! Per-process memory contexts: a reference-counted page directory.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::memory::addr::VirtAddress;
use crate::memory::page::{KERNEL_BASE, PAGE_SIZE};
use crate::memory::vmalloc::VmallocFlags;
use crate::paging::{descr, raw_slot, AddressSpace};

use super::regime::MemoryRegime;

/// Outcome of the copy-on-write fault hook.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ResolveOutcome {
    /// The mapping was fixed up; retry the access.
    Resolved,
    /// Nothing resolved the fault; the faulting task is in error.
    Unresolved,
}

/// A handle to a memory context descriptor.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Context(VirtAddress);

/// The descriptor behind a [`Context`]; kmalloc-allocated.
#[repr(C, align(16))]
pub(crate) struct MmContext {
    usage: AtomicU32,
    pd: u32,
}

impl<'f, A: AddressSpace> MemoryRegime<'f, A> {
    fn context_at(&self, ctx: Context) -> &MmContext {
        // SAFETY: handles are only minted by `context_allocate` and the
        // descriptor lives until the last `context_drop`.
        let context: &MmContext = unsafe { descr(self.space(), ctx.0) };
        assert!(context.pd != 0);
        assert!(VirtAddress::from_raw(context.pd) >= KERNEL_BASE);
        assert!(VirtAddress::from_raw(context.pd).is_aligned_to(PAGE_SIZE.as_raw()));
        assert!(context.usage.load(Ordering::Relaxed) > 0);
        context
    }

    /// Allocates the descriptor and a mapped page for the directory.
    fn context_allocate(&self) -> Option<Context> {
        let ctx = self.kmalloc(core::mem::size_of::<MmContext>() as u32)?;
        let pd = match self.vmalloc(PAGE_SIZE, VmallocFlags::MAP) {
            Some(pd) => pd,
            None => {
                self.kfree(ctx);
                return None;
            }
        };
        // SAFETY: a freshly allocated slot, exclusively ours.
        unsafe {
            raw_slot::<MmContext, A>(self.space(), ctx).write(MmContext {
                usage: AtomicU32::new(1),
                pd: pd.as_raw(),
            });
        }
        Some(Context(ctx))
    }

    /// Creates a context with an empty user half.
    pub fn context_create(&self) -> Option<Context> {
        let ctx = self.context_allocate()?;
        let pd = VirtAddress::from_raw(self.context_at(ctx).pd);
        self.space().init_user_pd(pd);
        Some(ctx)
    }

    /// Clones a context, staging copy-on-write: both contexts end up sharing
    /// the user page tables read-only.
    pub fn context_clone(&self, ctx: Context) -> Option<Context> {
        let src_pd = VirtAddress::from_raw(self.context_at(ctx).pd);
        let clone = self.context_allocate()?;
        let dst_pd = VirtAddress::from_raw(self.context_at(clone).pd);
        self.space()
            .clone_user_mappings(dst_pd, src_pd, self.frames());
        Some(clone)
    }

    /// Adds a user of the context.
    pub fn context_use(&self, ctx: Context) {
        self.context_at(ctx).usage.fetch_add(1, Ordering::Relaxed);
    }

    /// Loads the context's directory on the CPU.
    pub fn context_set(&self, ctx: Context) {
        let pd = VirtAddress::from_raw(self.context_at(ctx).pd);
        self.space().make_current(pd);
    }

    /// Drops one user; the last drop tears the user space down and releases
    /// the directory and the descriptor. The context must be the one
    /// currently loaded, since the teardown walks the current address space.
    pub fn context_drop(&self, ctx: Context) {
        let context = self.context_at(ctx);
        if context.usage.fetch_sub(1, Ordering::Relaxed) != 1 {
            return;
        }
        let pd = VirtAddress::from_raw(context.pd);
        self.space().drop_user_mappings(self.frames());
        self.space().use_kernel_pd();
        self.vmfree(pd);
        self.kfree(ctx.0);
    }

    /// Copy-on-write resolution hook. The staging installs read-only shared
    /// user page tables; an actual resolver does not exist yet, so every
    /// write fault reports unresolved and write-protected user mappings are
    /// a legitimate steady state.
    pub fn on_write_fault(&self, _va: VirtAddress) -> ResolveOutcome {
        ResolveOutcome::Unresolved
    }

    /// Reference count of a context, for diagnostics and tests.
    pub fn context_usage(&self, ctx: Context) -> u32 {
        self.context_at(ctx).usage.load(Ordering::Relaxed)
    }

    /// The directory page of a context.
    pub fn context_pd(&self, ctx: Context) -> VirtAddress {
        VirtAddress::from_raw(self.context_at(ctx).pd)
    }
}
