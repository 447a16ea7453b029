//! Silicium: a small 32-bit protected-mode kernel for x86.
//!
//! The portable memory-management stack lives in the `shared` crate; this
//! crate wires it to the machine: multiboot ingestion, the self-mirroring
//! page directory, the global memory regime, logging and preemption
//! accounting. The boot assembly and linker script live in the image build,
//! which links against this static library.

#![cfg_attr(not(test), no_std)]

pub mod multiboot;
pub mod preempt;

#[cfg(target_arch = "x86")]
pub mod arch;
#[cfg(all(target_arch = "x86", not(test)))]
mod boot;
#[cfg(target_arch = "x86")]
pub mod logging;
#[cfg(target_arch = "x86")]
pub mod mm;
#[cfg(all(target_arch = "x86", not(test)))]
mod panic;

#[cfg(test)]
mod tests {
    //! Hosted smoke test of the whole boot chain over the simulated
    //! backend, in the same order `mm::init` runs it on hardware.

    use shared::memory::frame::AllocFlags;
    use shared::memory::regime::sim_boot::sim_regime;
    use shared::memory::vmalloc::VmallocFlags;
    use shared::memory::{Length, PAGE_SIZE};

    #[test]
    fn boot_chain_smoke() {
        let regime = sim_regime(2048);

        let frame = regime.page_alloc(AllocFlags::CLEAR).unwrap();
        regime.page_free(frame.start());

        let area = regime
            .vmalloc(Length::from_raw(4 * PAGE_SIZE.as_raw()), VmallocFlags::MAP)
            .unwrap();
        regime.vmfree(area);

        let p = regime.kmalloc(100).unwrap();
        regime.kfree(p);

        let ctx = regime.context_create().unwrap();
        regime.context_set(ctx);
        regime.context_drop(ctx);
    }
}
