//! Kernel entry, called by the boot assembly with the multiboot info
//! pointer after the bootstrap page tables are in place.

use log::info;
use multiboot2 as mb2;

use crate::arch::x86::cpu;
use crate::{logging, mm};

#[no_mangle]
pub extern "C" fn kernel_entry(mbinfo_addr: u32) -> ! {
    logging::init();
    info!("multiboot info at {mbinfo_addr:#010x}");

    let mbinfo = unsafe {
        mb2::BootInformation::load(mbinfo_addr as usize as *const mb2::BootInformationHeader)
    }
    .expect("invalid multiboot information");

    mm::init(&mbinfo);

    // The process subsystem takes over from here; nothing of it is built
    // yet, so reclaim the init sections and idle.
    mm::reclaim_init_sections();
    info!("boot completed");
    loop {
        cpu::halt();
    }
}
