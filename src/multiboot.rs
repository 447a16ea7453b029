//! Multiboot boot-information ingestion.

use multiboot2 as mb2;

use shared::memory::addr::PhysExtent;
use shared::memory::{Map, MapEntry, MemoryType};

/// Translates the boot loader's memory map into the kernel's own `Map`.
/// This is a 32-bit kernel, so entries that do not fit below 4 GiB are
/// discarded entirely.
pub fn translate_memory_map(info: &mb2::BootInformation<'_>) -> Map {
    let tag = info
        .memory_map_tag()
        .expect("multiboot info carries no memory map");
    Map::from_entries(tag.memory_areas().into_iter().filter_map(|area| {
        let start = area.start_address();
        let length = area.size();
        if length == 0 || start > u32::MAX as u64 || length > u32::MAX as u64 {
            return None;
        }
        if start + length - 1 > u32::MAX as u64 {
            return None;
        }
        Some(MapEntry {
            extent: PhysExtent::from_raw(start as u32, length as u32),
            mem_type: match mb2::MemoryAreaType::from(area.typ()) {
                mb2::MemoryAreaType::Available => MemoryType::Available,
                mb2::MemoryAreaType::AcpiAvailable => MemoryType::Acpi,
                mb2::MemoryAreaType::ReservedHibernate => {
                    MemoryType::ReservedPreserveOnHibernation
                }
                mb2::MemoryAreaType::Defective => MemoryType::Defective,
                _ => MemoryType::Reserved,
            },
        })
    }))
}
