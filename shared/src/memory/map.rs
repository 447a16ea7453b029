//! The boot-time physical memory map.

use arrayvec::ArrayVec;

use super::addr::PhysExtent;

pub const MAP_MAX_ENTRIES: usize = 128;

/// A map of the machine's physical memory, as handed over by the boot
/// protocol.
#[derive(Clone, Debug)]
pub struct Map {
    entries: ArrayVec<MapEntry, MAP_MAX_ENTRIES>,
}

impl Map {
    /// `src` must be sorted by start address, and the extents must not
    /// overlap.
    pub fn from_entries<T: IntoIterator<Item = MapEntry>>(src: T) -> Map {
        Map {
            entries: src.into_iter().collect(),
        }
    }

    pub fn entries(&self) -> &[MapEntry] {
        &self.entries
    }

    pub fn iter_type(&self, mem_type: MemoryType) -> impl Iterator<Item = PhysExtent> + '_ {
        self.entries
            .iter()
            .filter(move |e| e.mem_type == mem_type)
            .map(|e| e.extent)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct MapEntry {
    pub extent: PhysExtent,
    pub mem_type: MemoryType,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MemoryType {
    /// Available for use
    Available,
    /// Contains ACPI information, but otherwise usable
    Acpi,
    /// Reserved and must be preserved on hibernation
    ReservedPreserveOnHibernation,
    /// Corrupt and unusable
    Defective,
    /// Cannot be used
    Reserved,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_by_type() {
        let map = Map::from_entries([
            MapEntry {
                extent: PhysExtent::from_raw(0, 0x9F000),
                mem_type: MemoryType::Available,
            },
            MapEntry {
                extent: PhysExtent::from_raw(0x9F000, 0x61000),
                mem_type: MemoryType::Reserved,
            },
            MapEntry {
                extent: PhysExtent::from_raw(0x100000, 0x700000),
                mem_type: MemoryType::Available,
            },
        ]);

        let avail: std::vec::Vec<_> = map.iter_type(MemoryType::Available).collect();
        assert_eq!(avail.len(), 2);
        assert_eq!(avail[1].address().as_raw(), 0x100000);
    }
}
