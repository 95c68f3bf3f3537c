//! Board description: the memory map consulted by the breakpoint manager.

use std::ops::Range;

/// What kind of memory a region is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryRegionKind {
    /// Flash memory, programmable in sectors.
    Flash {
        /// The erase sector size in bytes, a power of two.
        sector_size: u32,
    },
    /// Plain RAM.
    Ram,
    /// Memory-mapped peripherals.
    Device,
}

/// One region of the target address space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRegion {
    /// A name for diagnostics.
    pub name: &'static str,
    /// The address range the region covers.
    pub range: Range<u32>,
    /// What kind of memory this is.
    pub kind: MemoryRegionKind,
    /// Whether the core boots from this region (its base holds the vector
    /// table after reset).
    pub is_boot_memory: bool,
}

impl MemoryRegion {
    /// Whether the region is flash.
    pub fn is_flash(&self) -> bool {
        matches!(self.kind, MemoryRegionKind::Flash { .. })
    }

    /// Whether the region is RAM.
    pub fn is_ram(&self) -> bool {
        self.kind == MemoryRegionKind::Ram
    }
}

/// The memory map of a target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryMap {
    regions: Vec<MemoryRegion>,
}

impl MemoryMap {
    /// A map from a list of regions.
    pub fn new(regions: Vec<MemoryRegion>) -> Self {
        MemoryMap { regions }
    }

    /// The region containing `address`, if any.
    pub fn region_for_address(&self, address: u32) -> Option<&MemoryRegion> {
        self.regions.iter().find(|r| r.range.contains(&address))
    }

    /// The region the core boots from, if the map declares one.
    pub fn boot_memory(&self) -> Option<&MemoryRegion> {
        self.regions.iter().find(|r| r.is_boot_memory)
    }

    /// All regions of the map.
    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }
}

/// A board: a name and the memory map of the target soldered onto it.
#[derive(Debug, Clone)]
pub struct Board {
    /// The board name.
    pub name: String,
    /// The memory map of the target.
    pub memory_map: MemoryMap,
}

impl Board {
    /// A generic Cortex-M board: flash at the bottom of the code region,
    /// RAM at 0x2000_0000.
    pub fn generic() -> Self {
        Board {
            name: "generic".to_string(),
            memory_map: MemoryMap::new(vec![
                MemoryRegion {
                    name: "flash",
                    range: 0x0000_0000..0x0010_0000,
                    kind: MemoryRegionKind::Flash {
                        sector_size: 0x400,
                    },
                    is_boot_memory: true,
                },
                MemoryRegion {
                    name: "ram",
                    range: 0x2000_0000..0x2010_0000,
                    kind: MemoryRegionKind::Ram,
                    is_boot_memory: false,
                },
            ]),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn region_lookup() {
        let board = Board::generic();
        let map = &board.memory_map;

        assert!(map.region_for_address(0x0000_1000).unwrap().is_flash());
        assert!(map.region_for_address(0x2000_0000).unwrap().is_ram());
        assert!(map.region_for_address(0x4000_0000).is_none());
        assert_eq!(map.boot_memory().unwrap().range.start, 0);
    }
}
