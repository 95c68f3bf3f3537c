//! CoreSight ROM table parsing.
//!
//! Components are identified by their CIDR/PIDR register sets in the last 256
//! bytes of their 4 KiB page. Class 0x1 components are ROM tables whose
//! entries point at further components; the walker follows them recursively
//! and tags everything it can identify through the PIDR factory registry.

use super::ArmError;
use crate::memory::MemoryInterface;

/// Offset of the PIDR4..7 word group within a component page.
const PIDR4_OFFSET: u32 = 0xFD0;
/// Offset of the PIDR0..3 word group within a component page.
const PIDR0_OFFSET: u32 = 0xFE0;
/// Offset of the CIDR word group within a component page.
const CIDR0_OFFSET: u32 = 0xFF0;
/// Offset of the DEVTYPE register of class 0x9 components.
const DEVTYPE_OFFSET: u32 = 0xFCC;
/// Offset of the DEVID register of class 0x9 components.
const DEVID_OFFSET: u32 = 0xFC8;

/// Entry limits keep a corrupt table from walking forever.
const MAX_32BIT_ENTRIES: u32 = 960;
const MAX_8BIT_ENTRIES: u32 = 240;

/// An error during ROM table discovery.
#[derive(Debug, thiserror::Error)]
pub enum RomTableError {
    /// The component does not carry the ROM table class.
    #[error("Component at {address:#010x} is not a ROM table (class {class})")]
    NotARomTable {
        /// The component address.
        address: u32,
        /// The component class that was found instead.
        class: u8,
    },
    /// The component identification registers are malformed.
    #[error("The CoreSight component at {address:#010x} could not be identified")]
    ComponentIdentification {
        /// The component address.
        address: u32,
    },
    /// A memory access during discovery failed.
    #[error("Could not access the ROM table")]
    Memory(#[source] Box<ArmError>),
}

impl RomTableError {
    fn memory(error: ArmError) -> Self {
        RomTableError::Memory(Box::new(error))
    }
}

/// The component class, from CIDR bits [15:12].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ComponentClass {
    /// Generic verification component.
    GenericVerification = 0x0,
    /// A class 0x1 ROM table.
    RomTable = 0x1,
    /// A CoreSight component with DEVTYPE/DEVID registers.
    CoreSight = 0x9,
    /// Peripheral test block.
    PeripheralTestBlock = 0xB,
    /// Generic IP component.
    GenericIp = 0xE,
    /// CoreLink, PrimeCell or legacy system component.
    CoreLinkOrPrimeCell = 0xF,
}

impl ComponentClass {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x0 => Some(ComponentClass::GenericVerification),
            0x1 => Some(ComponentClass::RomTable),
            0x9 => Some(ComponentClass::CoreSight),
            0xB => Some(ComponentClass::PeripheralTestBlock),
            0xE => Some(ComponentClass::GenericIp),
            0xF => Some(ComponentClass::CoreLinkOrPrimeCell),
            _ => None,
        }
    }
}

/// The kind of peripheral a component was identified as.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PeripheralType {
    /// The system control space of a Cortex-M CPU.
    Scs,
    /// Flash Patch and Breakpoint unit (or the v6-M breakpoint unit).
    Fpb,
    /// Data Watchpoint and Trace unit.
    Dwt,
    /// Instrumentation Trace Macrocell.
    Itm,
    /// Trace Port Interface Unit.
    Tpiu,
    /// A ROM table.
    Rom,
}

/// The component factory registry: `(PIDR mask, PIDR value, type)`.
///
/// The mask keeps the designer and part fields and drops the revision and
/// modification fields, so one entry covers all revisions of a part.
const COMPONENT_FACTORY: &[(u64, u64, PeripheralType)] = &[
    (0xF_000F_FFFF, 0x4_000B_B000, PeripheralType::Scs), // Cortex-M3 SCS
    (0xF_000F_FFFF, 0x4_000B_B008, PeripheralType::Scs), // Cortex-M0 SCS
    (0xF_000F_FFFF, 0x4_000B_B00C, PeripheralType::Scs), // Cortex-M4 SCS
    (0xF_000F_FFFF, 0x4_000B_B001, PeripheralType::Itm), // Cortex-M3/M4 ITM
    (0xF_000F_FFFF, 0x4_000B_B913, PeripheralType::Itm), // CoreSight ITM
    (0xF_000F_FFFF, 0x4_000B_B002, PeripheralType::Dwt), // Cortex-M3/M4 DWT
    (0xF_000F_FFFF, 0x4_000B_B00A, PeripheralType::Dwt), // Cortex-M0 DWT
    (0xF_000F_FFFF, 0x4_000B_B003, PeripheralType::Fpb), // Cortex-M3/M4 FPB
    (0xF_000F_FFFF, 0x4_000B_B00B, PeripheralType::Fpb), // Cortex-M0 BPU
    (0xF_000F_FFFF, 0x4_000B_B00E, PeripheralType::Fpb), // Cortex-M7 FPB
    (0xF_000F_FFFF, 0x4_000B_B923, PeripheralType::Tpiu), // Cortex-M3 TPIU
    (0xF_000F_FFFF, 0x4_000B_B9A1, PeripheralType::Tpiu), // Cortex-M4 TPIU
    (0xF_000F_FFFF, 0x4_000B_B912, PeripheralType::Tpiu), // CoreSight TPIU
    (0xF_000F_FFFF, 0x4_000B_B471, PeripheralType::Rom), // Cortex-M0 ROM
    (0xF_000F_FFFF, 0x4_000B_B4C0, PeripheralType::Rom), // Cortex-M0+ ROM
    (0xF_000F_FFFF, 0x4_000B_B4C4, PeripheralType::Rom), // Cortex-M4 ROM
];

/// Look a PIDR up in the factory registry.
pub fn identify_peripheral(pidr: u64) -> Option<PeripheralType> {
    COMPONENT_FACTORY
        .iter()
        .find(|(mask, value, _)| pidr & mask == *value)
        .map(|(_, _, peripheral)| *peripheral)
}

/// Identification of one CoreSight component.
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentId {
    /// The 4 KiB aligned top address of the component.
    pub top_address: u32,
    /// The assembled component identification value.
    pub cidr: u32,
    /// The assembled 64 bit peripheral identification value.
    pub pidr: u64,
    /// The component class.
    pub class: ComponentClass,
    /// The number of 4 KiB pages the component occupies.
    pub count_4kb: u32,
    /// DEVTYPE, present on class 0x9 components.
    pub dev_type: Option<u8>,
    /// DEVID, present on class 0x9 components.
    pub dev_id: Option<u32>,
    /// What the factory identified this component as, if anything.
    pub peripheral: Option<PeripheralType>,
}

impl ComponentId {
    /// Read the identification registers of the component at `top_address`.
    pub fn read_from(
        memory: &mut dyn MemoryInterface,
        top_address: u32,
    ) -> Result<ComponentId, RomTableError> {
        let cidr = read_id_register_set(memory, top_address + CIDR0_OFFSET)? as u32;

        let expected = [0x0D, 0x0, 0x05, 0xB1];
        for (i, expected) in expected.iter().enumerate() {
            let actual = (cidr >> (i * 8)) & 0xFF;
            let masked = if i == 1 { actual & 0x0F } else { actual };
            if masked != *expected {
                // Invalid preambles show up on real silicon; identify what
                // can be identified and keep walking.
                tracing::warn!(
                    "Component at {:#010x}: CIDR{} has invalid preamble (expected {:#x}, got {:#x})",
                    top_address,
                    i,
                    expected,
                    actual,
                );
            }
        }

        let class_bits = ((cidr >> 12) & 0xF) as u8;
        let class = ComponentClass::from_u8(class_bits)
            .ok_or(RomTableError::ComponentIdentification {
                address: top_address,
            })?;

        let pidr_high = read_id_register_set(memory, top_address + PIDR4_OFFSET)?;
        let pidr_low = read_id_register_set(memory, top_address + PIDR0_OFFSET)?;
        let pidr = (pidr_high << 32) | pidr_low;

        let count_4kb = 1 << ((pidr >> 36) & 0xF);

        let (dev_type, dev_id) = if class == ComponentClass::CoreSight {
            let dev_type = memory
                .read_word_32(top_address + DEVTYPE_OFFSET)
                .map_err(RomTableError::memory)? as u8;
            let dev_id = memory
                .read_word_32(top_address + DEVID_OFFSET)
                .map_err(RomTableError::memory)?;
            (Some(dev_type), Some(dev_id))
        } else {
            (None, None)
        };

        let peripheral = identify_peripheral(pidr);

        tracing::debug!(
            "Component @ {:#010x}: cidr={:#x}, pidr={:#x}, class={:?}, part={:?}",
            top_address,
            cidr,
            pidr,
            class,
            peripheral,
        );

        Ok(ComponentId {
            top_address,
            cidr,
            pidr,
            class,
            count_4kb,
            dev_type,
            dev_id,
            peripheral,
        })
    }
}

/// Read a four-word identification register group. Only the low byte of each
/// word carries data.
fn read_id_register_set(
    memory: &mut dyn MemoryInterface,
    address: u32,
) -> Result<u64, RomTableError> {
    let mut words = [0u32; 4];
    memory
        .read_32(address, &mut words)
        .map_err(RomTableError::memory)?;

    let mut result = 0u64;
    for (i, word) in words.iter().enumerate() {
        result |= u64::from(word & 0xFF) << (i * 8);
    }
    Ok(result)
}

/// A discovered component: either a nested ROM table or a leaf peripheral.
#[derive(Debug, Clone, PartialEq)]
pub enum Component {
    /// A class 0x1 ROM table and its children.
    Table(ComponentId, RomTable),
    /// Any other component.
    Peripheral(ComponentId),
}

impl Component {
    /// Identify the component at `top_address` and, for ROM tables, walk its
    /// entries.
    pub fn try_parse(
        memory: &mut dyn MemoryInterface,
        top_address: u32,
    ) -> Result<Component, RomTableError> {
        let id = ComponentId::read_from(memory, top_address)?;

        if id.class == ComponentClass::RomTable {
            let table = RomTable::parse(memory, &id)?;
            Ok(Component::Table(id, table))
        } else {
            Ok(Component::Peripheral(id))
        }
    }

    /// The identification of this component.
    pub fn id(&self) -> &ComponentId {
        match self {
            Component::Table(id, _) => id,
            Component::Peripheral(id) => id,
        }
    }

    /// This component and all nested components, depth first.
    pub fn iter(&self) -> Vec<&ComponentId> {
        let mut result = vec![self.id()];
        if let Component::Table(_, table) = self {
            for child in &table.components {
                result.extend(child.iter());
            }
        }
        result
    }

    /// The first component of the given type, searching depth first.
    pub fn find_component(&self, peripheral: PeripheralType) -> Option<&ComponentId> {
        self.iter()
            .into_iter()
            .find(|id| id.peripheral == Some(peripheral))
    }
}

/// A parsed class 0x1 ROM table.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RomTable {
    /// The components behind the present entries, in table order.
    pub components: Vec<Component>,
}

impl RomTable {
    /// Walk the table whose identification is `id`.
    fn parse(
        memory: &mut dyn MemoryInterface,
        id: &ComponentId,
    ) -> Result<RomTable, RomTableError> {
        if id.class != ComponentClass::RomTable {
            return Err(RomTableError::NotARomTable {
                address: id.top_address,
                class: id.class as u8,
            });
        }
        if id.count_4kb != 1 {
            tracing::warn!(
                "ROM table at {:#010x} is larger than 4 KiB ({} pages)",
                id.top_address,
                id.count_4kb
            );
        }

        let base = id.top_address;

        // The first word decides the width of all entries.
        let first = memory.read_word_32(base).map_err(RomTableError::memory)?;
        let entries_are_32bit = first & 0x2 != 0;

        let mut components = Vec::new();
        let max_entries = if entries_are_32bit {
            MAX_32BIT_ENTRIES
        } else {
            MAX_8BIT_ENTRIES
        };

        for index in 0..max_entries {
            let entry = if entries_are_32bit {
                memory
                    .read_word_32(base + index * 4)
                    .map_err(RomTableError::memory)?
            } else {
                // An 8-bit entry is spread over four words, one byte each.
                let entry_base = base + index * 16;
                let mut entry = 0u32;
                for byte in 0..4 {
                    let value = memory
                        .read_word_8(entry_base + byte * 4)
                        .map_err(RomTableError::memory)?;
                    entry |= u32::from(value) << (byte * 8);
                }
                entry
            };

            // A zero entry terminates the table.
            if entry == 0 {
                break;
            }

            let Some(address) = entry_component_address(base, entry) else {
                continue;
            };

            components.push(Component::try_parse(memory, address)?);
        }

        Ok(RomTable { components })
    }
}

/// Decode one ROM table entry: `None` when the present bit is clear,
/// otherwise the component address derived from the sign-extended, 4 KiB
/// shifted offset.
fn entry_component_address(base: u32, entry: u32) -> Option<u32> {
    if entry & 0x1 == 0 {
        return None;
    }

    // Bits [31:12] are a signed offset from the table base; sign extension
    // falls out of the arithmetic shift.
    let offset = (entry & 0xFFFF_F000) as i32;
    Some(base.wrapping_add(offset as u32))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::coresight::dp::DapController;
    use crate::probe::fake_probe::FakeProbe;

    #[test]
    fn entry_decoding() {
        // Present bit clear: skipped.
        assert_eq!(entry_component_address(0xE00F_F000, 0x0000_1002), None);
        // Positive offset.
        assert_eq!(
            entry_component_address(0xE00F_F000, 0x0000_1003),
            Some(0xE010_0000)
        );
        // Negative offset, sign extended from bit 31.
        assert_eq!(
            entry_component_address(0xE00F_F000, 0xFFF0_F003),
            Some(0xE000_E000)
        );
    }

    #[test]
    fn factory_identifies_cortex_m_parts() {
        assert_eq!(identify_peripheral(0x4_000B_B00C), Some(PeripheralType::Scs));
        assert_eq!(identify_peripheral(0x4_000B_B003), Some(PeripheralType::Fpb));
        assert_eq!(identify_peripheral(0x4_000B_B002), Some(PeripheralType::Dwt));
        // Revision fields are ignored.
        assert_eq!(
            identify_peripheral(0x4_123B_B002),
            Some(PeripheralType::Dwt)
        );
        // Unknown parts are unidentified, not an error.
        assert_eq!(identify_peripheral(0x4_000B_BFFF), None);
    }

    /// Lay a component identification page into fake memory.
    fn write_component_ids(handle: &crate::probe::fake_probe::FakeStateHandle, base: u32, class: u8, part: u16) {
        // CIDR preamble with the class in CIDR1.
        let cidr = [0x0D, class << 4, 0x05, 0xB1];
        for (i, byte) in cidr.iter().enumerate() {
            handle.load_memory(base + 0xFF0 + i as u32 * 4, &[*byte, 0, 0, 0]);
        }
        // PIDR for an ARM part: continuation 4, identity 0x3B.
        let pidr: u64 = 0x4_000B_B000 | u64::from(part);
        for i in 0..4 {
            let byte = ((pidr >> (i * 8)) & 0xFF) as u8;
            handle.load_memory(base + 0xFE0 + i * 4, &[byte, 0, 0, 0]);
        }
        for i in 0..4 {
            let byte = ((pidr >> (32 + i * 8)) & 0xFF) as u8;
            handle.load_memory(base + 0xFD0 + i * 4, &[byte, 0, 0, 0]);
        }
    }

    #[test]
    fn walk_nested_rom_table() {
        let probe = FakeProbe::new();
        let handle = probe.state_handle();

        // Root table at 0xE00F_F000 pointing at an SCS and a nested table.
        write_component_ids(&handle, 0xE00F_F000, 0x1, 0x4C4);
        handle.load_memory(0xE00F_F000, &0xFFF0_F003u32.to_le_bytes()); // -> 0xE000_E000
        handle.load_memory(0xE00F_F004, &0x0000_1003u32.to_le_bytes()); // -> 0xE010_0000
        handle.load_memory(0xE00F_F008, &0x0000_2002u32.to_le_bytes()); // present bit clear
        handle.load_memory(0xE00F_F00C, &[0, 0, 0, 0]); // terminator

        // The SCS.
        write_component_ids(&handle, 0xE000_E000, 0xE, 0x00C);

        // The nested table with one DWT entry.
        write_component_ids(&handle, 0xE010_0000, 0x1, 0x4C4);
        handle.load_memory(0xE010_0000, &0xFFF0_1003u32.to_le_bytes()); // -> 0xE000_1000
        handle.load_memory(0xE010_0004, &[0, 0, 0, 0]);
        write_component_ids(&handle, 0xE000_1000, 0xE, 0x002);

        let mut dap = DapController::new(Box::new(probe));
        dap.init().unwrap();
        dap.find_aps().unwrap();
        let mut memory = dap.memory_interface(0).unwrap();

        let component = Component::try_parse(&mut memory, 0xE00F_F000).unwrap();

        let Component::Table(id, table) = &component else {
            panic!("expected a ROM table");
        };
        assert_eq!(id.class, ComponentClass::RomTable);
        // The skipped entry does not show up.
        assert_eq!(table.components.len(), 2);

        let scs = component.find_component(PeripheralType::Scs).unwrap();
        assert_eq!(scs.top_address, 0xE000_E000);

        let dwt = component.find_component(PeripheralType::Dwt).unwrap();
        assert_eq!(dwt.top_address, 0xE000_1000);
    }
}
