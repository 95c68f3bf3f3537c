//! Access port registers and per-AP bookkeeping.

use super::Register;

use bitfield::bitfield;

/// An error while using an access port.
#[derive(Debug, thiserror::Error)]
pub enum AccessPortError {
    /// Reading an AP register failed.
    #[error("Failed to read register {name} at address {address:#04x}")]
    RegisterRead {
        /// The in-port address of the register.
        address: u8,
        /// The name of the register.
        name: &'static str,
        /// The underlying error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// Writing an AP register failed.
    #[error("Failed to write register {name} at address {address:#04x}")]
    RegisterWrite {
        /// The in-port address of the register.
        address: u8,
        /// The name of the register.
        name: &'static str,
        /// The underlying error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// An access beyond the 32 bit address space was requested.
    #[error("Out of bounds access")]
    OutOfBounds,
}

bitfield! {
    /// The identification register of an access port, at address 0xFC.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct Idr(u32);
    impl Debug;
    /// The revision of the AP design.
    pub u8, revision, _: 31, 28;
    /// The JEP106 continuation code of the AP designer.
    pub u8, designer_cc, _: 27, 24;
    /// The JEP106 identity code of the AP designer.
    pub u8, designer_id, _: 23, 17;
    /// The class of the AP.
    pub u8, class, _: 16, 13;
    /// The AP variant.
    pub u8, variant, _: 7, 4;
    /// The AP type.
    pub u8, ap_type, _: 3, 0;
}

impl From<u32> for Idr {
    fn from(raw: u32) -> Self {
        Idr(raw)
    }
}

impl From<Idr> for u32 {
    fn from(raw: Idr) -> Self {
        raw.0
    }
}

impl Register for Idr {
    const ADDRESS: u8 = 0xFC;
    const NAME: &'static str = "IDR";
}

impl Idr {
    /// Whether this AP is a MEM-AP (IDR class 0b1000).
    pub fn is_mem_ap(&self) -> bool {
        self.class() == 0b1000
    }
}

/// The transfer size encoding of the CSW SIZE field.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DataSize {
    /// Byte transfers.
    U8 = 0b000,
    /// Halfword transfers.
    U16 = 0b001,
    /// Word transfers.
    U32 = 0b010,
}

impl DataSize {
    /// The transfer size in bytes.
    pub fn bytes(self) -> u32 {
        match self {
            DataSize::U8 => 1,
            DataSize::U16 => 2,
            DataSize::U32 => 4,
        }
    }
}

/// The auto-increment encoding of the CSW AddrInc field.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AddressIncrement {
    /// TAR stays put between transfers.
    Off = 0b00,
    /// TAR advances by the transfer size after each access.
    Single = 0b01,
    /// Packed transfers.
    Packed = 0b10,
}

bitfield! {
    /// The MEM-AP control/status word, at address 0x00.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct Csw(u32);
    impl Debug;
    /// Debug software access enable.
    pub dbg_sw_enable, set_dbg_sw_enable: 31;
    /// Bus protection signals driven for the access.
    pub u8, prot, set_prot: 30, 24;
    /// Secure privileged debug enabled.
    pub spiden, _: 23;
    /// Access mode.
    pub u8, mode, set_mode: 11, 8;
    /// A transfer is in progress on the bus.
    pub tr_in_prog, _: 7;
    /// The connection to the memory system is enabled.
    pub dev_en, _: 6;
    /// Address auto-increment and packing mode.
    pub u8, addr_inc, set_addr_inc: 5, 4;
    /// The transfer size.
    pub u8, size, set_size: 2, 0;
}

impl Csw {
    /// The CSW value used for ordinary memory accesses.
    ///
    /// The PROT field requests a privileged data access with the debugger as
    /// bus master; the remaining fields carry the requested size and
    /// increment mode.
    pub fn memory_access(size: DataSize, increment: AddressIncrement) -> Csw {
        let mut csw = Csw(0);
        csw.set_prot(0b110_0011);
        csw.set_addr_inc(increment as u8);
        csw.set_size(size as u8);
        csw
    }
}

impl From<u32> for Csw {
    fn from(raw: u32) -> Self {
        Csw(raw)
    }
}

impl From<Csw> for u32 {
    fn from(raw: Csw) -> Self {
        raw.0
    }
}

impl Register for Csw {
    const ADDRESS: u8 = 0x00;
    const NAME: &'static str = "CSW";
}

bitfield! {
    /// The MEM-AP transfer address register, at address 0x04.
    #[derive(Clone, Copy)]
    pub struct Tar(u32);
    impl Debug;
    /// The address of the next transfer.
    pub u32, address, set_address: 31, 0;
}

impl From<u32> for Tar {
    fn from(raw: u32) -> Self {
        Tar(raw)
    }
}

impl From<Tar> for u32 {
    fn from(raw: Tar) -> Self {
        raw.0
    }
}

impl Register for Tar {
    const ADDRESS: u8 = 0x04;
    const NAME: &'static str = "TAR";
}

bitfield! {
    /// The MEM-AP data read/write register, at address 0x0C.
    #[derive(Clone, Copy)]
    pub struct Drw(u32);
    impl Debug;
    /// The transferred data word.
    pub u32, data, set_data: 31, 0;
}

impl From<u32> for Drw {
    fn from(raw: u32) -> Self {
        Drw(raw)
    }
}

impl From<Drw> for u32 {
    fn from(raw: Drw) -> Self {
        raw.0
    }
}

impl Register for Drw {
    const ADDRESS: u8 = 0x0C;
    const NAME: &'static str = "DRW";
}

bitfield! {
    /// The MEM-AP debug base address register, at address 0xF8.
    #[derive(Clone, Copy)]
    pub struct Base(u32);
    impl Debug;
    /// Bits [31:12] of the debug register file address.
    pub u32, baseaddr, _: 31, 12;
    /// The register uses the ADIv5.1 format.
    pub format, _: 1;
    /// A debug register file is present.
    pub entry_present, _: 0;
}

impl From<u32> for Base {
    fn from(raw: u32) -> Self {
        Base(raw)
    }
}

impl From<Base> for u32 {
    fn from(raw: Base) -> Self {
        raw.0
    }
}

impl Register for Base {
    const ADDRESS: u8 = 0xF8;
    const NAME: &'static str = "BASE";
}

/// The auto-increment wrap size per known MEM-AP IDR value.
///
/// Auto-increment only operates on the low address bits; the wrap boundary
/// differs between implementations and is not discoverable, so it is looked
/// up by IDR here.
const IDR_TO_WRAP_SIZE: &[(u32, u32)] = &[
    (0x2477_0011, 0x1000), // AHB-AP on Cortex-M3 and M4
    (0x4477_0001, 0x400),  // AHB-AP on Cortex-M1
    (0x0477_0031, 0x400),  // AHB-AP on Cortex-M0+
    (0x0477_0021, 0x400),  // AHB-AP on Cortex-M0
    (0x6477_0001, 0x400),  // AHB-AP on Cortex-M7
    (0x7477_0001, 0x400),  // AHB-AP on Cortex-M0+ (alternate)
];

/// The default auto-increment wrap size for unknown MEM-APs.
pub const DEFAULT_WRAP_SIZE: u32 = 0x400;

/// One discovered access port.
#[derive(Debug, Clone)]
pub struct AccessPort {
    /// The APSEL value selecting this AP.
    pub apsel: u8,
    /// The identification register snapshot.
    pub idr: Idr,
    /// The debug base address, when the AP exposes a register file.
    pub rom_table_base: Option<u32>,
    /// The auto-increment wrap size in bytes.
    pub wrap_size: u32,
}

impl AccessPort {
    /// Describe an AP from its IDR and BASE snapshots.
    pub fn new(apsel: u8, idr: Idr, base: Base) -> Self {
        let wrap_size = IDR_TO_WRAP_SIZE
            .iter()
            .find(|(idr_value, _)| *idr_value == idr.0)
            .map(|(_, size)| *size)
            .unwrap_or(DEFAULT_WRAP_SIZE);

        // A BASE of all ones means no debug entries; the legacy format
        // (format bit clear) treats the whole value as the address.
        let rom_table_base = if base.0 == 0xFFFF_FFFF {
            None
        } else if !base.format() {
            Some(base.0)
        } else if base.entry_present() {
            Some(base.baseaddr() << 12)
        } else {
            None
        };

        AccessPort {
            apsel,
            idr,
            rom_table_base,
            wrap_size,
        }
    }

    /// Whether a ROM table is reachable through this AP.
    pub fn has_rom_table(&self) -> bool {
        self.rom_table_base.is_some()
    }
}

/// Compose the 28 bit AP register address used by the DP layer:
/// `(APSEL << 24) | (APBANKSEL & 0xF0) | (A[3:2] & 0x0C)`.
pub const fn ap_addr(apsel: u8, address: u8) -> u32 {
    ((apsel as u32) << 24) | (address as u32 & 0xFC)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn csw_memory_access_encoding() {
        let csw = Csw::memory_access(DataSize::U32, AddressIncrement::Single);
        let raw: u32 = csw.into();
        assert_eq!(raw & 0x7, 0b010);
        assert_eq!((raw >> 4) & 0x3, 0b01);

        let csw = Csw::memory_access(DataSize::U8, AddressIncrement::Off);
        let raw: u32 = csw.into();
        assert_eq!(raw & 0x7, 0);
        assert_eq!((raw >> 4) & 0x3, 0);
    }

    #[test]
    fn ap_address_composition() {
        assert_eq!(ap_addr(0, 0x00), 0x0000_0000);
        assert_eq!(ap_addr(0, 0xFC), 0x0000_00FC);
        assert_eq!(ap_addr(2, 0x04), 0x0200_0004);
    }

    #[test]
    fn wrap_size_lookup() {
        let ap = AccessPort::new(0, Idr(0x2477_0011), Base(0xE00F_F003));
        assert_eq!(ap.wrap_size, 0x1000);
        assert_eq!(ap.rom_table_base, Some(0xE00F_F000));

        let ap = AccessPort::new(0, Idr(0x1234_5678), Base(0xFFFF_FFFF));
        assert_eq!(ap.wrap_size, DEFAULT_WRAP_SIZE);
        assert!(!ap.has_rom_table());
    }

    #[test]
    fn mem_ap_idr_class() {
        assert!(Idr(0x2477_0011).is_mem_ap());
        assert!(!Idr(0).is_mem_ap());
    }
}
