//! Debug probe transports.
//!
//! A probe is a USB adapter that translates DP/AP register operations and bulk
//! memory transfers onto the wire. Two backends are provided: the CMSIS-DAP
//! packet protocol ([`cmsisdap`]) and the ST-Link binary command protocol
//! ([`stlink`]). Both expose the same abstract operations through
//! [`RawDapAccess`] and [`DebugProbe`].

pub mod cmsisdap;
pub mod fake_probe;
pub mod stlink;

use crate::coresight::ArmError;

use bitfield::bitfield;

/// The protocol that is to be used by the probe on the wire.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum WireProtocol {
    /// Serial Wire Debug.
    Swd,
    /// JTAG.
    Jtag,
}

impl std::fmt::Display for WireProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireProtocol::Swd => f.write_str("SWD"),
            WireProtocol::Jtag => f.write_str("JTAG"),
        }
    }
}

/// An error of the probe driver or the USB link below it.
#[derive(Debug, thiserror::Error)]
pub enum DebugProbeError {
    /// An error in the USB transport occurred.
    #[error("An error in the USB transport occurred.")]
    Usb(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The probe could not be opened.
    #[error("The probe could not be created: {0}")]
    ProbeCouldNotBeCreated(String),

    /// A USB endpoint required by the driver was not present.
    #[error("A USB endpoint required by the driver was not found.")]
    EndpointNotFound,

    /// Fewer bytes than requested were transferred over USB.
    #[error("Fewer bytes than expected were transferred ({is} of {should}).")]
    NotEnoughBytesRead {
        /// The number of bytes actually transferred.
        is: usize,
        /// The number of bytes that should have been transferred.
        should: usize,
    },

    /// A USB operation exceeded its deadline.
    #[error("The USB operation timed out.")]
    Timeout,

    /// The requested wire protocol is not supported by this probe.
    #[error("The probe does not support the {0} protocol.")]
    UnsupportedProtocol(WireProtocol),

    /// The requested clock frequency is not supported by this probe.
    #[error("The probe cannot run at {0} kHz.")]
    UnsupportedSpeed(u32),

    /// The probe firmware is too old for the requested operation.
    #[error("The firmware on the probe is outdated and must be updated.")]
    ProbeFirmwareOutdated,

    /// The command is not supported by this probe.
    #[error("The command '{command_name}' is not supported by this probe.")]
    CommandNotSupportedByProbe {
        /// The name of the unsupported command.
        command_name: &'static str,
    },

    /// A driver-specific error occurred.
    #[error("An error specific to a probe type occurred.")]
    ProbeSpecific(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Some other error occurred.
    #[error("{0}")]
    Other(String),
}

/// The type of a debug probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugProbeType {
    /// A CMSIS-DAP compatible adapter.
    CmsisDap,
    /// An ST-Link adapter.
    StLink,
}

/// Information about a connected probe, as reported by USB enumeration.
#[derive(Clone)]
pub struct DebugProbeInfo {
    /// A human readable identifier for the probe.
    pub identifier: String,
    /// The USB vendor id.
    pub vendor_id: u16,
    /// The USB product id.
    pub product_id: u16,
    /// The serial number, if the device reports one.
    pub serial_number: Option<String>,
    /// The driver that can open this probe.
    pub probe_type: DebugProbeType,
}

impl std::fmt::Debug for DebugProbeInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (VID: {:04x}, PID: {:04x}, {}{:?})",
            self.identifier,
            self.vendor_id,
            self.product_id,
            self.serial_number
                .as_ref()
                .map_or(String::new(), |v| format!("Serial: {v}, ")),
            self.probe_type
        )
    }
}

impl DebugProbeInfo {
    /// Open the probe this info describes.
    pub fn open(&self) -> Result<Box<dyn DebugProbe>, DebugProbeError> {
        match self.probe_type {
            DebugProbeType::CmsisDap => Ok(Box::new(cmsisdap::CmsisDap::new_from_info(self)?)),
            DebugProbeType::StLink => Ok(Box::new(stlink::StLink::new_from_info(self)?)),
        }
    }
}

/// Enumerate all probes known to any backend.
pub fn list_all_probes() -> Vec<DebugProbeInfo> {
    let mut probes = cmsisdap::tools::list_cmsisdap_devices();
    probes.extend(stlink::tools::list_stlink_devices());
    probes
}

bitfield! {
    /// The capability bitmask of a probe.
    #[derive(Copy, Clone, Default, PartialEq, Eq)]
    pub struct ProbeCapabilities(u32);
    impl Debug;
    /// The probe can drive SWD.
    pub swd, set_swd: 0;
    /// The probe can drive JTAG.
    pub jtag, set_jtag: 1;
    /// The probe can capture SWO in UART framing.
    pub swo_uart, set_swo_uart: 2;
    /// The probe can capture SWO in Manchester framing.
    pub swo_manchester, set_swo_manchester: 3;
    /// The probe supports banked DP register access.
    pub banked_dp_registers, set_banked_dp_registers: 4;
}

/// Addresses a DP or AP register for a raw probe transfer.
///
/// For AP registers the full in-port address (`APBANKSEL << 4 | A[3:2]`) is
/// carried alongside the APSEL value. Drivers that manage the SELECT register
/// themselves (ST-Link) consume both; drivers that rely on the caller having
/// written SELECT (CMSIS-DAP) only use the low address bits.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RegisterAddress {
    /// A register of the debug port.
    Dp(u8),
    /// A register of an access port.
    Ap {
        /// The APSEL value selecting the access port.
        apsel: u8,
        /// The address of the register within the AP (0x00..=0xFC).
        address: u8,
    },
}

impl RegisterAddress {
    /// Whether this addresses an AP (as opposed to DP) register.
    pub fn is_ap(&self) -> bool {
        matches!(self, RegisterAddress::Ap { .. })
    }

    /// The in-port register address.
    pub fn address(&self) -> u8 {
        match self {
            RegisterAddress::Dp(address) => *address,
            RegisterAddress::Ap { address, .. } => *address,
        }
    }

    /// The A[3:2] lane bits of the address, as they appear on the wire.
    pub fn a2_and_3(&self) -> u8 {
        self.address() & 0x0C
    }
}

/// A handle for a read that has been issued but whose value has not been
/// demanded yet.
///
/// The handle indexes a slot in the probe's pending-response buffer. It must
/// be consumed by [`RawDapAccess::resolve_deferred`]; results are delivered in
/// issue order. Dropping a handle without resolving it discards the value.
#[derive(Debug)]
#[must_use = "a deferred read does nothing until it is resolved"]
pub struct DeferredResult {
    pub(crate) slot: usize,
}

/// Low-level DAP register access, implemented by every probe driver.
///
/// Writes retire in issue order before any subsequent read completes, and
/// deferred reads resolve in issue order. A driver may coalesce deferred
/// operations into a single USB transaction; [`RawDapAccess::raw_flush`]
/// forces everything out and re-raises any buffered error.
pub trait RawDapAccess {
    /// Read a DP or AP register, blocking until the value is available.
    fn raw_read_register(&mut self, address: RegisterAddress) -> Result<u32, ArmError> {
        let deferred = self.raw_read_register_deferred(address)?;
        self.resolve_deferred(deferred)
    }

    /// Issue a DP or AP register read without demanding the value yet.
    fn raw_read_register_deferred(
        &mut self,
        address: RegisterAddress,
    ) -> Result<DeferredResult, ArmError>;

    /// Demand the value of a previously issued deferred read.
    fn resolve_deferred(&mut self, deferred: DeferredResult) -> Result<u32, ArmError>;

    /// Write a DP or AP register.
    fn raw_write_register(&mut self, address: RegisterAddress, value: u32) -> Result<(), ArmError>;

    /// Read `values.len()` words from the same register using a block transfer.
    fn raw_read_block(
        &mut self,
        address: RegisterAddress,
        values: &mut [u32],
    ) -> Result<(), ArmError>;

    /// Write `values` to the same register using a block transfer.
    fn raw_write_block(&mut self, address: RegisterAddress, values: &[u32]) -> Result<(), ArmError>;

    /// Force all pending transport operations to complete.
    fn raw_flush(&mut self) -> Result<(), ArmError>;
}

/// The operations every debug probe offers, besides raw DAP access.
pub trait DebugProbe: RawDapAccess + Send + std::fmt::Debug {
    /// A human readable name for the probe.
    fn name(&self) -> &str;

    /// The capability bitmask of this probe.
    fn capabilities(&self) -> ProbeCapabilities;

    /// The currently configured wire clock in kHz.
    fn speed_khz(&self) -> u32;

    /// Request a wire clock frequency; returns the frequency actually set.
    fn set_speed(&mut self, speed_khz: u32) -> Result<u32, DebugProbeError>;

    /// Connect to the target with the given protocol (or the probe default).
    fn attach(&mut self, protocol: Option<WireProtocol>)
        -> Result<WireProtocol, DebugProbeError>;

    /// Leave debug mode.
    fn detach(&mut self) -> Result<(), DebugProbeError>;

    /// The protocol active on the wire, if connected.
    fn active_protocol(&self) -> Option<WireProtocol>;

    /// Clock out a raw bit sequence on SWDIO/TMS, LSB first.
    ///
    /// Used for line resets and the JTAG-to-SWD switch sequence before the
    /// debug port answers register traffic. Probes whose firmware runs these
    /// sequences itself (ST-Link) report the command as unsupported.
    fn swj_sequence(&mut self, _bit_len: u8, _bits: u64) -> Result<(), DebugProbeError> {
        Err(DebugProbeError::CommandNotSupportedByProbe {
            command_name: "swj_sequence",
        })
    }

    /// Drive or release the nRESET line.
    fn assert_reset(&mut self, assert: bool) -> Result<(), DebugProbeError>;

    /// Whether the probe currently drives nRESET low.
    fn is_reset_asserted(&self) -> bool;

    /// Read the target supply voltage in volts, if the probe can measure it.
    fn target_voltage(&mut self) -> Result<Option<f32>, DebugProbeError> {
        Ok(None)
    }

    /// Whether the probe firmware implements its own memory transfer
    /// commands.
    ///
    /// When this returns `true` the memory engine routes block transfers
    /// through [`DebugProbe::read_memory_native`] /
    /// [`DebugProbe::write_memory_native`] instead of driving TAR/DRW
    /// register by register.
    fn has_native_memory_access(&self) -> bool {
        false
    }

    /// Read memory through the probe's own memory commands.
    ///
    /// `width` is the access width in bits (8, 16 or 32); `address` and
    /// `data.len()` must be aligned to it.
    fn read_memory_native(
        &mut self,
        _apsel: u8,
        _address: u32,
        _data: &mut [u8],
        _width: usize,
    ) -> Result<(), ArmError> {
        Err(DebugProbeError::CommandNotSupportedByProbe {
            command_name: "read_memory_native",
        }
        .into())
    }

    /// Write memory through the probe's own memory commands.
    fn write_memory_native(
        &mut self,
        _apsel: u8,
        _address: u32,
        _data: &[u8],
        _width: usize,
    ) -> Result<(), ArmError> {
        Err(DebugProbeError::CommandNotSupportedByProbe {
            command_name: "write_memory_native",
        }
        .into())
    }
}

/// A command buffered by a batching probe driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BatchCommand {
    /// Read from the given register.
    Read(RegisterAddress),
    /// Write the value to the given register.
    Write(RegisterAddress, u32),
}

impl std::fmt::Display for BatchCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BatchCommand::Read(addr) => write!(f, "Read({addr:?})"),
            BatchCommand::Write(addr, value) => write!(f, "Write({addr:?}, {value:#010x})"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::RegisterAddress;

    #[test]
    fn ap_address_lane_bits() {
        let addr = RegisterAddress::Ap {
            apsel: 0,
            address: 0xFC,
        };
        assert_eq!(addr.a2_and_3(), 0x0C);
        assert!(addr.is_ap());

        let addr = RegisterAddress::Dp(0x8);
        assert_eq!(addr.a2_and_3(), 0x08);
        assert!(!addr.is_ap());
    }
}
