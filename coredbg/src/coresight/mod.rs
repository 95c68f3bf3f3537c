//! ADIv5 debug and access port plumbing.
//!
//! Everything between the raw probe transport and the Cortex-M core services
//! lives here: the DP register layer with its SELECT/CSW caching
//! ([`DapController`]), the MEM-AP memory engine ([`ApMemory`]), the CoreSight
//! ROM table walker and the discoverable components (FPB, DWT, ITM, TPIU).

pub mod ap;
pub mod component;
pub mod dp;
pub mod memory;
pub mod romtable;

pub use ap::{AccessPort, AccessPortError};
pub use dp::DapController;
pub use memory::ApMemory;
pub use romtable::{Component, ComponentId, PeripheralType, RomTable, RomTableError};

use crate::probe::DebugProbeError;

/// A register of the debug or access port, created from and convertible into
/// its raw `u32` form.
pub trait Register: Clone + From<u32> + Into<u32> + Sized + std::fmt::Debug {
    /// The offset of the register within its bank.
    const ADDRESS: u8;
    /// The name of the register, for diagnostics.
    const NAME: &'static str;
}

/// An error in the communication with an access port or debug port.
///
/// These correspond one to one to the ACK lanes of the wire protocol; they
/// carry no target address because the probe does not know one. Faults that
/// can be attributed to an address are reported as
/// [`ArmError::TransferFault`] by the layer that knows the address.
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum DapError {
    /// A protocol error occurred in the SWD communication between probe and device.
    #[error("An error occurred in the SWD communication between probe and device.")]
    SwdProtocol,
    /// The target device did not respond to the request.
    #[error("Target device did not respond to request.")]
    NoAcknowledge,
    /// The target device responded with a FAULT response to the request.
    #[error("Target device responded with a FAULT response to the request.")]
    FaultResponse,
    /// The target device responded with a WAIT response to the request.
    #[error("Target device responded with a WAIT response to the request.")]
    WaitResponse,
    /// WAIT retries were exhausted without the target accepting the transfer.
    #[error("Target device kept responding with WAIT until the retry limit was reached.")]
    WaitTimeout,
    /// The parity bit on the read request was incorrect.
    #[error("Incorrect parity on READ request.")]
    IncorrectParity,
}

/// ARM-specific errors, raised anywhere between the probe transport and the
/// core services.
#[derive(Debug, thiserror::Error)]
pub enum ArmError {
    /// A timeout occurred during an operation.
    #[error("A timeout occurred during the operation.")]
    Timeout,

    /// The core has to be halted for the operation, but was not.
    #[error("The core needs to be halted for this operation, but was not.")]
    CoreNotHalted,

    /// A transfer FAULT that could be attributed to a target address.
    ///
    /// `length` is the number of bytes of the access that did not complete.
    #[error("Memory transfer fault at address {address:#010x} ({length} bytes outstanding)")]
    TransferFault {
        /// The address of the failing access within the block.
        address: u32,
        /// The number of bytes that remained untransferred.
        length: u32,
    },

    /// An error occurred in the communication with an access port or debug port.
    #[error("An error occurred in the communication with an access port or debug port.")]
    Dap(#[from] DapError),

    /// The debug probe encountered an error.
    #[error("The debug probe encountered an error.")]
    Probe(#[from] DebugProbeError),

    /// An error occurred while using an access port.
    #[error("An error occurred while using an access port.")]
    AccessPort(#[from] AccessPortError),

    /// An error occurred while parsing a ROM table.
    #[error("An error occurred while parsing a ROM table.")]
    RomTable(#[source] RomTableError),

    /// An access was not aligned as the operation requires.
    #[error("Failed to access address {address:#010x} as it is not aligned to {alignment} bytes.")]
    MemoryNotAligned {
        /// The requested address.
        address: u32,
        /// The required alignment in bytes.
        alignment: usize,
    },

    /// A hardware breakpoint was requested outside the range the FPB can match.
    #[error(
        "Unable to create a hardware breakpoint at address {0:#010x}. \
         Hardware breakpoints are only supported at addresses < 0x2000_0000."
    )]
    UnsupportedBreakpointAddress(u32),

    /// The requested memory transfer width is not supported.
    #[error("{0} bit is not a supported memory transfer width.")]
    UnsupportedTransferWidth(usize),

    /// The AP with the given APSEL does not exist.
    #[error("The access port with APSEL {0} does not exist.")]
    ApDoesNotExist(u8),

    /// A register transfer through DCRSR did not complete.
    #[error("The core register transfer did not complete (S_REGRDY never set).")]
    RegisterTransferTimeout,

    /// Another ARM error occurred.
    #[error("{0}")]
    Other(String),
}

impl From<RomTableError> for ArmError {
    fn from(value: RomTableError) -> Self {
        match value {
            RomTableError::Memory(err) => *err,
            other => ArmError::RomTable(other),
        }
    }
}

impl ArmError {
    /// Shorthand for [`ArmError::MemoryNotAligned`].
    pub fn alignment_error(address: u32, alignment: usize) -> Self {
        ArmError::MemoryNotAligned { address, alignment }
    }
}
