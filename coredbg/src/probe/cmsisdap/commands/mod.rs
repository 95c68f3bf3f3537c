//! Command/response packet layer of the CMSIS-DAP protocol.
//!
//! Every command is one packet: a one-byte command id followed by the request
//! payload. The response echoes the command id. Packets travel over a HID
//! report (v1) or a bulk endpoint pair (v2).

pub mod general;
pub mod swd;
pub mod swj;
pub mod swo;
pub mod transfer;

use crate::coresight::DapError;
use crate::probe::DebugProbeError;

use std::time::Duration;

/// Errors of the CMSIS-DAP driver.
#[derive(Debug, thiserror::Error)]
pub enum CmsisDapError {
    /// The probe answered with data that does not fit the request.
    #[error("Unexpected answer to command")]
    UnexpectedAnswer,
    /// The probe reported an error status for the command.
    #[error("CMSIS-DAP responded with an error to a {command:?} command")]
    ErrorResponse {
        /// The command that was rejected.
        command: CommandId,
    },
    /// The request payload does not fit into one packet.
    #[error("Too much data provided for command")]
    TooMuchData,
    /// The response ended before the expected payload.
    #[error("Not enough data in response from probe")]
    NotEnoughData,
    /// An error in the USB HID access occurred.
    #[error("Error in the USB HID access")]
    HidApi(#[from] hidapi::HidError),
    /// An error in the USB bulk access occurred.
    #[error("Error in the USB access")]
    Usb(#[from] rusb::Error),
    /// An error with the DAP communication occurred.
    #[error("An error with the DAP communication occurred")]
    Dap(#[from] DapError),
}

impl From<CmsisDapError> for DebugProbeError {
    fn from(error: CmsisDapError) -> Self {
        DebugProbeError::ProbeSpecific(Box::new(error))
    }
}

/// The command ids of the CMSIS-DAP protocol that this driver uses.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandId {
    /// DAP_Info
    Info = 0x00,
    /// DAP_HostStatus
    HostStatus = 0x01,
    /// DAP_Connect
    Connect = 0x02,
    /// DAP_Disconnect
    Disconnect = 0x03,
    /// DAP_TransferConfigure
    TransferConfigure = 0x04,
    /// DAP_Transfer
    Transfer = 0x05,
    /// DAP_TransferBlock
    TransferBlock = 0x06,
    /// DAP_ResetTarget
    ResetTarget = 0x0A,
    /// DAP_SWJ_Pins
    SwjPins = 0x10,
    /// DAP_SWJ_Clock
    SwjClock = 0x11,
    /// DAP_SWJ_Sequence
    SwjSequence = 0x12,
    /// DAP_SWD_Configure
    SwdConfigure = 0x13,
    /// DAP_SWO_Transport
    SwoTransport = 0x17,
    /// DAP_SWO_Mode
    SwoMode = 0x18,
    /// DAP_SWO_Baudrate
    SwoBaudrate = 0x19,
    /// DAP_SWO_Control
    SwoControl = 0x1A,
    /// DAP_SWO_Status
    SwoStatus = 0x1B,
    /// DAP_SWO_Data
    SwoData = 0x1C,
}

/// The generic OK/error status byte most responses carry.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Status {
    /// The command succeeded.
    DapOk = 0x00,
    /// The command failed.
    DapError = 0xFF,
}

impl Status {
    pub(crate) fn from_byte(value: u8) -> Result<Self, CmsisDapError> {
        match value {
            0x00 => Ok(Status::DapOk),
            0xFF => Ok(Status::DapError),
            _ => Err(CmsisDapError::UnexpectedAnswer),
        }
    }
}

/// A request that can be encoded into a command packet.
pub(crate) trait Request {
    const COMMAND_ID: CommandId;

    /// The decoded response type.
    type Response;

    /// Write the request payload into `buffer`, returning the payload length.
    fn to_bytes(&self, buffer: &mut [u8]) -> Result<usize, CmsisDapError>;

    /// Decode the response payload (the command id byte is already stripped).
    fn parse_response(&self, buffer: &[u8]) -> Result<Self::Response, CmsisDapError>;
}

/// A CMSIS-DAP device, either v1 (HID) or v2 (bulk).
pub enum CmsisDapDevice {
    /// CMSIS-DAP v1 over HID. Stores the HID device handle and the report size.
    V1 {
        /// The HID device handle.
        handle: hidapi::HidDevice,
        /// The HID report size in bytes.
        report_size: usize,
    },
    /// CMSIS-DAP v2 over WinUSB/bulk. Stores the device handle, the out/in
    /// endpoint addresses and the maximum packet size.
    V2 {
        /// The claimed USB device handle.
        handle: rusb::DeviceHandle<rusb::Context>,
        /// The bulk OUT endpoint address.
        out_ep: u8,
        /// The bulk IN endpoint address.
        in_ep: u8,
        /// The maximum packet size of the endpoints.
        max_packet_size: usize,
    },
}

impl CmsisDapDevice {
    fn read(&self, buf: &mut [u8]) -> Result<usize, CmsisDapError> {
        match self {
            CmsisDapDevice::V1 { handle, .. } => Ok(handle.read_timeout(buf, 1000)?),
            CmsisDapDevice::V2 { handle, in_ep, .. } => {
                Ok(handle.read_bulk(*in_ep, buf, Duration::from_millis(1000))?)
            }
        }
    }

    fn write(&self, buf: &[u8]) -> Result<usize, CmsisDapError> {
        match self {
            CmsisDapDevice::V1 { handle, .. } => Ok(handle.write(buf)?),
            CmsisDapDevice::V2 { handle, out_ep, .. } => {
                // Skip the first byte, which is only the HID report id.
                Ok(handle.write_bulk(*out_ep, &buf[1..], Duration::from_millis(1000))?)
            }
        }
    }

    /// Discard any stale packets so requests and responses stay in lockstep.
    pub(crate) fn drain(&self) {
        tracing::debug!("Draining probe of any pending data.");

        match self {
            CmsisDapDevice::V1 {
                handle,
                report_size,
            } => loop {
                let mut discard = vec![0u8; report_size + 1];
                match handle.read_timeout(&mut discard, 1) {
                    Ok(n) if n != 0 => continue,
                    _ => break,
                }
            },
            CmsisDapDevice::V2 {
                handle,
                in_ep,
                max_packet_size,
                ..
            } => {
                let timeout = Duration::from_millis(1);
                let mut discard = vec![0u8; *max_packet_size];
                loop {
                    match handle.read_bulk(*in_ep, &mut discard, timeout) {
                        Ok(n) if n != 0 => continue,
                        _ => break,
                    }
                }
            }
        }
    }

    /// The packet size usable for requests on this device.
    pub(crate) fn packet_size(&self) -> usize {
        match self {
            CmsisDapDevice::V1 { report_size, .. } => *report_size,
            CmsisDapDevice::V2 {
                max_packet_size, ..
            } => *max_packet_size,
        }
    }
}

/// Send a command to the device and decode its response.
pub(crate) fn send_command<R: Request>(
    device: &mut CmsisDapDevice,
    request: &R,
) -> Result<R::Response, CmsisDapError> {
    // Size the buffer for the maximum packet size, plus one byte for the HID
    // report id. On v2 the write truncates to the required length.
    let buffer_len = device.packet_size() + 1;
    let mut buffer = vec![0; buffer_len];

    buffer[1] = R::COMMAND_ID as u8;
    let mut size = request.to_bytes(&mut buffer[2..])? + 2;

    // HID devices must always send a full report.
    if let CmsisDapDevice::V1 { report_size, .. } = device {
        size = *report_size + 1;
    }

    device.write(&buffer[..size])?;
    trace_buffer("Transmit buffer", &buffer[..size]);

    device.read(&mut buffer)?;
    trace_buffer("Receive buffer", &buffer[..]);

    if buffer[0] == R::COMMAND_ID as u8 {
        request.parse_response(&buffer[1..])
    } else {
        tracing::warn!(
            "Received invalid response for {:?}: {:02x?}",
            R::COMMAND_ID,
            &buffer[..8.min(buffer.len())]
        );
        Err(CmsisDapError::UnexpectedAnswer)
    }
}

/// Trace log a buffer, cut after the first run of trailing zeros.
///
/// The USB buffers are padded to the full packet size; the padding makes the
/// trace output unreadable, so it is dropped here.
fn trace_buffer(name: &str, buf: &[u8]) {
    if tracing::enabled!(tracing::Level::TRACE) {
        let len = buf.len();
        let cut = len + 1 - buf.iter().rev().position(|&x| x != 0).unwrap_or(len);
        let end = len.min(cut.max(1));
        tracing::trace!("{}: {:02X?}...", name, &buf[..end]);
    }
}
