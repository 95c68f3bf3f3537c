//! DAP_Info and the general housekeeping commands.

use super::{CmsisDapError, CommandId, Request, Status};

use scroll::{Pread, LE};

/// The capabilities the probe reports through `DAP_INFO` id 0xF0.
#[derive(Debug, Copy, Clone, Default)]
pub struct Capabilities {
    /// SWD is implemented.
    pub swd_implemented: bool,
    /// JTAG is implemented.
    pub jtag_implemented: bool,
    /// SWO capture with UART framing is implemented.
    pub swo_uart_implemented: bool,
    /// SWO capture with Manchester framing is implemented.
    pub swo_manchester_implemented: bool,
    /// Atomic commands are implemented.
    pub atomic_commands_implemented: bool,
}

impl From<u8> for Capabilities {
    fn from(value: u8) -> Self {
        Capabilities {
            swd_implemented: value & 0x01 != 0,
            jtag_implemented: value & 0x02 != 0,
            swo_uart_implemented: value & 0x04 != 0,
            swo_manchester_implemented: value & 0x08 != 0,
            atomic_commands_implemented: value & 0x10 != 0,
        }
    }
}

/// `DAP_Info` with the capabilities id.
pub struct CapabilitiesCommand;

impl Request for CapabilitiesCommand {
    const COMMAND_ID: CommandId = CommandId::Info;

    type Response = Capabilities;

    fn to_bytes(&self, buffer: &mut [u8]) -> Result<usize, CmsisDapError> {
        buffer[0] = 0xF0;
        Ok(1)
    }

    fn parse_response(&self, buffer: &[u8]) -> Result<Self::Response, CmsisDapError> {
        // The info byte count comes first; one or two capability bytes follow.
        if buffer.len() < 2 || buffer[0] == 0 {
            return Err(CmsisDapError::NotEnoughData);
        }
        Ok(Capabilities::from(buffer[1]))
    }
}

/// `DAP_Info` with the maximum packet count id.
pub struct PacketCountCommand;

impl Request for PacketCountCommand {
    const COMMAND_ID: CommandId = CommandId::Info;

    type Response = u8;

    fn to_bytes(&self, buffer: &mut [u8]) -> Result<usize, CmsisDapError> {
        buffer[0] = 0xFE;
        Ok(1)
    }

    fn parse_response(&self, buffer: &[u8]) -> Result<Self::Response, CmsisDapError> {
        if buffer.len() < 2 || buffer[0] != 1 {
            return Err(CmsisDapError::NotEnoughData);
        }
        Ok(buffer[1])
    }
}

/// `DAP_Info` with the maximum packet size id.
pub struct PacketSizeCommand;

impl Request for PacketSizeCommand {
    const COMMAND_ID: CommandId = CommandId::Info;

    type Response = u16;

    fn to_bytes(&self, buffer: &mut [u8]) -> Result<usize, CmsisDapError> {
        buffer[0] = 0xFF;
        Ok(1)
    }

    fn parse_response(&self, buffer: &[u8]) -> Result<Self::Response, CmsisDapError> {
        if buffer.len() < 3 || buffer[0] != 2 {
            return Err(CmsisDapError::NotEnoughData);
        }
        buffer
            .pread_with(1, LE)
            .map_err(|_| CmsisDapError::NotEnoughData)
    }
}

/// `DAP_Info` with the SWO trace buffer size id.
pub struct SwoTraceBufferSizeCommand;

impl Request for SwoTraceBufferSizeCommand {
    const COMMAND_ID: CommandId = CommandId::Info;

    type Response = u32;

    fn to_bytes(&self, buffer: &mut [u8]) -> Result<usize, CmsisDapError> {
        buffer[0] = 0xFD;
        Ok(1)
    }

    fn parse_response(&self, buffer: &[u8]) -> Result<Self::Response, CmsisDapError> {
        if buffer.len() < 5 || buffer[0] != 4 {
            return Err(CmsisDapError::NotEnoughData);
        }
        buffer
            .pread_with(1, LE)
            .map_err(|_| CmsisDapError::NotEnoughData)
    }
}

/// `DAP_Connect`: select the wire protocol and initialize the pins.
#[derive(Debug, Copy, Clone)]
pub enum ConnectRequest {
    /// Use the probe's default port.
    DefaultPort,
    /// Connect in SWD mode.
    Swd,
    /// Connect in JTAG mode.
    Jtag,
}

/// Response to a [`ConnectRequest`].
#[derive(Debug, Copy, Clone)]
pub enum ConnectResponse {
    /// Initialization failed.
    InitFailed,
    /// The probe is connected in SWD mode.
    SuccessfulInitForSwd,
    /// The probe is connected in JTAG mode.
    SuccessfulInitForJtag,
}

impl Request for ConnectRequest {
    const COMMAND_ID: CommandId = CommandId::Connect;

    type Response = ConnectResponse;

    fn to_bytes(&self, buffer: &mut [u8]) -> Result<usize, CmsisDapError> {
        buffer[0] = match self {
            ConnectRequest::DefaultPort => 0,
            ConnectRequest::Swd => 1,
            ConnectRequest::Jtag => 2,
        };
        Ok(1)
    }

    fn parse_response(&self, buffer: &[u8]) -> Result<Self::Response, CmsisDapError> {
        match buffer.first() {
            Some(0) => Ok(ConnectResponse::InitFailed),
            Some(1) => Ok(ConnectResponse::SuccessfulInitForSwd),
            Some(2) => Ok(ConnectResponse::SuccessfulInitForJtag),
            _ => Err(CmsisDapError::UnexpectedAnswer),
        }
    }
}

/// `DAP_Disconnect`.
pub struct DisconnectRequest;

/// Response to a [`DisconnectRequest`].
#[derive(Debug)]
pub struct DisconnectResponse(pub Status);

impl Request for DisconnectRequest {
    const COMMAND_ID: CommandId = CommandId::Disconnect;

    type Response = DisconnectResponse;

    fn to_bytes(&self, _buffer: &mut [u8]) -> Result<usize, CmsisDapError> {
        Ok(0)
    }

    fn parse_response(&self, buffer: &[u8]) -> Result<Self::Response, CmsisDapError> {
        Ok(DisconnectResponse(Status::from_byte(buffer[0])?))
    }
}

/// `DAP_HostStatus`: drive the probe's connected/running LEDs.
#[derive(Debug, Copy, Clone)]
pub struct HostStatusRequest {
    status_type: u8,
    status: bool,
}

impl HostStatusRequest {
    /// Signal whether a debugger is connected.
    pub fn connected(status: bool) -> Self {
        HostStatusRequest {
            status_type: 0,
            status,
        }
    }

    /// Signal whether the target is running.
    pub fn running(status: bool) -> Self {
        HostStatusRequest {
            status_type: 1,
            status,
        }
    }
}

/// Response to a [`HostStatusRequest`].
#[derive(Debug)]
pub struct HostStatusResponse(pub Status);

impl Request for HostStatusRequest {
    const COMMAND_ID: CommandId = CommandId::HostStatus;

    type Response = HostStatusResponse;

    fn to_bytes(&self, buffer: &mut [u8]) -> Result<usize, CmsisDapError> {
        buffer[0] = self.status_type;
        buffer[1] = u8::from(self.status);
        Ok(2)
    }

    fn parse_response(&self, buffer: &[u8]) -> Result<Self::Response, CmsisDapError> {
        Ok(HostStatusResponse(Status::from_byte(buffer[0])?))
    }
}

/// `DAP_ResetTarget`: let the probe run its device-specific reset sequence.
pub struct ResetRequest;

/// Response to a [`ResetRequest`].
#[derive(Debug)]
pub struct ResetResponse {
    /// The command status.
    pub status: Status,
    /// Whether the probe implements a device-specific reset.
    pub executed: bool,
}

impl Request for ResetRequest {
    const COMMAND_ID: CommandId = CommandId::ResetTarget;

    type Response = ResetResponse;

    fn to_bytes(&self, _buffer: &mut [u8]) -> Result<usize, CmsisDapError> {
        Ok(0)
    }

    fn parse_response(&self, buffer: &[u8]) -> Result<Self::Response, CmsisDapError> {
        if buffer.len() < 2 {
            return Err(CmsisDapError::NotEnoughData);
        }
        Ok(ResetResponse {
            status: Status::from_byte(buffer[0])?,
            executed: buffer[1] == 1,
        })
    }
}

#[cfg(test)]
mod test {
    use super::Capabilities;

    #[test]
    fn capabilities_from_info_byte() {
        let caps = Capabilities::from(0x13);
        assert!(caps.swd_implemented);
        assert!(caps.jtag_implemented);
        assert!(!caps.swo_uart_implemented);
        assert!(caps.atomic_commands_implemented);
    }
}
