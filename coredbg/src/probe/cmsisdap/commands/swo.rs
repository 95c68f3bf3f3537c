//! The SWO trace capture commands.

use super::{CmsisDapError, CommandId, Request, Status};

use scroll::{Pread, Pwrite, LE};

/// `DAP_SWO_Transport`: how trace data reaches the host.
#[derive(Debug, Copy, Clone)]
pub enum TransportRequest {
    /// No transport; SWO is disabled.
    None,
    /// Trace data is polled with `DAP_SWO_Data` commands.
    DataCommand,
}

/// Response carrying only a status byte.
#[derive(Debug)]
pub struct SwoStatusResponse {
    /// The command status.
    pub status: Status,
}

impl Request for TransportRequest {
    const COMMAND_ID: CommandId = CommandId::SwoTransport;

    type Response = SwoStatusResponse;

    fn to_bytes(&self, buffer: &mut [u8]) -> Result<usize, CmsisDapError> {
        buffer[0] = match self {
            TransportRequest::None => 0,
            TransportRequest::DataCommand => 1,
        };
        Ok(1)
    }

    fn parse_response(&self, buffer: &[u8]) -> Result<Self::Response, CmsisDapError> {
        Ok(SwoStatusResponse {
            status: Status::from_byte(buffer[0])?,
        })
    }
}

/// `DAP_SWO_Mode`: the framing of the SWO signal.
#[derive(Debug, Copy, Clone)]
pub enum ModeRequest {
    /// Turn capture off.
    Off,
    /// UART framing.
    Uart,
    /// Manchester framing.
    Manchester,
}

impl Request for ModeRequest {
    const COMMAND_ID: CommandId = CommandId::SwoMode;

    type Response = SwoStatusResponse;

    fn to_bytes(&self, buffer: &mut [u8]) -> Result<usize, CmsisDapError> {
        buffer[0] = match self {
            ModeRequest::Off => 0,
            ModeRequest::Uart => 1,
            ModeRequest::Manchester => 2,
        };
        Ok(1)
    }

    fn parse_response(&self, buffer: &[u8]) -> Result<Self::Response, CmsisDapError> {
        Ok(SwoStatusResponse {
            status: Status::from_byte(buffer[0])?,
        })
    }
}

/// `DAP_SWO_Baudrate`.
#[derive(Debug, Copy, Clone)]
pub struct BaudrateRequest {
    /// The requested baud rate in Hz.
    pub baudrate: u32,
}

impl Request for BaudrateRequest {
    const COMMAND_ID: CommandId = CommandId::SwoBaudrate;

    // The probe answers with the actual baud rate; 0 means not configured.
    type Response = u32;

    fn to_bytes(&self, buffer: &mut [u8]) -> Result<usize, CmsisDapError> {
        buffer
            .pwrite_with(self.baudrate, 0, LE)
            .map_err(|_| CmsisDapError::TooMuchData)?;
        Ok(4)
    }

    fn parse_response(&self, buffer: &[u8]) -> Result<Self::Response, CmsisDapError> {
        buffer
            .pread_with(0, LE)
            .map_err(|_| CmsisDapError::NotEnoughData)
    }
}

/// `DAP_SWO_Control`: start or stop capture.
#[derive(Debug, Copy, Clone)]
pub enum ControlRequest {
    /// Stop trace capture.
    Stop,
    /// Start trace capture.
    Start,
}

impl Request for ControlRequest {
    const COMMAND_ID: CommandId = CommandId::SwoControl;

    type Response = SwoStatusResponse;

    fn to_bytes(&self, buffer: &mut [u8]) -> Result<usize, CmsisDapError> {
        buffer[0] = match self {
            ControlRequest::Stop => 0,
            ControlRequest::Start => 1,
        };
        Ok(1)
    }

    fn parse_response(&self, buffer: &[u8]) -> Result<Self::Response, CmsisDapError> {
        Ok(SwoStatusResponse {
            status: Status::from_byte(buffer[0])?,
        })
    }
}

/// `DAP_SWO_Data`: fetch captured trace bytes.
#[derive(Debug, Copy, Clone)]
pub struct DataRequest {
    /// The maximum number of bytes the probe may return.
    pub max_count: u16,
}

/// Response to a [`DataRequest`].
#[derive(Debug)]
pub struct DataResponse {
    /// The trace status byte (bit 6: error, bit 7: overrun).
    pub status: u8,
    /// The captured bytes.
    pub data: Vec<u8>,
}

impl DataResponse {
    /// Whether the probe reported a trace stream error.
    pub fn error(&self) -> bool {
        self.status & (1 << 6) != 0
    }
}

impl Request for DataRequest {
    const COMMAND_ID: CommandId = CommandId::SwoData;

    type Response = DataResponse;

    fn to_bytes(&self, buffer: &mut [u8]) -> Result<usize, CmsisDapError> {
        buffer
            .pwrite_with(self.max_count, 0, LE)
            .map_err(|_| CmsisDapError::TooMuchData)?;
        Ok(2)
    }

    fn parse_response(&self, buffer: &[u8]) -> Result<Self::Response, CmsisDapError> {
        if buffer.len() < 3 {
            return Err(CmsisDapError::NotEnoughData);
        }
        let status = buffer[0];
        let count: u16 = buffer.pread_with(1, LE).unwrap();
        let data_start = 3;
        let data_end = data_start + count as usize;
        if buffer.len() < data_end {
            return Err(CmsisDapError::NotEnoughData);
        }
        Ok(DataResponse {
            status,
            data: buffer[data_start..data_end].to_vec(),
        })
    }
}
