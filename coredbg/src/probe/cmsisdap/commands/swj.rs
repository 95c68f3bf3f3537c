//! The SWJ pin, clock and sequence commands.

use super::{CmsisDapError, CommandId, Request, Status};

use scroll::{Pwrite, LE};

/// `DAP_SWJ_Clock`: set the maximum SWD/JTAG clock frequency.
#[derive(Debug, Copy, Clone)]
pub struct SwjClockRequest {
    /// The requested frequency in Hz.
    pub clock_speed_hz: u32,
}

/// Response to a [`SwjClockRequest`].
#[derive(Debug)]
pub struct SwjClockResponse {
    /// The command status.
    pub status: Status,
}

impl Request for SwjClockRequest {
    const COMMAND_ID: CommandId = CommandId::SwjClock;

    type Response = SwjClockResponse;

    fn to_bytes(&self, buffer: &mut [u8]) -> Result<usize, CmsisDapError> {
        buffer
            .pwrite_with(self.clock_speed_hz, 0, LE)
            .map_err(|_| CmsisDapError::TooMuchData)?;
        Ok(4)
    }

    fn parse_response(&self, buffer: &[u8]) -> Result<Self::Response, CmsisDapError> {
        Ok(SwjClockResponse {
            status: Status::from_byte(buffer[0])?,
        })
    }
}

/// `DAP_SWJ_Pins`: monitor and control the SWJ pins, including nRESET.
#[derive(Debug, Copy, Clone)]
pub struct SwjPinsRequest {
    /// The pin output values.
    pub output: u8,
    /// Which pins to drive; unselected pins keep their state.
    pub select: u8,
    /// Time to wait for the pins to settle, in microseconds.
    pub wait_us: u32,
}

/// nRESET is bit 7 of the SWJ pin bitmap.
pub const PIN_NRESET: u8 = 1 << 7;

impl SwjPinsRequest {
    /// A request driving or releasing only the nRESET pin.
    pub fn nreset(level_high: bool) -> Self {
        SwjPinsRequest {
            output: if level_high { PIN_NRESET } else { 0 },
            select: PIN_NRESET,
            wait_us: 0,
        }
    }
}

/// Response to a [`SwjPinsRequest`]: the pin input values.
#[derive(Debug)]
pub struct SwjPinsResponse(pub u8);

impl Request for SwjPinsRequest {
    const COMMAND_ID: CommandId = CommandId::SwjPins;

    type Response = SwjPinsResponse;

    fn to_bytes(&self, buffer: &mut [u8]) -> Result<usize, CmsisDapError> {
        buffer[0] = self.output;
        buffer[1] = self.select;
        buffer
            .pwrite_with(self.wait_us, 2, LE)
            .map_err(|_| CmsisDapError::TooMuchData)?;
        Ok(6)
    }

    fn parse_response(&self, buffer: &[u8]) -> Result<Self::Response, CmsisDapError> {
        Ok(SwjPinsResponse(buffer[0]))
    }
}

/// `DAP_SWJ_Sequence`: clock out a raw bit sequence on SWDIO/TMS.
#[derive(Debug)]
pub struct SwjSequenceRequest {
    bit_count: u8,
    data: Vec<u8>,
}

impl SwjSequenceRequest {
    /// A sequence of `bit_count` bits taken LSB-first from `data`.
    pub fn new(bit_count: u8, data: &[u8]) -> Result<Self, CmsisDapError> {
        // 0 encodes 256 bits on the wire.
        let needed = if bit_count == 0 {
            32
        } else {
            bit_count.div_ceil(8) as usize
        };
        if data.len() < needed {
            return Err(CmsisDapError::NotEnoughData);
        }
        Ok(SwjSequenceRequest {
            bit_count,
            data: data[..needed].to_vec(),
        })
    }
}

/// Response to a [`SwjSequenceRequest`].
#[derive(Debug)]
pub struct SwjSequenceResponse(pub Status);

impl Request for SwjSequenceRequest {
    const COMMAND_ID: CommandId = CommandId::SwjSequence;

    type Response = SwjSequenceResponse;

    fn to_bytes(&self, buffer: &mut [u8]) -> Result<usize, CmsisDapError> {
        if buffer.len() < 1 + self.data.len() {
            return Err(CmsisDapError::TooMuchData);
        }
        buffer[0] = self.bit_count;
        buffer[1..1 + self.data.len()].copy_from_slice(&self.data);
        Ok(1 + self.data.len())
    }

    fn parse_response(&self, buffer: &[u8]) -> Result<Self::Response, CmsisDapError> {
        Ok(SwjSequenceResponse(Status::from_byte(buffer[0])?))
    }
}
