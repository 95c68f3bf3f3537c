//! `DAP_SWD_Configure`.

use super::{CmsisDapError, CommandId, Request, Status};

/// `DAP_SWD_Configure` with default turnaround and data phase settings.
#[derive(Debug, Default)]
pub struct ConfigureRequest;

/// Response to a [`ConfigureRequest`].
#[derive(Debug)]
pub struct ConfigureResponse {
    /// The command status.
    pub status: Status,
}

impl Request for ConfigureRequest {
    const COMMAND_ID: CommandId = CommandId::SwdConfigure;

    type Response = ConfigureResponse;

    fn to_bytes(&self, buffer: &mut [u8]) -> Result<usize, CmsisDapError> {
        buffer[0] = 0;
        Ok(1)
    }

    fn parse_response(&self, buffer: &[u8]) -> Result<Self::Response, CmsisDapError> {
        Ok(ConfigureResponse {
            status: Status::from_byte(buffer[0])?,
        })
    }
}
