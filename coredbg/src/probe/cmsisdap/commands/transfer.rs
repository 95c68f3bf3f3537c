//! `DAP_Transfer`, `DAP_TransferBlock` and `DAP_TransferConfigure`.

use super::{CmsisDapError, CommandId, Request, Status};
use crate::probe::RegisterAddress;

use scroll::{Pread, Pwrite, LE};

/// The read/write direction of a transfer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Rw {
    /// Write register.
    W = 0,
    /// Read register.
    R = 1,
}

/// The 3-bit ACK of a transfer, as reported in the response status byte.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Ack {
    /// OK (for SWD), OK or FAULT (for JTAG).
    Ok = 1,
    /// The target asked the host to retry later.
    Wait = 2,
    /// The target signalled a fault.
    Fault = 4,
    /// The target did not answer at all.
    NoAck = 7,
}

impl Ack {
    fn from_bits(bits: u8) -> Ack {
        match bits & 0x7 {
            1 => Ack::Ok,
            2 => Ack::Wait,
            4 => Ack::Fault,
            _ => Ack::NoAck,
        }
    }
}

/// One register operation within a `DAP_Transfer` packet.
#[derive(Clone, Debug)]
struct InnerTransferRequest {
    ap_n_dp: bool,
    rw: Rw,
    a2: bool,
    a3: bool,
    /// The data word; present for writes only.
    data: Option<u32>,
}

impl InnerTransferRequest {
    fn new(address: RegisterAddress, rw: Rw, data: Option<u32>) -> Self {
        let a23 = address.a2_and_3();
        Self {
            ap_n_dp: address.is_ap(),
            rw,
            a2: (a23 >> 2) & 1 == 1,
            a3: (a23 >> 3) & 1 == 1,
            data,
        }
    }

    fn to_bytes(&self, buffer: &mut [u8]) -> Result<usize, CmsisDapError> {
        buffer[0] = (self.ap_n_dp as u8)
            | (self.rw as u8) << 1
            | u8::from(self.a2) << 2
            | u8::from(self.a3) << 3;
        if let Some(data) = self.data {
            buffer[1..5].copy_from_slice(&data.to_le_bytes());
            Ok(5)
        } else {
            Ok(1)
        }
    }
}

/// The status of the last executed transfer of a packet.
#[derive(Debug)]
pub struct LastTransferResponse {
    /// The ACK lane of the last transfer.
    pub ack: Ack,
    /// A protocol error occurred on the wire.
    pub protocol_error: bool,
}

/// Decoded `DAP_Transfer` response.
#[derive(Debug)]
pub struct TransferResponse {
    /// Status of the last transfer that was attempted.
    pub last_transfer_response: LastTransferResponse,
    /// The read values, in issue order. Writes contribute no entry.
    pub read_values: Vec<u32>,
    /// How many transfers the probe executed.
    pub transfer_count: usize,
}

/// `DAP_Transfer`: a sequence of single register reads and writes.
///
/// The response data is in request order but may be shorter if a transfer
/// failed; the data phase is aborted on a protocol error, FAULT, exhausted
/// WAIT retries or missing ACK.
#[derive(Debug, Default)]
pub struct TransferRequest {
    transfers: Vec<InnerTransferRequest>,
}

impl TransferRequest {
    /// An empty request to be filled with [`TransferRequest::add_read`] /
    /// [`TransferRequest::add_write`].
    pub fn empty() -> Self {
        Self::default()
    }

    /// A request holding a single read.
    pub fn read(address: RegisterAddress) -> Self {
        let mut req = Self::empty();
        req.add_read(address);
        req
    }

    /// A request holding a single write.
    pub fn write(address: RegisterAddress, data: u32) -> Self {
        let mut req = Self::empty();
        req.add_write(address, data);
        req
    }

    /// Append a register read.
    pub fn add_read(&mut self, address: RegisterAddress) {
        self.transfers
            .push(InnerTransferRequest::new(address, Rw::R, None));
    }

    /// Append a register write.
    pub fn add_write(&mut self, address: RegisterAddress, data: u32) {
        self.transfers
            .push(InnerTransferRequest::new(address, Rw::W, Some(data)));
    }

    /// The number of queued transfers.
    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    /// Whether no transfers are queued.
    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }
}

impl Request for TransferRequest {
    const COMMAND_ID: CommandId = CommandId::Transfer;

    type Response = TransferResponse;

    fn to_bytes(&self, buffer: &mut [u8]) -> Result<usize, CmsisDapError> {
        // DAP index; only meaningful for JTAG chains.
        buffer[0] = 0;
        buffer[1] = self.transfers.len() as u8;
        let mut size = 2;
        for transfer in &self.transfers {
            size += transfer.to_bytes(&mut buffer[size..])?;
        }
        Ok(size)
    }

    fn parse_response(&self, buffer: &[u8]) -> Result<Self::Response, CmsisDapError> {
        if buffer.len() < 2 {
            return Err(CmsisDapError::NotEnoughData);
        }
        let transfer_count = buffer[0] as usize;
        if transfer_count > self.transfers.len() {
            tracing::error!("Transfer count larger than requested number of transfers");
            return Err(CmsisDapError::UnexpectedAnswer);
        }

        let last_transfer_response = LastTransferResponse {
            ack: Ack::from_bits(buffer[1]),
            protocol_error: buffer[1] & 0x8 != 0,
        };

        // Read data is only present for executed reads; transfers after the
        // failing one produced nothing.
        let mut read_values = Vec::new();
        let mut offset = 2;
        for (i, req) in self.transfers[..transfer_count].iter().enumerate() {
            let executed_ok = i + 1 < transfer_count || last_transfer_response.ack == Ack::Ok;
            if req.rw == Rw::R && executed_ok {
                if buffer.len() < offset + 4 {
                    return Err(CmsisDapError::NotEnoughData);
                }
                read_values.push(buffer.pread_with(offset, LE).unwrap());
                offset += 4;
            }
        }

        Ok(TransferResponse {
            last_transfer_response,
            read_values,
            transfer_count,
        })
    }
}

/// `DAP_TransferBlock`: repeated transfers to a single register.
#[derive(Debug)]
pub struct TransferBlockRequest {
    transfer_count: u16,
    request_byte: u8,
    transfer_data: Vec<u32>,
    read: bool,
}

impl TransferBlockRequest {
    /// A block write of `data` to one register.
    pub fn write_request(address: RegisterAddress, data: Vec<u32>) -> Self {
        TransferBlockRequest {
            transfer_count: data.len() as u16,
            request_byte: Self::request_byte(address, Rw::W),
            transfer_data: data,
            read: false,
        }
    }

    /// A block read of `read_count` words from one register.
    pub fn read_request(address: RegisterAddress, read_count: u16) -> Self {
        TransferBlockRequest {
            transfer_count: read_count,
            request_byte: Self::request_byte(address, Rw::R),
            transfer_data: Vec::new(),
            read: true,
        }
    }

    fn request_byte(address: RegisterAddress, rw: Rw) -> u8 {
        (address.is_ap() as u8) | (rw as u8) << 1 | (address.a2_and_3() & 0x0C)
    }
}

/// Decoded `DAP_TransferBlock` response.
#[derive(Debug)]
pub struct TransferBlockResponse {
    /// The number of transfers the probe executed.
    pub transfer_count: u16,
    /// The ACK of the last transfer, plus the protocol error bit.
    pub transfer_response: u8,
    /// The read data for block reads.
    pub transfer_data: Vec<u32>,
}

impl TransferBlockResponse {
    /// The decoded ACK lane.
    pub fn ack(&self) -> Ack {
        Ack::from_bits(self.transfer_response)
    }
}

impl Request for TransferBlockRequest {
    const COMMAND_ID: CommandId = CommandId::TransferBlock;

    type Response = TransferBlockResponse;

    fn to_bytes(&self, buffer: &mut [u8]) -> Result<usize, CmsisDapError> {
        buffer[0] = 0;
        buffer
            .pwrite_with(self.transfer_count, 1, LE)
            .map_err(|_| CmsisDapError::TooMuchData)?;
        buffer[3] = self.request_byte;

        let mut size = 4;
        for word in &self.transfer_data {
            buffer
                .pwrite_with(word, size, LE)
                .map_err(|_| CmsisDapError::TooMuchData)?;
            size += 4;
        }
        Ok(size)
    }

    fn parse_response(&self, buffer: &[u8]) -> Result<Self::Response, CmsisDapError> {
        if buffer.len() < 3 {
            return Err(CmsisDapError::NotEnoughData);
        }
        let transfer_count: u16 = buffer.pread_with(0, LE).unwrap();
        let transfer_response = buffer[2];

        let mut data = Vec::with_capacity(transfer_count as usize);
        if self.read {
            for i in 0..transfer_count as usize {
                data.push(
                    buffer
                        .pread_with(3 + i * 4, LE)
                        .map_err(|_| CmsisDapError::NotEnoughData)?,
                );
            }
        }

        Ok(TransferBlockResponse {
            transfer_count,
            transfer_response,
            transfer_data: data,
        })
    }
}

/// `DAP_TransferConfigure`: idle cycles plus WAIT and match retry limits.
#[derive(Debug, Copy, Clone)]
pub struct ConfigureRequest {
    /// Idle cycles clocked after each transfer.
    pub idle_cycles: u8,
    /// How often a WAIT response is retried inside the probe.
    pub wait_retry: u16,
    /// How often a read with value match is retried.
    pub match_retry: u16,
}

/// Response to a [`ConfigureRequest`].
#[derive(Debug)]
pub struct ConfigureResponse {
    /// The command status.
    pub status: Status,
}

impl Request for ConfigureRequest {
    const COMMAND_ID: CommandId = CommandId::TransferConfigure;

    type Response = ConfigureResponse;

    fn to_bytes(&self, buffer: &mut [u8]) -> Result<usize, CmsisDapError> {
        buffer[0] = self.idle_cycles;
        buffer
            .pwrite_with(self.wait_retry, 1, LE)
            .map_err(|_| CmsisDapError::TooMuchData)?;
        buffer
            .pwrite_with(self.match_retry, 3, LE)
            .map_err(|_| CmsisDapError::TooMuchData)?;
        Ok(5)
    }

    fn parse_response(&self, buffer: &[u8]) -> Result<Self::Response, CmsisDapError> {
        Ok(ConfigureResponse {
            status: Status::from_byte(buffer[0])?,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::probe::RegisterAddress;

    #[test]
    fn inner_transfer_request_encodes_lane_bits() {
        // SELECT is DP register 0x8, so A3 is set and A2 is clear.
        let req = InnerTransferRequest::new(RegisterAddress::Dp(0x8), Rw::W, None);
        assert!(req.a3);
        assert!(!req.a2);
        assert!(!req.ap_n_dp);
    }

    #[test]
    fn transfer_request_round_trip() {
        let mut request = TransferRequest::empty();
        request.add_write(RegisterAddress::Dp(0x8), 0xdead_beef);
        request.add_read(RegisterAddress::Ap {
            apsel: 0,
            address: 0x0C,
        });

        let mut buffer = [0u8; 32];
        let len = request.to_bytes(&mut buffer).unwrap();
        // header (2) + write (5) + read (1)
        assert_eq!(len, 8);
        assert_eq!(buffer[1], 2);
        // Write to DP 0x8: APnDP=0, RnW=0, A2=0, A3=1.
        assert_eq!(buffer[2], 0b1000);
        assert_eq!(&buffer[3..7], &0xdead_beefu32.to_le_bytes());
        // Read from AP 0xC: APnDP=1, RnW=1, A2=1, A3=1.
        assert_eq!(buffer[7], 0b1111);
    }

    #[test]
    fn transfer_response_with_fault_on_last() {
        let mut request = TransferRequest::empty();
        request.add_read(RegisterAddress::Dp(0x4));
        request.add_read(RegisterAddress::Dp(0x4));

        // Two transfers attempted, the second faulted: only the first
        // read produced data.
        let raw = [2, 0x04, 0x78, 0x56, 0x34, 0x12];
        let response = request.parse_response(&raw).unwrap();
        assert_eq!(response.transfer_count, 2);
        assert_eq!(response.last_transfer_response.ack, Ack::Fault);
        assert_eq!(response.read_values, vec![0x1234_5678]);
    }

    #[test]
    fn block_request_byte() {
        let addr = RegisterAddress::Ap {
            apsel: 0,
            address: 0x0C,
        };
        let req = TransferBlockRequest::read_request(addr, 4);
        // APnDP=1, RnW=1, A2=1, A3=1.
        assert_eq!(req.request_byte, 0b1111);

        let req = TransferBlockRequest::write_request(addr, vec![0, 1]);
        assert_eq!(req.request_byte, 0b1101);
        assert_eq!(req.transfer_count, 2);
    }
}
