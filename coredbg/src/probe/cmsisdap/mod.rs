//! CMSIS-DAP probe implementation.

pub mod commands;
pub mod tools;

use commands::{
    general::{
        Capabilities, CapabilitiesCommand, ConnectRequest, ConnectResponse, DisconnectRequest,
        DisconnectResponse, HostStatusRequest, PacketCountCommand, PacketSizeCommand,
        SwoTraceBufferSizeCommand,
    },
    swd,
    swj::{SwjClockRequest, SwjPinsRequest, SwjSequenceRequest},
    swo,
    transfer::{
        Ack, ConfigureRequest, TransferBlockRequest, TransferRequest,
    },
    CmsisDapDevice, CmsisDapError, Status,
};

use crate::coresight::{ArmError, DapError};
use crate::probe::{
    BatchCommand, DebugProbe, DebugProbeError, DebugProbeInfo, DeferredResult, ProbeCapabilities,
    RawDapAccess, RegisterAddress, WireProtocol,
};

use std::collections::VecDeque;

/// ABORT is DP register 0x0; bit 0 is DAPABORT.
const ABORT_DAPABORT: u32 = 1 << 0;

/// A CMSIS-DAP probe.
pub struct CmsisDap {
    device: CmsisDapDevice,
    name: String,
    protocol: Option<WireProtocol>,
    connected: bool,
    reset_asserted: bool,

    packet_size: u16,
    packet_count: u8,
    capabilities: Capabilities,
    swo_buffer_size: Option<usize>,
    swo_active: bool,

    /// Wire clock in kHz.
    speed_khz: u32,

    /// Operations waiting to be coalesced into one `DAP_Transfer` packet.
    batch: Vec<BatchCommand>,
    /// Values (or errors) of executed reads, front corresponding to
    /// `resolved_slot`.
    results: VecDeque<Result<u32, DapError>>,
    /// Slot number handed out to the next deferred read.
    next_slot: usize,
    /// Slot number of the front of `results`.
    resolved_slot: usize,
}

impl std::fmt::Debug for CmsisDap {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("CmsisDap")
            .field("name", &self.name)
            .field("protocol", &self.protocol)
            .field("packet_size", &self.packet_size)
            .field("packet_count", &self.packet_count)
            .field("capabilities", &self.capabilities)
            .field("speed_khz", &self.speed_khz)
            .finish()
    }
}

impl CmsisDap {
    /// Open the probe described by `info`.
    pub fn new_from_info(info: &DebugProbeInfo) -> Result<Self, DebugProbeError> {
        let device = tools::open_device_from_info(info)?;
        Self::new_from_device(device, info.identifier.clone())
    }

    pub(crate) fn new_from_device(
        mut device: CmsisDapDevice,
        name: String,
    ) -> Result<Self, DebugProbeError> {
        // Discard anything left over from a previous session, otherwise
        // requests and responses get out of sync.
        device.drain();

        // Learn the real packet size first so all further commands use it.
        let packet_size = commands::send_command(&mut device, &PacketSizeCommand)
            .map_err(DebugProbeError::from)?;
        match &mut device {
            CmsisDapDevice::V1 { report_size, .. } => *report_size = packet_size as usize,
            CmsisDapDevice::V2 {
                max_packet_size, ..
            } => *max_packet_size = packet_size as usize,
        }
        device.drain();

        let packet_count = commands::send_command(&mut device, &PacketCountCommand)
            .map_err(DebugProbeError::from)?;
        let capabilities: Capabilities =
            commands::send_command(&mut device, &CapabilitiesCommand)
                .map_err(DebugProbeError::from)?;
        tracing::debug!("Detected probe capabilities: {:?}", capabilities);

        let mut swo_buffer_size = None;
        if capabilities.swo_uart_implemented || capabilities.swo_manchester_implemented {
            let swo_size: u32 = commands::send_command(&mut device, &SwoTraceBufferSizeCommand)
                .map_err(DebugProbeError::from)?;
            swo_buffer_size = Some(swo_size as usize);
            tracing::debug!("Probe SWO buffer size: {}", swo_size);
        }

        Ok(Self {
            device,
            name,
            protocol: None,
            connected: false,
            reset_asserted: false,
            packet_size,
            packet_count,
            capabilities,
            swo_buffer_size,
            swo_active: false,
            speed_khz: 1_000,
            batch: Vec::new(),
            results: VecDeque::new(),
            next_slot: 0,
            resolved_slot: 0,
        })
    }

    fn set_swj_clock(&mut self, clock_speed_hz: u32) -> Result<(), CmsisDapError> {
        let request = SwjClockRequest { clock_speed_hz };
        commands::send_command(&mut self.device, &request).and_then(|v| match v.status {
            Status::DapOk => Ok(()),
            Status::DapError => Err(CmsisDapError::ErrorResponse {
                command: commands::CommandId::SwjClock,
            }),
        })
    }

    fn transfer_configure(&mut self, request: ConfigureRequest) -> Result<(), CmsisDapError> {
        commands::send_command(&mut self.device, &request).and_then(|v| match v.status {
            Status::DapOk => Ok(()),
            Status::DapError => Err(CmsisDapError::ErrorResponse {
                command: commands::CommandId::TransferConfigure,
            }),
        })
    }

    fn configure_swd(&mut self) -> Result<(), CmsisDapError> {
        commands::send_command(&mut self.device, &swd::ConfigureRequest).and_then(
            |v: swd::ConfigureResponse| match v.status {
                Status::DapOk => Ok(()),
                Status::DapError => Err(CmsisDapError::ErrorResponse {
                    command: commands::CommandId::SwdConfigure,
                }),
            },
        )
    }

    /// Send the SWJ pin command that drives or releases nRESET.
    fn swj_nreset(&mut self, level_high: bool) -> Result<(), DebugProbeError> {
        let request = SwjPinsRequest::nreset(level_high);
        commands::send_command(&mut self.device, &request)
            .map(|v| tracing::debug!("Pin response: {:?}", v))
            .map_err(DebugProbeError::from)
    }

    /// Write ABORT with the DAPABORT bit, without touching the batch.
    fn write_dap_abort(&mut self) -> Result<(), ArmError> {
        let request = TransferRequest::write(RegisterAddress::Dp(0x0), ABORT_DAPABORT);
        let response = commands::send_command(&mut self.device, &request)
            .map_err(DebugProbeError::from)?;
        match response.last_transfer_response.ack {
            Ack::Ok => Ok(()),
            Ack::Wait => Err(DapError::WaitResponse.into()),
            Ack::Fault => Err(DapError::FaultResponse.into()),
            Ack::NoAck => Err(DapError::NoAcknowledge.into()),
        }
    }

    /// The number of commands that fit into one `DAP_Transfer` packet.
    ///
    /// A write takes 5 bytes of payload, the packet header 3.
    fn max_batch_size(&self) -> usize {
        (self.packet_size as usize - 3) / 5
    }

    /// Send whatever is queued in the batch as one `DAP_Transfer`.
    ///
    /// Read values land in the results queue where `resolve_deferred` finds
    /// them; reads that were lost to an error get an error slot instead, so
    /// resolution reports the failure at the right place.
    fn process_batch(&mut self) -> Result<(), ArmError> {
        let batch = std::mem::take(&mut self.batch);
        if batch.is_empty() {
            return Ok(());
        }

        tracing::debug!("{} items in batch", batch.len());

        let mut request = TransferRequest::empty();
        let mut reads_in_batch = 0;
        for command in &batch {
            match command {
                BatchCommand::Read(address) => {
                    request.add_read(*address);
                    reads_in_batch += 1;
                }
                BatchCommand::Write(address, value) => request.add_write(*address, *value),
            }
        }

        let response = commands::send_command(&mut self.device, &request)
            .map_err(DebugProbeError::from)?;

        tracing::debug!(
            "{} of batch of {} items executed",
            response.transfer_count,
            batch.len()
        );

        let error = if response.last_transfer_response.protocol_error {
            Some(DapError::SwdProtocol)
        } else {
            match response.last_transfer_response.ack {
                Ack::Ok if response.transfer_count == batch.len() => None,
                Ack::Ok => {
                    // The specification says a short response implies an
                    // error; some probes produce one without reporting it.
                    tracing::warn!(
                        "Only {}/{} transfers were executed, but no error was reported",
                        response.transfer_count,
                        batch.len()
                    );
                    Some(DapError::NoAcknowledge)
                }
                Ack::Wait => {
                    // The probe already retried the configured number of
                    // times, so a WAIT here means the retries are exhausted.
                    self.write_dap_abort()?;
                    Some(DapError::WaitTimeout)
                }
                Ack::Fault => Some(DapError::FaultResponse),
                Ack::NoAck => Some(DapError::NoAcknowledge),
            }
        };

        for value in &response.read_values {
            self.results.push_back(Ok(*value));
        }
        for _ in response.read_values.len()..reads_in_batch {
            self.results
                .push_back(Err(error.unwrap_or(DapError::NoAcknowledge)));
        }

        match error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    fn connect_if_needed(&mut self) -> Result<WireProtocol, DebugProbeError> {
        if let (true, Some(protocol)) = (self.connected, self.protocol) {
            return Ok(protocol);
        }

        let request = match self.protocol {
            Some(WireProtocol::Swd) => ConnectRequest::Swd,
            Some(WireProtocol::Jtag) => ConnectRequest::Jtag,
            None => ConnectRequest::DefaultPort,
        };

        let used_protocol = commands::send_command(&mut self.device, &request)
            .map_err(DebugProbeError::from)
            .and_then(|v| match v {
                ConnectResponse::SuccessfulInitForSwd => Ok(WireProtocol::Swd),
                ConnectResponse::SuccessfulInitForJtag => Ok(WireProtocol::Jtag),
                ConnectResponse::InitFailed => Err(CmsisDapError::ErrorResponse {
                    command: commands::CommandId::Connect,
                }
                .into()),
            })?;

        tracing::info!("Connected with protocol {}", used_protocol);
        self.protocol = Some(used_protocol);
        self.connected = true;

        Ok(used_protocol)
    }

    /// Configure and start SWO capture in UART framing at `baud`.
    pub fn enable_swo(&mut self, baud: u32) -> Result<(), DebugProbeError> {
        if !self.capabilities.swo_uart_implemented {
            return Err(DebugProbeError::CommandNotSupportedByProbe {
                command_name: "swo_uart",
            });
        }

        self.swo_command(swo::ControlRequest::Stop, commands::CommandId::SwoControl)?;
        self.swo_command(
            swo::TransportRequest::DataCommand,
            commands::CommandId::SwoTransport,
        )?;
        self.swo_command(swo::ModeRequest::Uart, commands::CommandId::SwoMode)?;

        let actual: u32 = commands::send_command(&mut self.device, &swo::BaudrateRequest { baudrate: baud })
            .map_err(DebugProbeError::from)?;
        if actual == 0 {
            return Err(DebugProbeError::Other(
                "requested SWO baud rate could not be configured".to_string(),
            ));
        }
        if actual != baud {
            tracing::warn!("SWO baud rate not met: requested {}, got {}", baud, actual);
        }

        self.swo_command(swo::ControlRequest::Start, commands::CommandId::SwoControl)?;
        self.swo_active = true;
        Ok(())
    }

    /// Stop SWO capture.
    pub fn disable_swo(&mut self) -> Result<(), DebugProbeError> {
        self.swo_command(swo::ControlRequest::Stop, commands::CommandId::SwoControl)?;
        self.swo_active = false;
        Ok(())
    }

    /// Poll captured SWO bytes from the probe.
    pub fn read_swo_data(&mut self) -> Result<Vec<u8>, DebugProbeError> {
        let Some(swo_buffer_size) = self.swo_buffer_size else {
            return Ok(Vec::new());
        };

        let n = usize::min(swo_buffer_size, self.packet_size as usize) as u16;
        let response: swo::DataResponse =
            commands::send_command(&mut self.device, &swo::DataRequest { max_count: n })
                .map_err(DebugProbeError::from)?;
        if response.error() {
            return Err(DebugProbeError::Other("SWO trace stream error".to_string()));
        }
        Ok(response.data)
    }

    fn swo_command<R>(&mut self, request: R, id: commands::CommandId) -> Result<(), DebugProbeError>
    where
        R: commands::Request<Response = swo::SwoStatusResponse>,
    {
        commands::send_command(&mut self.device, &request)
            .map_err(DebugProbeError::from)
            .and_then(|v| match v.status {
                Status::DapOk => Ok(()),
                Status::DapError => Err(CmsisDapError::ErrorResponse { command: id }.into()),
            })
    }
}

impl RawDapAccess for CmsisDap {
    fn raw_read_register_deferred(
        &mut self,
        address: RegisterAddress,
    ) -> Result<DeferredResult, ArmError> {
        let slot = self.next_slot;
        self.next_slot += 1;
        self.batch.push(BatchCommand::Read(address));
        if self.batch.len() >= self.max_batch_size() {
            // The packet is full; results stay buffered for resolution.
            let _ = self.process_batch();
        }
        Ok(DeferredResult { slot })
    }

    fn resolve_deferred(&mut self, deferred: DeferredResult) -> Result<u32, ArmError> {
        if deferred.slot >= self.resolved_slot + self.results.len() {
            self.process_batch()?;
        }

        // Earlier reads that were issued but never resolved are discarded;
        // resolution happens in issue order.
        while self.resolved_slot < deferred.slot {
            self.results.pop_front();
            self.resolved_slot += 1;
        }

        match self.results.pop_front() {
            Some(value) => {
                self.resolved_slot += 1;
                value.map_err(Into::into)
            }
            None => Err(ArmError::Other(
                "deferred read was resolved before being executed".to_string(),
            )),
        }
    }

    fn raw_write_register(&mut self, address: RegisterAddress, value: u32) -> Result<(), ArmError> {
        self.batch.push(BatchCommand::Write(address, value));
        if self.batch.len() >= self.max_batch_size() {
            self.process_batch()?;
        }
        Ok(())
    }

    fn raw_read_block(
        &mut self,
        address: RegisterAddress,
        values: &mut [u32],
    ) -> Result<(), ArmError> {
        self.process_batch()?;

        // Per packet: 5 bytes of header before the data words.
        let max_words = (self.packet_size as usize - 5) / 4;
        for chunk in values.chunks_mut(max_words) {
            let request = TransferBlockRequest::read_request(address, chunk.len() as u16);
            let response = commands::send_command(&mut self.device, &request)
                .map_err(DebugProbeError::from)?;
            match response.ack() {
                Ack::Ok => {}
                Ack::Wait => return Err(DapError::WaitTimeout.into()),
                Ack::Fault => return Err(DapError::FaultResponse.into()),
                Ack::NoAck => return Err(DapError::NoAcknowledge.into()),
            }
            chunk.copy_from_slice(&response.transfer_data[..chunk.len()]);
        }

        Ok(())
    }

    fn raw_write_block(&mut self, address: RegisterAddress, values: &[u32]) -> Result<(), ArmError> {
        self.process_batch()?;

        let max_words = (self.packet_size as usize - 5) / 4;
        for chunk in values.chunks(max_words) {
            let request = TransferBlockRequest::write_request(address, chunk.to_vec());
            let response = commands::send_command(&mut self.device, &request)
                .map_err(DebugProbeError::from)?;
            match response.ack() {
                Ack::Ok => {}
                Ack::Wait => return Err(DapError::WaitTimeout.into()),
                Ack::Fault => return Err(DapError::FaultResponse.into()),
                Ack::NoAck => return Err(DapError::NoAcknowledge.into()),
            }
        }

        Ok(())
    }

    fn raw_flush(&mut self) -> Result<(), ArmError> {
        self.process_batch()
    }
}

impl DebugProbe for CmsisDap {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> ProbeCapabilities {
        let mut caps = ProbeCapabilities::default();
        caps.set_swd(self.capabilities.swd_implemented);
        caps.set_jtag(self.capabilities.jtag_implemented);
        caps.set_swo_uart(self.capabilities.swo_uart_implemented);
        caps.set_swo_manchester(self.capabilities.swo_manchester_implemented);
        caps.set_banked_dp_registers(true);
        caps
    }

    fn speed_khz(&self) -> u32 {
        self.speed_khz
    }

    fn set_speed(&mut self, speed_khz: u32) -> Result<u32, DebugProbeError> {
        self.set_swj_clock(speed_khz * 1_000)?;
        self.speed_khz = speed_khz;
        Ok(speed_khz)
    }

    fn attach(
        &mut self,
        protocol: Option<WireProtocol>,
    ) -> Result<WireProtocol, DebugProbeError> {
        if let Some(protocol) = protocol {
            let supported = match protocol {
                WireProtocol::Swd => self.capabilities.swd_implemented,
                WireProtocol::Jtag => self.capabilities.jtag_implemented,
            };
            if !supported {
                return Err(DebugProbeError::UnsupportedProtocol(protocol));
            }
            self.protocol = Some(protocol);
        }

        tracing::debug!("Attaching to target system (clock = {} kHz)", self.speed_khz);
        let used_protocol = self.connect_if_needed()?;

        // The clock can be reset by protocol selection; set it again.
        self.set_speed(self.speed_khz)?;

        self.transfer_configure(ConfigureRequest {
            idle_cycles: 0,
            wait_retry: 0xFFFF,
            match_retry: 0,
        })?;

        if used_protocol == WireProtocol::Swd {
            self.configure_swd()?;
        }

        // Turn on the probe's connected LED.
        let _ = commands::send_command(&mut self.device, &HostStatusRequest::connected(true));

        Ok(used_protocol)
    }

    fn detach(&mut self) -> Result<(), DebugProbeError> {
        self.process_batch()
            .map_err(|e| DebugProbeError::Other(e.to_string()))?;

        if self.swo_active {
            self.disable_swo()?;
        }

        let response: DisconnectResponse =
            commands::send_command(&mut self.device, &DisconnectRequest)
                .map_err(DebugProbeError::from)?;

        let _ = commands::send_command(&mut self.device, &HostStatusRequest::connected(false));

        self.connected = false;

        match response {
            DisconnectResponse(Status::DapOk) => Ok(()),
            DisconnectResponse(Status::DapError) => Err(CmsisDapError::ErrorResponse {
                command: commands::CommandId::Disconnect,
            }
            .into()),
        }
    }

    fn active_protocol(&self) -> Option<WireProtocol> {
        self.protocol
    }

    fn swj_sequence(&mut self, bit_len: u8, bits: u64) -> Result<(), DebugProbeError> {
        self.connect_if_needed()?;

        let data = bits.to_le_bytes();
        let request = SwjSequenceRequest::new(bit_len, &data).map_err(DebugProbeError::from)?;
        commands::send_command(&mut self.device, &request)
            .map_err(DebugProbeError::from)
            .and_then(|v| match v.0 {
                Status::DapOk => Ok(()),
                Status::DapError => Err(CmsisDapError::ErrorResponse {
                    command: commands::CommandId::SwjSequence,
                }
                .into()),
            })
    }

    fn assert_reset(&mut self, assert: bool) -> Result<(), DebugProbeError> {
        self.swj_nreset(!assert)?;
        self.reset_asserted = assert;
        Ok(())
    }

    fn is_reset_asserted(&self) -> bool {
        self.reset_asserted
    }
}

impl Drop for CmsisDap {
    fn drop(&mut self) {
        tracing::debug!("Detaching from CMSIS-DAP probe");
        // Errors are ignored; nothing can be done about them here.
        let _ = self.process_batch();
        if self.swo_active {
            let _ = self.disable_swo();
        }
        let _ = self.detach();
    }
}

