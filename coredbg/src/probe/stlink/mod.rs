//! ST-Link probe implementation.

pub mod constants;
pub mod tools;
pub mod usb_interface;

use self::constants::{commands, JtagFrequencyToDivider, Mode, Status, SwdFrequencyToDelayCount};
use self::usb_interface::{StLinkUsb, StLinkUsbDevice, TIMEOUT};
use crate::coresight::{ArmError, DapError};
use crate::probe::{
    DebugProbe, DebugProbeError, DebugProbeInfo, DeferredResult, ProbeCapabilities, RawDapAccess,
    RegisterAddress, WireProtocol,
};

use scroll::{Pread, BE, LE};

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::time::Duration;

/// Maximum length of 32 bit reads in bytes, determined experimentally on an
/// ST-Link v2.
const STLINK_MAX_READ_LEN: usize = 6144;

/// Maximum length of 32 bit writes in bytes: the largest 16-bit value that is
/// a multiple of 4.
const STLINK_MAX_WRITE_LEN: usize = 0xFFFC;

/// The port selector value denoting the debug port.
const DP_PORT: u16 = 0xFFFF;

/// ST-Link specific errors.
#[derive(thiserror::Error, Debug)]
pub enum StlinkError {
    /// The voltage readout returned a zero divisor.
    #[error("Invalid voltage values returned by probe.")]
    VoltageDivisionByZero,

    /// The probe is in a mode this driver does not know.
    #[error("Probe is in an unknown mode.")]
    UnknownMode,

    /// This firmware cannot access banked DP registers.
    #[error(
        "The ST-Link firmware does not support accessing banked DP registers. \
         Upgrading the firmware may fix this."
    )]
    BanksNotAllowedOnDpRegister,

    /// A USB write transferred fewer bytes than requested.
    #[error("Not enough bytes written (wrote {is} of {should}).")]
    NotEnoughBytesWritten {
        /// The number of bytes actually written.
        is: usize,
        /// The number of bytes that should have been written.
        should: usize,
    },

    /// The firmware answered a command with a non-OK status.
    #[error("Command failed with status {0:?}")]
    CommandFailed(Status),

    /// The probe reports no JTAG/SWD capable firmware.
    #[error("JTAG/SWD not supported on this probe")]
    JtagNotSupportedOnProbe,

    /// A memory access used an address not aligned to its width.
    #[error("Unaligned memory access")]
    UnalignedAddress,

    /// A memory transfer faulted at the given address.
    #[error("Memory transfer fault at address {address:#010x}")]
    MemoryFault {
        /// The fault address reported by the firmware.
        address: u32,
    },

    /// The background receive thread is gone.
    #[error("The receive thread of the probe terminated unexpectedly")]
    ReceiveThreadGone,

    /// An USB error occurred.
    #[error("USB error")]
    Usb(#[source] Box<dyn std::error::Error + Sync + Send>),
}

impl From<rusb::Error> for StlinkError {
    fn from(e: rusb::Error) -> Self {
        StlinkError::Usb(Box::new(e))
    }
}

impl From<StlinkError> for DebugProbeError {
    fn from(e: StlinkError) -> Self {
        DebugProbeError::ProbeSpecific(Box::new(e))
    }
}

/// An ST-Link debug adapter.
#[derive(Debug)]
pub struct StLink<D: StLinkUsb> {
    device: D,
    name: String,
    hw_version: u8,
    jtag_version: u8,
    protocol: WireProtocol,
    swd_speed_khz: u32,
    jtag_speed_khz: u32,
    swo_enabled: bool,
    reset_asserted: bool,

    /// APs the firmware has been told to open.
    opened_aps: Vec<u8>,

    /// Values of executed deferred reads, front corresponding to
    /// `resolved_slot`.
    results: VecDeque<Result<u32, DapError>>,
    next_slot: usize,
    resolved_slot: usize,
}

impl StLink<StLinkUsbDevice> {
    /// Open the probe described by `info`.
    pub fn new_from_info(info: &DebugProbeInfo) -> Result<Self, DebugProbeError> {
        let device = StLinkUsbDevice::new_from_info(info)?;
        let name = format!("ST-Link {}", device.info.version_name);
        let mut stlink = Self::new(device, name);
        stlink.init()?;
        Ok(stlink)
    }
}

impl<D: StLinkUsb> StLink<D> {
    /// Minimum required ST-Link V2 firmware version.
    const MIN_JTAG_VERSION: u8 = 26;

    /// Minimum required ST-Link V3 firmware version. Version 2 of the V3
    /// firmware has problems switching communication protocols.
    const MIN_JTAG_VERSION_V3: u8 = 3;

    /// First firmware version with support for 16-bit memory access.
    const MIN_JTAG_VERSION_16BIT_XFER: u8 = 26;

    /// First firmware version with support for multiple APs.
    const MIN_JTAG_VERSION_MULTI_AP: u8 = 28;

    /// First V2 firmware version with support for banked DP registers.
    const MIN_JTAG_VERSION_DP_BANK_SEL: u8 = 32;

    fn new(device: D, name: String) -> Self {
        Self {
            device,
            name,
            hw_version: 0,
            jtag_version: 0,
            protocol: WireProtocol::Swd,
            swd_speed_khz: 1_800,
            jtag_speed_khz: 1_120,
            swo_enabled: false,
            reset_asserted: false,
            opened_aps: Vec::new(),
            results: VecDeque::new(),
            next_slot: 0,
            resolved_slot: 0,
        }
    }

    /// Check if selecting different banks in the DP is supported.
    fn supports_dp_bank_selection(&self) -> bool {
        (self.hw_version == 2 && self.jtag_version >= Self::MIN_JTAG_VERSION_DP_BANK_SEL)
            || self.hw_version == 3
    }

    /// Whether the firmware implements 16-bit memory transfers.
    fn supports_16bit_transfers(&self) -> bool {
        self.hw_version >= 3 || self.jtag_version >= Self::MIN_JTAG_VERSION_16BIT_XFER
    }

    fn get_current_mode(&mut self) -> Result<Mode, StlinkError> {
        tracing::trace!("Getting current mode of device...");
        let mut buf = [0; 2];
        self.device
            .write(&[commands::GET_CURRENT_MODE], &[], &mut buf, TIMEOUT)?;

        let mode = match buf[0] {
            0 => Mode::Dfu,
            1 => Mode::MassStorage,
            2 => Mode::Jtag,
            3 => Mode::Swim,
            _ => return Err(StlinkError::UnknownMode),
        };

        tracing::debug!("Current device mode: {:?}", mode);
        Ok(mode)
    }

    /// Command the ST-Link to leave whatever mode it is in.
    fn enter_idle(&mut self) -> Result<(), StlinkError> {
        match self.get_current_mode()? {
            Mode::Jtag => self.device.write(
                &[commands::JTAG_COMMAND, commands::JTAG_EXIT],
                &[],
                &mut [],
                TIMEOUT,
            ),
            Mode::Dfu => self.device.write(
                &[commands::DFU_COMMAND, commands::DFU_EXIT],
                &[],
                &mut [],
                TIMEOUT,
            ),
            Mode::Swim => self.device.write(
                &[commands::SWIM_COMMAND, commands::SWIM_EXIT],
                &[],
                &mut [],
                TIMEOUT,
            ),
            Mode::MassStorage => Ok(()),
        }
    }

    /// Read the hardware and firmware version and store them on the struct.
    fn get_version(&mut self) -> Result<(u8, u8), DebugProbeError> {
        const HW_VERSION_SHIFT: u8 = 12;
        const HW_VERSION_MASK: u8 = 0x0F;
        const JTAG_VERSION_SHIFT: u8 = 6;
        const JTAG_VERSION_MASK: u8 = 0x3F;

        // GET_VERSION response:
        //   Byte 0-1: [15:12] HW version, [11:6] JTAG/SWD version, [5:0] SWIM/MSC
        //   Byte 2-3: ST_VID, Byte 4-5: STLINK_PID
        let mut buf = [0; 6];
        self.device
            .write(&[commands::GET_VERSION], &[], &mut buf, TIMEOUT)
            .map(|_| {
                let version: u16 = buf[0..2].pread_with(0, BE).unwrap();
                self.hw_version = (version >> HW_VERSION_SHIFT) as u8 & HW_VERSION_MASK;
                self.jtag_version = (version >> JTAG_VERSION_SHIFT) as u8 & JTAG_VERSION_MASK;
            })?;

        // V3 devices must use the extended command.
        if self.hw_version >= 3 {
            // GET_VERSION_EXT response (byte offsets):
            //   0: HW version, 1: SWIM version, 2: JTAG/SWD version,
            //   3: MSC/VCP version, 4: bridge version, 8-11: VID/PID
            let mut buf = [0; 12];
            self.device
                .write(&[commands::GET_VERSION_EXT], &[], &mut buf, TIMEOUT)
                .map(|_| {
                    self.jtag_version = buf[2];
                })?;
        }

        if self.jtag_version == 0 {
            Err(StlinkError::JtagNotSupportedOnProbe.into())
        } else if (self.hw_version < 3 && self.jtag_version < Self::MIN_JTAG_VERSION)
            || (self.hw_version == 3 && self.jtag_version < Self::MIN_JTAG_VERSION_V3)
        {
            Err(DebugProbeError::ProbeFirmwareOutdated)
        } else {
            Ok((self.hw_version, self.jtag_version))
        }
    }

    fn init(&mut self) -> Result<(), DebugProbeError> {
        tracing::debug!("Initializing ST-Link...");

        if let Err(e) = self.enter_idle() {
            match e {
                StlinkError::Usb(_) => {
                    // Re-synchronize the transport and try again.
                    self.device.reset()?;
                    self.enter_idle()?;
                }
                _ => return Err(e.into()),
            }
        }

        let version = self.get_version()?;
        tracing::debug!("ST-Link version: {:?}", version);

        if self.hw_version == 3 {
            let (_, current) = self.get_communication_frequencies(WireProtocol::Swd)?;
            self.swd_speed_khz = current;

            let (_, current) = self.get_communication_frequencies(WireProtocol::Jtag)?;
            self.jtag_speed_khz = current;
        }

        Ok(())
    }

    fn send_jtag_command(
        &mut self,
        cmd: &[u8],
        write_data: &[u8],
        read_data: &mut [u8],
        timeout: Duration,
    ) -> Result<(), StlinkError> {
        self.device.write(cmd, write_data, read_data, timeout)?;
        match Status::from(read_data[0]) {
            Status::JtagOk => Ok(()),
            status => {
                tracing::warn!("send_jtag_command {:#04x} failed: {:?}", cmd[0], status);
                Err(StlinkError::CommandFailed(status))
            }
        }
    }

    fn set_swd_frequency(
        &mut self,
        frequency: SwdFrequencyToDelayCount,
    ) -> Result<(), DebugProbeError> {
        let mut buf = [0; 2];
        self.send_jtag_command(
            &[
                commands::JTAG_COMMAND,
                commands::SWD_SET_FREQ,
                frequency as u8,
            ],
            &[],
            &mut buf,
            TIMEOUT,
        )?;
        Ok(())
    }

    fn set_jtag_frequency(
        &mut self,
        frequency: JtagFrequencyToDivider,
    ) -> Result<(), DebugProbeError> {
        let mut buf = [0; 2];
        self.send_jtag_command(
            &[
                commands::JTAG_COMMAND,
                commands::JTAG_SET_FREQ,
                frequency as u8,
            ],
            &[],
            &mut buf,
            TIMEOUT,
        )?;
        Ok(())
    }

    /// Set the communication frequency (V3 only).
    fn set_communication_frequency(
        &mut self,
        protocol: WireProtocol,
        frequency_khz: u32,
    ) -> Result<(), DebugProbeError> {
        if self.hw_version != 3 {
            return Err(DebugProbeError::CommandNotSupportedByProbe {
                command_name: "set_communication_frequency",
            });
        }

        let cmd_proto = match protocol {
            WireProtocol::Swd => 0,
            WireProtocol::Jtag => 1,
        };

        let mut command = vec![commands::JTAG_COMMAND, commands::SET_COM_FREQ, cmd_proto, 0];
        command.extend_from_slice(&frequency_khz.to_le_bytes());

        let mut buf = [0; 8];
        self.send_jtag_command(&command, &[], &mut buf, TIMEOUT)?;
        Ok(())
    }

    /// Return the available and current communication frequencies (V3 only).
    fn get_communication_frequencies(
        &mut self,
        protocol: WireProtocol,
    ) -> Result<(Vec<u32>, u32), DebugProbeError> {
        if self.hw_version != 3 {
            return Err(DebugProbeError::CommandNotSupportedByProbe {
                command_name: "get_communication_frequencies",
            });
        }

        let cmd_proto = match protocol {
            WireProtocol::Swd => 0,
            WireProtocol::Jtag => 1,
        };

        let mut buf = [0; 52];
        self.send_jtag_command(
            &[commands::JTAG_COMMAND, commands::GET_COM_FREQ, cmd_proto],
            &[],
            &mut buf,
            TIMEOUT,
        )?;

        let mut values = buf
            .chunks(4)
            .map(|chunk| chunk.pread_with::<u32>(0, LE).unwrap())
            .collect::<Vec<u32>>();

        let current = values[1];
        let n = u32::min(values[2], 10) as usize;

        values.rotate_left(3);
        values.truncate(n);

        Ok((values, current))
    }

    /// Select an AP for the following commands.
    ///
    /// Newer firmware (J28 and later, or V3) supports multiple APs through
    /// dedicated open commands; older firmware can only ever use AP 0.
    fn select_ap(&mut self, ap: u8) -> Result<(), DebugProbeError> {
        if self.hw_version < 3 && self.jtag_version < Self::MIN_JTAG_VERSION_MULTI_AP {
            if ap != 0 {
                return Err(DebugProbeError::ProbeFirmwareOutdated);
            }
        } else if !self.opened_aps.contains(&ap) {
            tracing::debug!("Opening AP {}", ap);
            self.open_ap(ap)?;
            self.opened_aps.push(ap);
        }

        Ok(())
    }

    fn open_ap(&mut self, apsel: u8) -> Result<(), DebugProbeError> {
        let mut buf = [0; 2];
        tracing::trace!("JTAG_INIT_AP {}", apsel);
        retry_on_wait(|| {
            self.send_jtag_command(
                &[commands::JTAG_COMMAND, commands::JTAG_INIT_AP, apsel],
                &[],
                &mut buf,
                TIMEOUT,
            )
        })?;
        Ok(())
    }

    /// Query the status of the last memory transfer and classify it.
    ///
    /// WAIT statuses come back as [`StlinkError::CommandFailed`] so the retry
    /// wrapper can spot them; any other failure carries the fault address the
    /// firmware reported.
    fn classify_last_rw_status(&mut self) -> Result<(), StlinkError> {
        let mut buf = [0u8; 12];
        self.device.write(
            &[commands::JTAG_COMMAND, commands::JTAG_GETLASTRWSTATUS2],
            &[],
            &mut buf,
            TIMEOUT,
        )?;
        let status = Status::from(buf[0]);
        let fault_address: u32 = buf.pread_with(4, LE).unwrap();
        match status {
            Status::JtagOk => Ok(()),
            Status::SwdDpWait | Status::SwdApWait => Err(StlinkError::CommandFailed(status)),
            other => {
                tracing::warn!(
                    "Memory transfer failed: {:?}, fault address {:#010x}",
                    other,
                    fault_address
                );
                Err(StlinkError::MemoryFault {
                    address: fault_address,
                })
            }
        }
    }

    /// Reads the DAP register on the specified port and address.
    fn read_register(&mut self, port: u16, addr: u8) -> Result<u32, DebugProbeError> {
        if port == DP_PORT && addr & 0xf0 != 0 && !self.supports_dp_bank_selection() {
            tracing::warn!(
                "Accessing banked DP register {addr:#x} is not supported on this ST-Link."
            );
            return Err(StlinkError::BanksNotAllowedOnDpRegister.into());
        }

        if port != DP_PORT {
            self.select_ap(port as u8)?;
        }

        let port_bytes = port.to_le_bytes();
        let cmd = &[
            commands::JTAG_COMMAND,
            commands::JTAG_READ_DAP_REG,
            port_bytes[0],
            port_bytes[1],
            addr,
            0, // The maximum DAP register address is 0xFC.
        ];
        let mut buf = [0; 8];
        retry_on_wait(|| self.send_jtag_command(cmd, &[], &mut buf, TIMEOUT))?;
        Ok(buf[4..8].pread_with(0, LE).unwrap())
    }

    /// Writes a value to the DAP register on the specified port and address.
    fn write_register(&mut self, port: u16, addr: u8, value: u32) -> Result<(), DebugProbeError> {
        if port == DP_PORT && addr & 0xf0 != 0 && !self.supports_dp_bank_selection() {
            tracing::warn!(
                "Accessing banked DP register {addr:#x} is not supported on this ST-Link."
            );
            return Err(StlinkError::BanksNotAllowedOnDpRegister.into());
        }

        if port != DP_PORT {
            self.select_ap(port as u8)?;
        }

        let port_bytes = port.to_le_bytes();
        let bytes = value.to_le_bytes();
        let cmd = &[
            commands::JTAG_COMMAND,
            commands::JTAG_WRITE_DAP_REG,
            port_bytes[0],
            port_bytes[1],
            addr,
            0,
            bytes[0],
            bytes[1],
            bytes[2],
            bytes[3],
        ];
        let mut buf = [0; 2];
        retry_on_wait(|| self.send_jtag_command(cmd, &[], &mut buf, TIMEOUT))?;
        Ok(())
    }

    fn read_mem_32bit(
        &mut self,
        address: u32,
        data: &mut [u8],
        apsel: u8,
    ) -> Result<(), ArmError> {
        self.select_ap(apsel)?;

        debug_assert!(data.len() <= STLINK_MAX_READ_LEN);
        debug_assert!(data.len() % 4 == 0);
        if address % 4 != 0 {
            return Err(ArmError::alignment_error(address, 4));
        }

        let len = data.len();
        let addbytes = address.to_le_bytes();
        let lenbytes = (len as u16).to_le_bytes();
        let result = retry_on_wait(|| {
            self.device.write(
                &[
                    commands::JTAG_COMMAND,
                    commands::JTAG_READMEM_32BIT,
                    addbytes[0],
                    addbytes[1],
                    addbytes[2],
                    addbytes[3],
                    lenbytes[0],
                    lenbytes[1],
                    apsel,
                ],
                &[],
                data,
                TIMEOUT,
            )?;
            self.classify_last_rw_status()
        });

        map_mem_result(result, address, len)
    }

    fn read_mem_16bit(
        &mut self,
        address: u32,
        data: &mut [u8],
        apsel: u8,
    ) -> Result<(), ArmError> {
        if !self.supports_16bit_transfers() {
            return Err(ArmError::UnsupportedTransferWidth(16));
        }
        self.select_ap(apsel)?;

        debug_assert!(data.len() % 2 == 0);
        if address % 2 != 0 {
            return Err(ArmError::alignment_error(address, 2));
        }

        let len = data.len();
        let addbytes = address.to_le_bytes();
        let lenbytes = (len as u16).to_le_bytes();
        let result = retry_on_wait(|| {
            self.device.write(
                &[
                    commands::JTAG_COMMAND,
                    commands::JTAG_READMEM_16BIT,
                    addbytes[0],
                    addbytes[1],
                    addbytes[2],
                    addbytes[3],
                    lenbytes[0],
                    lenbytes[1],
                    apsel,
                ],
                &[],
                data,
                TIMEOUT,
            )?;
            self.classify_last_rw_status()
        });

        map_mem_result(result, address, len)
    }

    fn read_mem_8bit(
        &mut self,
        address: u32,
        data: &mut [u8],
        apsel: u8,
    ) -> Result<(), ArmError> {
        self.select_ap(apsel)?;

        // The receive buffer must be at least two bytes, otherwise a USB
        // overflow error occurs.
        let mut buffer = vec![0u8; data.len().max(2)];

        let len = data.len();
        let addbytes = address.to_le_bytes();
        let lenbytes = (len as u16).to_le_bytes();
        let result = retry_on_wait(|| {
            self.device.write(
                &[
                    commands::JTAG_COMMAND,
                    commands::JTAG_READMEM_8BIT,
                    addbytes[0],
                    addbytes[1],
                    addbytes[2],
                    addbytes[3],
                    lenbytes[0],
                    lenbytes[1],
                    apsel,
                ],
                &[],
                &mut buffer,
                TIMEOUT,
            )?;
            self.classify_last_rw_status()
        });

        data.copy_from_slice(&buffer[..len]);

        map_mem_result(result, address, len)
    }

    fn write_mem_32bit(&mut self, address: u32, data: &[u8], apsel: u8) -> Result<(), ArmError> {
        self.select_ap(apsel)?;

        debug_assert!(data.len() <= STLINK_MAX_WRITE_LEN);
        debug_assert!(data.len() % 4 == 0);
        if address % 4 != 0 {
            return Err(ArmError::alignment_error(address, 4));
        }

        let len = data.len();
        let addbytes = address.to_le_bytes();
        let lenbytes = (len as u16).to_le_bytes();
        let result = retry_on_wait(|| {
            self.device.write(
                &[
                    commands::JTAG_COMMAND,
                    commands::JTAG_WRITEMEM_32BIT,
                    addbytes[0],
                    addbytes[1],
                    addbytes[2],
                    addbytes[3],
                    lenbytes[0],
                    lenbytes[1],
                    apsel,
                ],
                data,
                &mut [],
                TIMEOUT,
            )?;
            self.classify_last_rw_status()
        });

        map_mem_result(result, address, len)
    }

    fn write_mem_16bit(&mut self, address: u32, data: &[u8], apsel: u8) -> Result<(), ArmError> {
        if !self.supports_16bit_transfers() {
            return Err(ArmError::UnsupportedTransferWidth(16));
        }
        self.select_ap(apsel)?;

        debug_assert!(data.len() % 2 == 0);
        if address % 2 != 0 {
            return Err(ArmError::alignment_error(address, 2));
        }

        let len = data.len();
        let addbytes = address.to_le_bytes();
        let lenbytes = (len as u16).to_le_bytes();
        let result = retry_on_wait(|| {
            self.device.write(
                &[
                    commands::JTAG_COMMAND,
                    commands::JTAG_WRITEMEM_16BIT,
                    addbytes[0],
                    addbytes[1],
                    addbytes[2],
                    addbytes[3],
                    lenbytes[0],
                    lenbytes[1],
                    apsel,
                ],
                data,
                &mut [],
                TIMEOUT,
            )?;
            self.classify_last_rw_status()
        });

        map_mem_result(result, address, len)
    }

    fn write_mem_8bit(&mut self, address: u32, data: &[u8], apsel: u8) -> Result<(), ArmError> {
        self.select_ap(apsel)?;

        let len = data.len();
        let addbytes = address.to_le_bytes();
        let lenbytes = (len as u16).to_le_bytes();
        let result = retry_on_wait(|| {
            self.device.write(
                &[
                    commands::JTAG_COMMAND,
                    commands::JTAG_WRITEMEM_8BIT,
                    addbytes[0],
                    addbytes[1],
                    addbytes[2],
                    addbytes[3],
                    lenbytes[0],
                    lenbytes[1],
                    apsel,
                ],
                data,
                &mut [],
                TIMEOUT,
            )?;
            self.classify_last_rw_status()
        });

        map_mem_result(result, address, len)
    }

    /// The chunk limit of 8-bit accesses for this hardware version.
    fn max_8bit_chunk(&self) -> usize {
        if self.hw_version < 3 {
            64
        } else {
            // Empirically the V3 firmware handles up to 255 bytes; stay
            // below to keep a safety margin.
            128
        }
    }

    /// Start SWO trace reception at the given baud rate.
    pub fn start_trace_reception(&mut self, baud: u32) -> Result<(), DebugProbeError> {
        let mut buf = [0; 2];
        let bufsize = 4096u16.to_le_bytes();
        let baud = baud.to_le_bytes();
        let mut command = vec![commands::JTAG_COMMAND, commands::SWO_START_TRACE_RECEPTION];
        command.extend_from_slice(&bufsize);
        command.extend_from_slice(&baud);

        self.send_jtag_command(&command, &[], &mut buf, TIMEOUT)?;
        self.swo_enabled = true;
        Ok(())
    }

    /// Stop SWO trace reception.
    pub fn stop_trace_reception(&mut self) -> Result<(), DebugProbeError> {
        let mut buf = [0; 2];
        self.send_jtag_command(
            &[commands::JTAG_COMMAND, commands::SWO_STOP_TRACE_RECEPTION],
            &[],
            &mut buf,
            TIMEOUT,
        )?;
        self.swo_enabled = false;
        Ok(())
    }

    /// Poll how many SWO bytes the probe has buffered.
    fn read_swo_available_byte_count(&mut self) -> Result<usize, DebugProbeError> {
        let mut buf = [0; 2];
        self.device.write(
            &[
                commands::JTAG_COMMAND,
                commands::SWO_GET_TRACE_NEW_RECORD_NB,
            ],
            &[],
            &mut buf,
            TIMEOUT,
        )?;
        Ok(buf.pread_with::<u16>(0, LE).unwrap() as usize)
    }

    /// Read buffered SWO trace bytes.
    pub fn read_swo_data(&mut self, timeout: Duration) -> Result<Vec<u8>, DebugProbeError> {
        // The byte count must be polled first, otherwise the ST-Link does
        // not return any data.
        let mut buf = vec![0; self.read_swo_available_byte_count()?];
        if buf.is_empty() {
            return Ok(buf);
        }
        let bytes_read = self.device.read_swo(&mut buf, timeout)?;
        buf.truncate(bytes_read);
        Ok(buf)
    }
}

fn is_wait_error(e: &StlinkError) -> bool {
    matches!(
        e,
        StlinkError::CommandFailed(Status::SwdDpWait | Status::SwdApWait)
    )
}

/// Retry `f` on WAIT responses with exponential backoff.
fn retry_on_wait<R>(mut f: impl FnMut() -> Result<R, StlinkError>) -> Result<R, StlinkError> {
    let mut last_err = None;
    for attempt in 0..13 {
        match f() {
            Ok(res) => return Ok(res),
            Err(e) if is_wait_error(&e) => {
                tracing::warn!("got SwdDpWait/SwdApWait, retrying.");
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }

        std::thread::sleep(Duration::from_micros(100 << attempt));
    }

    tracing::warn!("too many retries, giving up");
    Err(last_err.unwrap())
}

/// Convert the outcome of a memory command into an [`ArmError`], annotating a
/// fault with the fault address and the remaining byte count.
fn map_mem_result(
    result: Result<(), StlinkError>,
    start_address: u32,
    length: usize,
) -> Result<(), ArmError> {
    match result {
        Ok(()) => Ok(()),
        Err(StlinkError::MemoryFault { address }) => {
            let done = address.saturating_sub(start_address).min(length as u32);
            Err(ArmError::TransferFault {
                address,
                length: length as u32 - done,
            })
        }
        Err(e) if is_wait_error(&e) => Err(DapError::WaitTimeout.into()),
        Err(e) => Err(DebugProbeError::from(e).into()),
    }
}

impl<D: StLinkUsb> RawDapAccess for StLink<D> {
    fn raw_read_register_deferred(
        &mut self,
        address: RegisterAddress,
    ) -> Result<DeferredResult, ArmError> {
        // The ST-Link protocol is synchronous; the read executes right away
        // and resolution only hands the buffered value out. An error
        // propagates immediately, before a slot is assigned, so the queue
        // stays aligned.
        let value = match address {
            RegisterAddress::Dp(addr) => self.read_register(DP_PORT, addr)?,
            RegisterAddress::Ap { apsel, address } => {
                self.read_register(apsel as u16, address)?
            }
        };

        let slot = self.next_slot;
        self.next_slot += 1;
        self.results.push_back(Ok(value));
        Ok(DeferredResult { slot })
    }

    fn resolve_deferred(&mut self, deferred: DeferredResult) -> Result<u32, ArmError> {
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
        match address {
            RegisterAddress::Dp(addr) => self.write_register(DP_PORT, addr, value)?,
            RegisterAddress::Ap { apsel, address } => {
                self.write_register(apsel as u16, address, value)?
            }
        }
        Ok(())
    }

    fn raw_read_block(
        &mut self,
        address: RegisterAddress,
        values: &mut [u32],
    ) -> Result<(), ArmError> {
        for value in values.iter_mut() {
            *value = self.raw_read_register(address)?;
        }
        Ok(())
    }

    fn raw_write_block(&mut self, address: RegisterAddress, values: &[u32]) -> Result<(), ArmError> {
        for value in values {
            self.raw_write_register(address, *value)?;
        }
        Ok(())
    }

    fn raw_flush(&mut self) -> Result<(), ArmError> {
        // Nothing is ever buffered on the transmit side.
        Ok(())
    }
}

impl<D: StLinkUsb> DebugProbe for StLink<D> {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> ProbeCapabilities {
        let mut caps = ProbeCapabilities::default();
        caps.set_swd(true);
        caps.set_jtag(true);
        caps.set_swo_uart(true);
        caps.set_banked_dp_registers(self.supports_dp_bank_selection());
        caps
    }

    fn speed_khz(&self) -> u32 {
        match self.protocol {
            WireProtocol::Swd => self.swd_speed_khz,
            WireProtocol::Jtag => self.jtag_speed_khz,
        }
    }

    fn set_speed(&mut self, speed_khz: u32) -> Result<u32, DebugProbeError> {
        match self.hw_version.cmp(&3) {
            Ordering::Less => match self.protocol {
                WireProtocol::Swd => {
                    let actual = SwdFrequencyToDelayCount::find_setting(speed_khz)
                        .ok_or(DebugProbeError::UnsupportedSpeed(speed_khz))?;
                    self.set_swd_frequency(actual)?;
                    self.swd_speed_khz = actual.to_khz();
                    Ok(actual.to_khz())
                }
                WireProtocol::Jtag => {
                    let actual = JtagFrequencyToDivider::find_setting(speed_khz)
                        .ok_or(DebugProbeError::UnsupportedSpeed(speed_khz))?;
                    self.set_jtag_frequency(actual)?;
                    self.jtag_speed_khz = actual.to_khz();
                    Ok(actual.to_khz())
                }
            },
            Ordering::Equal => {
                let (available, _) = self.get_communication_frequencies(self.protocol)?;

                let actual_speed_khz = available
                    .into_iter()
                    .filter(|speed| *speed <= speed_khz)
                    .max()
                    .ok_or(DebugProbeError::UnsupportedSpeed(speed_khz))?;

                self.set_communication_frequency(self.protocol, actual_speed_khz)?;

                match self.protocol {
                    WireProtocol::Swd => self.swd_speed_khz = actual_speed_khz,
                    WireProtocol::Jtag => self.jtag_speed_khz = actual_speed_khz,
                }

                Ok(actual_speed_khz)
            }
            Ordering::Greater => Err(DebugProbeError::UnsupportedSpeed(speed_khz)),
        }
    }

    fn attach(
        &mut self,
        protocol: Option<WireProtocol>,
    ) -> Result<WireProtocol, DebugProbeError> {
        if let Some(protocol) = protocol {
            self.protocol = protocol;
        }

        self.enter_idle()?;

        let param = match self.protocol {
            WireProtocol::Jtag => {
                tracing::debug!("Switching protocol to JTAG");
                commands::JTAG_ENTER_JTAG_NO_CORE_RESET
            }
            WireProtocol::Swd => {
                tracing::debug!("Switching protocol to SWD");
                commands::JTAG_ENTER_SWD
            }
        };

        // Check and report the target voltage.
        if let Some(target_voltage) = self.target_voltage()? {
            if target_voltage < 1.5 {
                tracing::warn!(
                    "Target voltage (VAPP) is {:2.2} V. Is your target device powered?",
                    target_voltage
                );
            } else {
                tracing::info!("Target voltage (VAPP): {:2.2} V", target_voltage);
            }
        }

        let mut buf = [0; 2];
        self.send_jtag_command(
            &[commands::JTAG_COMMAND, commands::JTAG_ENTER2, param, 0],
            &[],
            &mut buf,
            TIMEOUT,
        )?;

        tracing::debug!("Successfully entered debug mode");

        // The probe keeps whatever speed was configured before; set it again
        // so the default actually applies.
        self.set_speed(self.speed_khz())?;

        Ok(self.protocol)
    }

    fn detach(&mut self) -> Result<(), DebugProbeError> {
        tracing::debug!("Detaching from ST-Link.");
        if self.swo_enabled {
            self.stop_trace_reception()?;
        }
        self.enter_idle().map_err(Into::into)
    }

    fn active_protocol(&self) -> Option<WireProtocol> {
        Some(self.protocol)
    }

    fn assert_reset(&mut self, assert: bool) -> Result<(), DebugProbeError> {
        let param = if assert {
            commands::JTAG_DRIVE_NRST_LOW
        } else {
            commands::JTAG_DRIVE_NRST_HIGH
        };

        let mut buf = [0; 2];
        self.send_jtag_command(
            &[commands::JTAG_COMMAND, commands::JTAG_DRIVE_NRST, param],
            &[],
            &mut buf,
            TIMEOUT,
        )?;

        self.reset_asserted = assert;
        Ok(())
    }

    fn is_reset_asserted(&self) -> bool {
        self.reset_asserted
    }

    fn target_voltage(&mut self) -> Result<Option<f32>, DebugProbeError> {
        let mut buf = [0; 8];
        self.device
            .write(&[commands::GET_TARGET_VOLTAGE], &[], &mut buf, TIMEOUT)
            .map_err(DebugProbeError::from)
            .and_then(|_| {
                let a0 = buf[0..4].pread_with::<u32>(0, LE).unwrap();
                let a1 = buf[4..8].pread_with::<u32>(0, LE).unwrap();
                if a0 != 0 {
                    Ok(Some(2. * (a1 as f32) * 1.2 / (a0 as f32)))
                } else {
                    Err(StlinkError::VoltageDivisionByZero.into())
                }
            })
    }

    fn has_native_memory_access(&self) -> bool {
        true
    }

    fn read_memory_native(
        &mut self,
        apsel: u8,
        address: u32,
        data: &mut [u8],
        width: usize,
    ) -> Result<(), ArmError> {
        match width {
            32 => {
                for (index, chunk) in data.chunks_mut(STLINK_MAX_READ_LEN).enumerate() {
                    self.read_mem_32bit(
                        address + (index * STLINK_MAX_READ_LEN) as u32,
                        chunk,
                        apsel,
                    )?;
                }
                Ok(())
            }
            16 => {
                let chunk_size = if self.hw_version < 3 { 64 } else { 128 };
                for (index, chunk) in data.chunks_mut(chunk_size).enumerate() {
                    self.read_mem_16bit(address + (index * chunk_size) as u32, chunk, apsel)?;
                }
                Ok(())
            }
            8 => {
                let chunk_size = self.max_8bit_chunk();
                for (index, chunk) in data.chunks_mut(chunk_size).enumerate() {
                    self.read_mem_8bit(address + (index * chunk_size) as u32, chunk, apsel)?;
                }
                Ok(())
            }
            other => Err(ArmError::UnsupportedTransferWidth(other)),
        }
    }

    fn write_memory_native(
        &mut self,
        apsel: u8,
        address: u32,
        data: &[u8],
        width: usize,
    ) -> Result<(), ArmError> {
        match width {
            32 => {
                for (index, chunk) in data.chunks(STLINK_MAX_WRITE_LEN).enumerate() {
                    self.write_mem_32bit(
                        address + (index * STLINK_MAX_WRITE_LEN) as u32,
                        chunk,
                        apsel,
                    )?;
                }
                Ok(())
            }
            16 => {
                let chunk_size = if self.hw_version < 3 { 64 } else { 256 };
                for (index, chunk) in data.chunks(chunk_size).enumerate() {
                    self.write_mem_16bit(address + (index * chunk_size) as u32, chunk, apsel)?;
                }
                Ok(())
            }
            8 => {
                let chunk_size = if self.hw_version < 3 { 64 } else { 512 };
                for (index, chunk) in data.chunks(chunk_size).enumerate() {
                    self.write_mem_8bit(address + (index * chunk_size) as u32, chunk, apsel)?;
                }
                Ok(())
            }
            other => Err(ArmError::UnsupportedTransferWidth(other)),
        }
    }
}

impl<D: StLinkUsb> Drop for StLink<D> {
    fn drop(&mut self) {
        // Errors are ignored; nothing can be done about them here.
        if self.swo_enabled {
            let _ = self.stop_trace_reception();
        }
        let _ = self.enter_idle();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Debug)]
    struct MockUsb {
        hw_version: u8,
        jtag_version: u8,
        swim_version: u8,

        target_voltage_a0: f32,
    }

    impl MockUsb {
        fn build(self) -> StLink<MockUsb> {
            StLink::new(self, "Mock ST-Link".to_string())
        }
    }

    impl StLinkUsb for MockUsb {
        fn write(
            &mut self,
            cmd: &[u8],
            _write_data: &[u8],
            read_data: &mut [u8],
            _timeout: Duration,
        ) -> Result<(), StlinkError> {
            match cmd[0] {
                commands::GET_VERSION => {
                    // [15:12] HW version, [11:6] JTAG version, [5:0] SWIM.
                    let version: u16 = ((self.hw_version as u16) << 12)
                        | ((self.jtag_version as u16) << 6)
                        | (self.swim_version as u16);

                    read_data[0] = (version >> 8) as u8;
                    read_data[1] = version as u8;
                    Ok(())
                }
                commands::GET_TARGET_VOLTAGE => {
                    read_data[0..4].copy_from_slice(&(self.target_voltage_a0 as u32).to_le_bytes());
                    read_data[4..8].copy_from_slice(&(self.target_voltage_a0 as u32).to_le_bytes());
                    Ok(())
                }
                commands::JTAG_COMMAND => {
                    // Respond with an OK status to every JTAG command.
                    if !read_data.is_empty() {
                        read_data[0] = 0x80;
                    }
                    Ok(())
                }
                _ => Ok(()),
            }
        }

        fn read_swo(
            &mut self,
            _read_data: &mut [u8],
            _timeout: Duration,
        ) -> Result<usize, StlinkError> {
            unimplemented!("Not implemented for MockUsb")
        }

        fn reset(&mut self) -> Result<(), StlinkError> {
            Ok(())
        }
    }

    #[test]
    fn detect_old_firmware() {
        let usb_mock = MockUsb {
            hw_version: 2,
            jtag_version: 20,
            swim_version: 0,
            target_voltage_a0: 1.0,
        };

        let mut probe = usb_mock.build();

        match probe.init().unwrap_err() {
            DebugProbeError::ProbeFirmwareOutdated => (),
            other => panic!("Expected firmware outdated error, got {other}"),
        }
    }

    #[test]
    fn firmware_without_multiple_ap_support() {
        let usb_mock = MockUsb {
            hw_version: 2,
            jtag_version: 26,
            swim_version: 0,
            target_voltage_a0: 1.0,
        };

        let mut probe = usb_mock.build();
        probe.init().expect("Init function failed");

        // AP 0 works on any firmware.
        probe.select_ap(0).expect("Select AP 0 failed.");

        probe
            .select_ap(1)
            .expect_err("Selecting an AP other than AP 0 should fail");
    }

    #[test]
    fn firmware_with_multiple_ap_support() {
        let usb_mock = MockUsb {
            hw_version: 2,
            jtag_version: 30,
            swim_version: 0,
            target_voltage_a0: 1.0,
        };

        let mut probe = usb_mock.build();
        probe.init().expect("Init function failed");

        probe.select_ap(0).expect("Select AP 0 failed.");
        probe
            .select_ap(1)
            .expect("Selecting an AP other than AP 0 should work");
    }

    #[test]
    fn wait_error_detection() {
        assert!(!is_wait_error(&StlinkError::BanksNotAllowedOnDpRegister));
        assert!(!is_wait_error(&StlinkError::CommandFailed(
            Status::JtagFreqNotSupported
        )));
        assert!(is_wait_error(&StlinkError::CommandFailed(
            Status::SwdDpWait
        )));
        assert!(is_wait_error(&StlinkError::CommandFailed(
            Status::SwdApWait
        )));
    }

    #[test]
    fn deferred_reads_resolve_in_issue_order() {
        let usb_mock = MockUsb {
            hw_version: 2,
            jtag_version: 30,
            swim_version: 0,
            target_voltage_a0: 1.0,
        };

        let mut probe = usb_mock.build();
        probe.init().unwrap();

        let first = probe
            .raw_read_register_deferred(RegisterAddress::Dp(0x0))
            .unwrap();
        let second = probe
            .raw_read_register_deferred(RegisterAddress::Dp(0x0))
            .unwrap();

        // The mock answers every read with zero; ordering is what matters.
        assert_eq!(probe.resolve_deferred(first).unwrap(), 0);
        assert_eq!(probe.resolve_deferred(second).unwrap(), 0);
    }
}
