//! Command bytes and status codes of the ST-Link binary protocol.

/// The command bytes understood by the ST-Link firmware.
pub mod commands {
    // Common commands.
    pub const GET_VERSION: u8 = 0xf1;
    pub const JTAG_COMMAND: u8 = 0xf2;
    pub const DFU_COMMAND: u8 = 0xf3;
    pub const SWIM_COMMAND: u8 = 0xf4;
    pub const GET_CURRENT_MODE: u8 = 0xf5;
    pub const GET_TARGET_VOLTAGE: u8 = 0xf7;
    pub const GET_VERSION_EXT: u8 = 0xfb;

    // Commands to exit other modes.
    pub const DFU_EXIT: u8 = 0x07;
    pub const SWIM_EXIT: u8 = 0x01;

    // JTAG commands.
    pub const JTAG_READMEM_32BIT: u8 = 0x07;
    pub const JTAG_WRITEMEM_32BIT: u8 = 0x08;
    pub const JTAG_READMEM_8BIT: u8 = 0x0c;
    pub const JTAG_WRITEMEM_8BIT: u8 = 0x0d;
    pub const JTAG_EXIT: u8 = 0x21;

    // Version 2 API.
    pub const JTAG_ENTER2: u8 = 0x30;
    pub const JTAG_GETLASTRWSTATUS2: u8 = 0x3e; // From V2J15
    pub const JTAG_DRIVE_NRST: u8 = 0x3c;
    pub const SWO_START_TRACE_RECEPTION: u8 = 0x40;
    pub const SWO_STOP_TRACE_RECEPTION: u8 = 0x41;
    pub const SWO_GET_TRACE_NEW_RECORD_NB: u8 = 0x42;
    pub const SWD_SET_FREQ: u8 = 0x43; // From V2J20
    pub const JTAG_SET_FREQ: u8 = 0x44; // From V2J24
    pub const JTAG_READ_DAP_REG: u8 = 0x45; // From V2J24
    pub const JTAG_WRITE_DAP_REG: u8 = 0x46; // From V2J24
    pub const JTAG_READMEM_16BIT: u8 = 0x47; // From V2J26
    pub const JTAG_WRITEMEM_16BIT: u8 = 0x48; // From V2J26
    pub const JTAG_INIT_AP: u8 = 0x4b; // From V2J28
    pub const JTAG_CLOSE_AP_DBG: u8 = 0x4c; // From V2J28
    pub const SET_COM_FREQ: u8 = 0x61; // V3 only
    pub const GET_COM_FREQ: u8 = 0x62; // V3 only

    // Parameters for JTAG_ENTER2.
    pub const JTAG_ENTER_SWD: u8 = 0xa3;
    pub const JTAG_ENTER_JTAG_NO_CORE_RESET: u8 = 0xa3;

    // Parameters for JTAG_DRIVE_NRST.
    pub const JTAG_DRIVE_NRST_LOW: u8 = 0x00;
    pub const JTAG_DRIVE_NRST_HIGH: u8 = 0x01;
    pub const JTAG_DRIVE_NRST_PULSE: u8 = 0x02;
}

/// ST-Link status codes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Status {
    JtagOk,
    JtagUnknownError,
    JtagSpiError,
    JtagDmaError,
    JtagUnknownJtagChain,
    JtagNoDeviceConnected,
    JtagInternalError,
    JtagCmdWait,
    JtagCmdError,
    JtagGetIdcodeError,
    JtagAlignmentError,
    JtagDbgPowerError,
    JtagWriteError,
    JtagWriteVerifError,
    JtagAlreadyOpenedInOtherMode,
    SwdApWait,
    SwdApFault,
    SwdApError,
    SwdApParityError,
    SwdDpWait,
    SwdDpFault,
    SwdDpError,
    SwdDpParityError,
    SwdApWdataError,
    SwdApStickyError,
    SwdApStickyorunError,
    SwoNotAvailable,
    JtagFreqNotSupported,
    JtagUnknownCmd,
    Other(u8),
}

impl From<u8> for Status {
    fn from(value: u8) -> Status {
        match value {
            0x80 => Self::JtagOk,
            0x01 => Self::JtagUnknownError,
            0x02 => Self::JtagSpiError,
            0x03 => Self::JtagDmaError,
            0x04 => Self::JtagUnknownJtagChain,
            0x05 => Self::JtagNoDeviceConnected,
            0x06 => Self::JtagInternalError,
            0x07 => Self::JtagCmdWait,
            0x08 => Self::JtagCmdError,
            0x09 => Self::JtagGetIdcodeError,
            0x0A => Self::JtagAlignmentError,
            0x0B => Self::JtagDbgPowerError,
            0x0C => Self::JtagWriteError,
            0x0D => Self::JtagWriteVerifError,
            0x0E => Self::JtagAlreadyOpenedInOtherMode,
            0x10 => Self::SwdApWait,
            0x11 => Self::SwdApFault,
            0x12 => Self::SwdApError,
            0x13 => Self::SwdApParityError,
            0x14 => Self::SwdDpWait,
            0x15 => Self::SwdDpFault,
            0x16 => Self::SwdDpError,
            0x17 => Self::SwdDpParityError,
            0x18 => Self::SwdApWdataError,
            0x19 => Self::SwdApStickyError,
            0x1A => Self::SwdApStickyorunError,
            0x20 => Self::SwoNotAvailable,
            0x41 => Self::JtagFreqNotSupported,
            0x42 => Self::JtagUnknownCmd,
            v => Self::Other(v),
        }
    }
}

/// Modes returned by `GET_CURRENT_MODE`.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Mode {
    /// Device firmware update mode.
    Dfu = 0x00,
    /// Mass storage mode.
    MassStorage = 0x01,
    /// JTAG/SWD debug mode.
    Jtag = 0x02,
    /// Single wire interface mode.
    Swim = 0x03,
}

/// Map from SWD frequency to the delay loop count of the V2 firmware.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SwdFrequencyToDelayCount {
    Hz4600000 = 0,
    Hz1800000 = 1, // Default
    Hz1200000 = 2,
    Hz950000 = 3,
    Hz650000 = 5,
    Hz480000 = 7,
    Hz400000 = 9,
    Hz360000 = 10,
    Hz240000 = 15,
    Hz150000 = 25,
    Hz125000 = 31,
    Hz100000 = 40,
}

impl SwdFrequencyToDelayCount {
    /// The setting for the given frequency in kHz, rounding down to the next
    /// supported frequency. `None` if the frequency is below all settings.
    pub(crate) fn find_setting(frequency_khz: u32) -> Option<SwdFrequencyToDelayCount> {
        Some(match frequency_khz {
            _ if frequency_khz >= 4_600 => Self::Hz4600000,
            _ if frequency_khz >= 1_800 => Self::Hz1800000,
            _ if frequency_khz >= 1_200 => Self::Hz1200000,
            _ if frequency_khz >= 950 => Self::Hz950000,
            _ if frequency_khz >= 650 => Self::Hz650000,
            _ if frequency_khz >= 480 => Self::Hz480000,
            _ if frequency_khz >= 400 => Self::Hz400000,
            _ if frequency_khz >= 360 => Self::Hz360000,
            _ if frequency_khz >= 240 => Self::Hz240000,
            _ if frequency_khz >= 150 => Self::Hz150000,
            _ if frequency_khz >= 125 => Self::Hz125000,
            _ if frequency_khz >= 100 => Self::Hz100000,
            _ => return None,
        })
    }

    /// The frequency of this setting in kHz.
    pub(crate) fn to_khz(self) -> u32 {
        match self {
            Self::Hz4600000 => 4_600,
            Self::Hz1800000 => 1_800,
            Self::Hz1200000 => 1_200,
            Self::Hz950000 => 950,
            Self::Hz650000 => 650,
            Self::Hz480000 => 480,
            Self::Hz400000 => 400,
            Self::Hz360000 => 360,
            Self::Hz240000 => 240,
            Self::Hz150000 => 150,
            Self::Hz125000 => 125,
            Self::Hz100000 => 100,
        }
    }
}

/// Map from JTAG frequency to the clock divider of the V2 firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JtagFrequencyToDivider {
    Hz18000000 = 2,
    Hz9000000 = 4,
    Hz4500000 = 8,
    Hz2250000 = 16,
    Hz1120000 = 32, // Default
    Hz560000 = 64,
    Hz280000 = 128,
    Hz140000 = 256,
}

impl JtagFrequencyToDivider {
    /// The setting for the given frequency in kHz, rounding down to the next
    /// supported frequency. `None` if the frequency is below all settings.
    pub(crate) fn find_setting(frequency_khz: u32) -> Option<Self> {
        Some(match frequency_khz {
            _ if frequency_khz >= 18_000 => Self::Hz18000000,
            _ if frequency_khz >= 9_000 => Self::Hz9000000,
            _ if frequency_khz >= 4_500 => Self::Hz4500000,
            _ if frequency_khz >= 2_250 => Self::Hz2250000,
            _ if frequency_khz >= 1_120 => Self::Hz1120000,
            _ if frequency_khz >= 560 => Self::Hz560000,
            _ if frequency_khz >= 280 => Self::Hz280000,
            _ if frequency_khz >= 140 => Self::Hz140000,
            _ => return None,
        })
    }

    /// The frequency of this setting in kHz.
    pub(crate) fn to_khz(self) -> u32 {
        match self {
            Self::Hz18000000 => 18_000,
            Self::Hz9000000 => 9_000,
            Self::Hz4500000 => 4_500,
            Self::Hz2250000 => 2_250,
            Self::Hz1120000 => 1_120,
            Self::Hz560000 => 560,
            Self::Hz280000 => 280,
            Self::Hz140000 => 140,
        }
    }
}

#[cfg(test)]
mod test {
    use super::{JtagFrequencyToDivider, SwdFrequencyToDelayCount};

    #[test]
    fn swd_speed_below_minimum_is_rejected() {
        assert!(SwdFrequencyToDelayCount::find_setting(0).is_none());
        assert!(SwdFrequencyToDelayCount::find_setting(99).is_none());
    }

    #[test]
    fn swd_speed_rounds_down() {
        assert_eq!(
            SwdFrequencyToDelayCount::find_setting(124),
            Some(SwdFrequencyToDelayCount::Hz100000)
        );
        assert_eq!(
            SwdFrequencyToDelayCount::find_setting(1_799),
            Some(SwdFrequencyToDelayCount::Hz1200000)
        );
        assert_eq!(
            SwdFrequencyToDelayCount::find_setting(u32::MAX),
            Some(SwdFrequencyToDelayCount::Hz4600000)
        );
    }

    #[test]
    fn jtag_speed_rounds_down() {
        assert!(JtagFrequencyToDivider::find_setting(139).is_none());
        assert_eq!(
            JtagFrequencyToDivider::find_setting(279),
            Some(JtagFrequencyToDivider::Hz140000)
        );
        assert_eq!(
            JtagFrequencyToDivider::find_setting(u32::MAX),
            Some(JtagFrequencyToDivider::Hz18000000)
        );
    }
}
