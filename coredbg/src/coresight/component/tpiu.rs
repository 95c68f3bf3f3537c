//! The Trace Port Interface Unit.
//!
//! Configured for SWO output: NRZ pin protocol, a prescaler derived from the
//! trace clock, and formatting off so raw ITM data reaches the pin.

use crate::coresight::ArmError;
use crate::memory::MemoryInterface;

/// The default TPIU base address when no ROM table entry says otherwise.
pub const TPIU_BASE: u32 = 0xE004_0000;

/// Asynchronous clock prescaler register offset.
const ACPR_OFFSET: u32 = 0x10;
/// Selected pin protocol register offset.
const SPPR_OFFSET: u32 = 0xF0;
/// Formatter and flush control register offset.
const FFCR_OFFSET: u32 = 0x304;

/// SPPR value for UART-style NRZ framing.
const PIN_PROTOCOL_NRZ: u32 = 0x2;

/// FFCR value with the formatter disabled.
const FFCR_BYPASS: u32 = 0x100;

/// The trace port unit of a core.
#[derive(Debug)]
pub struct Tpiu {
    base: u32,
}

impl Tpiu {
    /// A TPIU at the given base address.
    pub fn new(base: u32) -> Self {
        Tpiu { base }
    }

    /// A TPIU at the architectural default address.
    pub fn at_default_address() -> Self {
        Self::new(TPIU_BASE)
    }

    /// Route trace data to the SWO pin in NRZ framing at `baud`, given the
    /// trace clock feeding the unit.
    pub fn set_swo_clock(
        &mut self,
        memory: &mut dyn MemoryInterface,
        trace_clock_hz: u32,
        baud: u32,
    ) -> Result<(), ArmError> {
        if baud == 0 || trace_clock_hz < baud {
            return Err(ArmError::Other(format!(
                "cannot derive {baud} baud from a {trace_clock_hz} Hz trace clock"
            )));
        }

        memory.write_word_32(self.base + SPPR_OFFSET, PIN_PROTOCOL_NRZ)?;
        memory.write_word_32(self.base + ACPR_OFFSET, trace_clock_hz / baud - 1)?;
        memory.write_word_32(self.base + FFCR_OFFSET, FFCR_BYPASS)?;

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::coresight::dp::DapController;
    use crate::probe::fake_probe::FakeProbe;

    #[test]
    fn swo_clock_programs_prescaler() {
        let probe = FakeProbe::new();
        let handle = probe.state_handle();
        let mut dap = DapController::new(Box::new(probe));
        dap.init().unwrap();
        dap.find_aps().unwrap();
        let mut memory = dap.memory_interface(0).unwrap();

        let mut tpiu = Tpiu::at_default_address();
        tpiu.set_swo_clock(&mut memory, 16_000_000, 2_000_000).unwrap();

        let acpr = handle.memory_contents(TPIU_BASE + ACPR_OFFSET, 4);
        assert_eq!(u32::from_le_bytes(acpr.try_into().unwrap()), 7);

        let sppr = handle.memory_contents(TPIU_BASE + SPPR_OFFSET, 4);
        assert_eq!(u32::from_le_bytes(sppr.try_into().unwrap()), PIN_PROTOCOL_NRZ);
    }

    #[test]
    fn impossible_baud_is_rejected() {
        let probe = FakeProbe::new();
        let mut dap = DapController::new(Box::new(probe));
        dap.init().unwrap();
        let mut memory = dap.memory_interface(0).unwrap();

        let mut tpiu = Tpiu::at_default_address();
        assert!(tpiu.set_swo_clock(&mut memory, 1_000, 115_200).is_err());
    }
}
