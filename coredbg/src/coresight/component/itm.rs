//! The Instrumentation Trace Macrocell.
//!
//! Enough of the ITM is driven to route software stimulus ports into the
//! trace stream; decoding the stream is a collaborator's job.

use crate::coresight::ArmError;
use crate::memory::MemoryInterface;

/// The default ITM base address when no ROM table entry says otherwise.
pub const ITM_BASE: u32 = 0xE000_0000;

/// Stimulus port enable register offset.
const TER_OFFSET: u32 = 0xE00;
/// Trace control register offset.
const TCR_OFFSET: u32 = 0xE80;
/// Lock access register offset.
const LAR_OFFSET: u32 = 0xFB0;

/// The CoreSight lock access key.
const LAR_KEY: u32 = 0xC5AC_CE55;

const TCR_ITMENA: u32 = 1 << 0;
const TCR_TSENA: u32 = 1 << 1;
const TCR_TXENA: u32 = 1 << 3;
const TCR_TRACE_BUS_ID_SHIFT: u32 = 16;

/// The instrumentation trace unit of a core.
#[derive(Debug)]
pub struct Itm {
    base: u32,
}

impl Itm {
    /// An ITM at the given base address.
    pub fn new(base: u32) -> Self {
        Itm { base }
    }

    /// An ITM at the architectural default address.
    pub fn at_default_address() -> Self {
        Self::new(ITM_BASE)
    }

    /// Unlock the unit and enable all stimulus ports with trace bus id 1.
    pub fn enable(&mut self, memory: &mut dyn MemoryInterface) -> Result<(), ArmError> {
        memory.write_word_32(self.base + LAR_OFFSET, LAR_KEY)?;

        // All 32 stimulus ports.
        memory.write_word_32(self.base + TER_OFFSET, 0xFFFF_FFFF)?;

        let tcr = TCR_ITMENA | TCR_TSENA | TCR_TXENA | (1 << TCR_TRACE_BUS_ID_SHIFT);
        memory.write_word_32(self.base + TCR_OFFSET, tcr)?;

        Ok(())
    }

    /// Disable the unit and its stimulus ports.
    pub fn disable(&mut self, memory: &mut dyn MemoryInterface) -> Result<(), ArmError> {
        memory.write_word_32(self.base + TER_OFFSET, 0)?;
        memory.write_word_32(self.base + TCR_OFFSET, 0)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::coresight::dp::DapController;
    use crate::probe::fake_probe::FakeProbe;

    #[test]
    fn enable_unlocks_and_programs_tcr() {
        let probe = FakeProbe::new();
        let handle = probe.state_handle();
        let mut dap = DapController::new(Box::new(probe));
        dap.init().unwrap();
        dap.find_aps().unwrap();
        let mut memory = dap.memory_interface(0).unwrap();

        let mut itm = Itm::at_default_address();
        itm.enable(&mut memory).unwrap();

        let lar = handle.memory_contents(ITM_BASE + LAR_OFFSET, 4);
        assert_eq!(u32::from_le_bytes(lar.try_into().unwrap()), LAR_KEY);

        let tcr = handle.memory_contents(ITM_BASE + TCR_OFFSET, 4);
        let tcr = u32::from_le_bytes(tcr.try_into().unwrap());
        assert_ne!(tcr & TCR_ITMENA, 0);
        assert_eq!((tcr >> 16) & 0x7F, 1);
    }
}
