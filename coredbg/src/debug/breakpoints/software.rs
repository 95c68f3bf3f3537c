//! The software breakpoint provider: BKPT instructions patched into RAM.

use super::{Breakpoint, BreakpointKind, BreakpointProvider};
use crate::coresight::ArmError;
use crate::memory::MemoryInterface;

use std::collections::HashMap;

/// The Thumb BKPT #0 instruction.
pub const BKPT_INSTRUCTION: u16 = 0xBE00;

/// Realizes breakpoints by replacing the target halfword with BKPT.
#[derive(Debug, Default)]
pub struct SoftwareBreakpointProvider {
    /// Original instruction per patched address.
    patched: HashMap<u32, u16>,
}

impl SoftwareBreakpointProvider {
    /// A provider with no patches installed.
    pub fn new() -> Self {
        Self::default()
    }
}

impl BreakpointProvider for SoftwareBreakpointProvider {
    fn kind(&self) -> BreakpointKind {
        BreakpointKind::Sw
    }

    fn set_breakpoint(
        &mut self,
        memory: &mut dyn MemoryInterface,
        addr: u32,
    ) -> Result<Option<Breakpoint>, ArmError> {
        let original_instr = memory.read_word_16(addr)?;

        memory.write_word_16(addr, BKPT_INSTRUCTION)?;

        // Verify the write landed; some RAM-like regions are not writable.
        if memory.read_word_16(addr)? != BKPT_INSTRUCTION {
            tracing::error!("Failed to patch breakpoint instruction at {:#010x}", addr);
            return Ok(None);
        }

        self.patched.insert(addr, original_instr);
        Ok(Some(Breakpoint::Sw {
            addr,
            original_instr,
        }))
    }

    fn remove_breakpoint(
        &mut self,
        memory: &mut dyn MemoryInterface,
        breakpoint: &Breakpoint,
    ) -> Result<(), ArmError> {
        let addr = breakpoint.addr();
        if let Some(original) = self.patched.remove(&addr) {
            memory.write_word_16(addr, original)?;
        }
        Ok(())
    }

    fn do_filter_memory(&self) -> bool {
        true
    }

    fn filter_memory(&self, addr: u32, data: &mut [u8]) {
        let end = addr.wrapping_add(data.len() as u32);
        for (bp_addr, original) in &self.patched {
            let bytes = original.to_le_bytes();
            for (i, byte) in bytes.iter().enumerate() {
                let byte_addr = bp_addr.wrapping_add(i as u32);
                if byte_addr >= addr && byte_addr < end {
                    data[(byte_addr - addr) as usize] = *byte;
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn filter_handles_partial_overlap() {
        let mut provider = SoftwareBreakpointProvider::new();
        provider.patched.insert(0x2000_0000, 0x4770);

        // Buffer starting at the second byte of the patch.
        let mut data = [0xBE, 0x11, 0x22];
        provider.filter_memory(0x2000_0001, &mut data);
        assert_eq!(data, [0x47, 0x11, 0x22]);

        // Buffer ending at the first byte of the patch.
        let mut data = [0x11, 0x00];
        provider.filter_memory(0x1FFF_FFFF, &mut data);
        assert_eq!(data, [0x11, 0x70]);

        // Unrelated buffer stays untouched.
        let mut data = [0xAA, 0xBB];
        provider.filter_memory(0x2000_1000, &mut data);
        assert_eq!(data, [0xAA, 0xBB]);
    }
}
