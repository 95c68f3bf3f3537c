//! The hardware breakpoint provider, backed by the FPB.

use super::{Breakpoint, BreakpointKind, BreakpointProvider};
use crate::coresight::component::Fpb;
use crate::coresight::ArmError;
use crate::memory::MemoryInterface;

/// Realizes breakpoints as FPB comparators.
#[derive(Debug)]
pub struct HardwareBreakpointProvider {
    fpb: Fpb,
}

impl HardwareBreakpointProvider {
    /// Wrap an initialized FPB.
    pub fn new(fpb: Fpb) -> Self {
        HardwareBreakpointProvider { fpb }
    }

    /// The breakpoint unit itself.
    pub fn fpb(&self) -> &Fpb {
        &self.fpb
    }

    /// The breakpoint unit itself, mutably.
    pub fn fpb_mut(&mut self) -> &mut Fpb {
        &mut self.fpb
    }
}

impl BreakpointProvider for HardwareBreakpointProvider {
    fn kind(&self) -> BreakpointKind {
        BreakpointKind::Hw
    }

    fn set_breakpoint(
        &mut self,
        memory: &mut dyn MemoryInterface,
        addr: u32,
    ) -> Result<Option<Breakpoint>, ArmError> {
        Ok(self
            .fpb
            .set_breakpoint(memory, addr)?
            .map(|comparator_addr| Breakpoint::Hw {
                comparator_addr,
                addr,
            }))
    }

    fn remove_breakpoint(
        &mut self,
        memory: &mut dyn MemoryInterface,
        breakpoint: &Breakpoint,
    ) -> Result<(), ArmError> {
        self.fpb.remove_breakpoint(memory, breakpoint.addr())
    }

    fn available_breakpoints(&self) -> Option<usize> {
        Some(self.fpb.available_breakpoints())
    }
}
