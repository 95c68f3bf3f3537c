//! The Data Watchpoint and Trace unit.
//!
//! Only the watchpoint comparators are driven here. Trace features beyond
//! enabling TRCENA belong to the trace collaborators.

use crate::coresight::ArmError;
use crate::memory::MemoryInterface;

/// The default DWT_CTRL address when no ROM table entry says otherwise.
pub const DWT_BASE: u32 = 0xE000_1000;

/// Offset of the first comparator block from the unit base.
const COMP0_OFFSET: u32 = 0x20;
/// Stride of one comparator block (COMP, MASK, FUNCTION, reserved).
const COMP_BLOCK_SIZE: u32 = 0x10;
const MASK_OFFSET: u32 = 0x4;
const FUNCTION_OFFSET: u32 = 0x8;

// A local copy of DEMCR, needed to gate the whole unit. Keeping it here
// avoids a dependency on the core module.
const DEMCR: u32 = 0xE000_EDFC;
const DEMCR_TRCENA: u32 = 1 << 24;

/// What kind of accesses a watchpoint matches, as FUNCTION codes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WatchpointKind {
    /// Break on read access.
    Read = 5,
    /// Break on write access.
    Write = 6,
    /// Break on any access.
    ReadWrite = 7,
}

/// An installed watchpoint.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Watchpoint {
    /// The watched address.
    pub addr: u32,
    /// The watched range size in bytes, a power of two.
    pub size: u32,
    /// The kind of accesses that trigger.
    pub kind: WatchpointKind,
}

#[derive(Debug, Copy, Clone)]
struct Comparator {
    addr: u32,
    size: u32,
    func: u32,
}

/// The watchpoint unit of a core.
#[derive(Debug)]
pub struct Dwt {
    base: u32,
    comparators: Vec<Comparator>,
}

impl Dwt {
    /// A DWT at the given unit base address.
    pub fn new(base: u32) -> Self {
        Dwt {
            base,
            comparators: Vec::new(),
        }
    }

    /// A DWT at the architectural default address.
    pub fn at_default_address() -> Self {
        Self::new(DWT_BASE)
    }

    /// Enable the trace subsystem, read the comparator count and park every
    /// comparator.
    pub fn init(&mut self, memory: &mut dyn MemoryInterface) -> Result<(), ArmError> {
        let demcr = memory.read_word_32(DEMCR)?;
        memory.write_word_32(DEMCR, demcr | DEMCR_TRCENA)?;

        let ctrl = memory.read_word_32(self.base)?;
        let watchpoint_count = ((ctrl >> 28) & 0xF) as usize;
        tracing::info!("{} hardware watchpoints", watchpoint_count);

        self.comparators = vec![
            Comparator {
                addr: 0,
                size: 0,
                func: 0,
            };
            watchpoint_count
        ];
        for index in 0..watchpoint_count {
            memory.write_word_32(self.function_address(index), 0)?;
        }

        Ok(())
    }

    fn comparator_address(&self, index: usize) -> u32 {
        self.base + COMP0_OFFSET + COMP_BLOCK_SIZE * index as u32
    }

    fn function_address(&self, index: usize) -> u32 {
        self.comparator_address(index) + FUNCTION_OFFSET
    }

    /// The number of comparators the unit implements.
    pub fn num_comparators(&self) -> usize {
        self.comparators.len()
    }

    fn find(&self, addr: u32, size: u32, kind: WatchpointKind) -> Option<usize> {
        self.comparators
            .iter()
            .position(|c| c.addr == addr && c.size == size && c.func == kind as u32)
    }

    /// Install a watchpoint on `size` bytes at `addr`.
    ///
    /// `size` must be a power of two and supported by the device; the MASK
    /// register is verified by reading it back. Setting an already installed
    /// watchpoint again succeeds without touching the hardware. Returns
    /// `false` when all comparators are in use.
    pub fn set_watchpoint(
        &mut self,
        memory: &mut dyn MemoryInterface,
        watchpoint: Watchpoint,
    ) -> Result<bool, ArmError> {
        let Watchpoint { addr, size, kind } = watchpoint;

        if self.find(addr, size, kind).is_some() {
            return Ok(true);
        }

        if !size.is_power_of_two() {
            return Err(ArmError::Other(format!(
                "watchpoint size {size} is not a power of two"
            )));
        }

        let Some(index) = self.comparators.iter().position(|c| c.func == 0) else {
            tracing::error!("No free watchpoint comparator, dropped watch at {:#010x}", addr);
            return Ok(false);
        };

        // MASK holds log2 of the range size; a readback mismatch means the
        // device does not implement enough mask bits for this size.
        let mask = size.trailing_zeros();
        memory.write_word_32(self.comparator_address(index) + MASK_OFFSET, mask)?;
        if memory.read_word_32(self.comparator_address(index) + MASK_OFFSET)? != mask {
            tracing::error!("Watchpoint of size {} not supported by device", size);
            return Err(ArmError::Other(format!(
                "watchpoint size {size} not supported by the device"
            )));
        }

        memory.write_word_32(self.comparator_address(index), addr)?;
        memory.write_word_32(self.function_address(index), kind as u32)?;

        self.comparators[index] = Comparator {
            addr,
            size,
            func: kind as u32,
        };

        Ok(true)
    }

    /// Remove a watchpoint previously installed with the same parameters.
    pub fn remove_watchpoint(
        &mut self,
        memory: &mut dyn MemoryInterface,
        watchpoint: Watchpoint,
    ) -> Result<(), ArmError> {
        let Some(index) = self.find(watchpoint.addr, watchpoint.size, watchpoint.kind) else {
            return Ok(());
        };

        memory.write_word_32(self.function_address(index), 0)?;
        self.comparators[index].func = 0;
        Ok(())
    }

    /// Remove every installed watchpoint.
    pub fn remove_all(&mut self, memory: &mut dyn MemoryInterface) -> Result<(), ArmError> {
        for index in 0..self.comparators.len() {
            if self.comparators[index].func != 0 {
                memory.write_word_32(self.function_address(index), 0)?;
                self.comparators[index].func = 0;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::coresight::dp::DapController;
    use crate::probe::fake_probe::{FakeProbe, FakeStateHandle};

    fn setup() -> (DapController, FakeStateHandle) {
        let probe = FakeProbe::new();
        let handle = probe.state_handle();
        let mut dap = DapController::new(Box::new(probe));
        dap.init().unwrap();
        dap.find_aps().unwrap();
        (dap, handle)
    }

    #[test]
    fn init_enables_trace_and_counts_comparators() {
        let (mut dap, _) = setup();
        let mut memory = dap.memory_interface(0).unwrap();

        let mut dwt = Dwt::at_default_address();
        dwt.init(&mut memory).unwrap();
        assert_eq!(dwt.num_comparators(), 4);

        // TRCENA must be on for the DWT to function at all.
        let demcr = memory.read_word_32(DEMCR).unwrap();
        assert_ne!(demcr & DEMCR_TRCENA, 0);
    }

    #[test]
    fn watchpoint_programs_comp_mask_function() {
        let (mut dap, handle) = setup();
        let mut memory = dap.memory_interface(0).unwrap();

        let mut dwt = Dwt::at_default_address();
        dwt.init(&mut memory).unwrap();

        let watch = Watchpoint {
            addr: 0x2000_0010,
            size: 4,
            kind: WatchpointKind::Write,
        };
        assert!(dwt.set_watchpoint(&mut memory, watch).unwrap());

        let (comp, mask, function) = handle.dwt_comparator(0);
        assert_eq!(comp, 0x2000_0010);
        assert_eq!(mask, 2);
        assert_eq!(function, 6);
    }

    #[test]
    fn duplicate_watchpoint_is_a_no_op() {
        let (mut dap, _) = setup();
        let mut memory = dap.memory_interface(0).unwrap();

        let mut dwt = Dwt::at_default_address();
        dwt.init(&mut memory).unwrap();

        let watch = Watchpoint {
            addr: 0x2000_0000,
            size: 1,
            kind: WatchpointKind::Read,
        };
        assert!(dwt.set_watchpoint(&mut memory, watch).unwrap());
        assert!(dwt.set_watchpoint(&mut memory, watch).unwrap());

        // Both calls target comparator 0; comparator 1 is untouched.
        assert_eq!(dwt.comparators[1].func, 0);
    }

    #[test]
    fn unsupported_sizes_are_rejected() {
        let (mut dap, _) = setup();
        let mut memory = dap.memory_interface(0).unwrap();

        let mut dwt = Dwt::at_default_address();
        dwt.init(&mut memory).unwrap();

        // Not a power of two.
        assert!(dwt
            .set_watchpoint(
                &mut memory,
                Watchpoint {
                    addr: 0,
                    size: 3,
                    kind: WatchpointKind::Read,
                }
            )
            .is_err());

        // Beyond the mask range of the fake device.
        assert!(dwt
            .set_watchpoint(
                &mut memory,
                Watchpoint {
                    addr: 0,
                    size: 1 << 20,
                    kind: WatchpointKind::Read,
                }
            )
            .is_err());
    }

    #[test]
    fn remove_clears_function() {
        let (mut dap, handle) = setup();
        let mut memory = dap.memory_interface(0).unwrap();

        let mut dwt = Dwt::at_default_address();
        dwt.init(&mut memory).unwrap();

        let watch = Watchpoint {
            addr: 0x2000_0020,
            size: 2,
            kind: WatchpointKind::ReadWrite,
        };
        dwt.set_watchpoint(&mut memory, watch).unwrap();
        dwt.remove_watchpoint(&mut memory, watch).unwrap();

        let (_, _, function) = handle.dwt_comparator(0);
        assert_eq!(function, 0);
    }
}
