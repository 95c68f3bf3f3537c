//! The Flash Patch and Breakpoint unit.
//!
//! The FPB owns the hardware breakpoint comparators. It comes up disabled
//! with all comparators zeroed and is enabled lazily when the first
//! breakpoint is set. Version 1 comparators can only match addresses below
//! 0x2000_0000.

use crate::coresight::ArmError;
use crate::memory::MemoryInterface;

/// The default FP_CTRL address when no ROM table entry says otherwise.
pub const FPB_BASE: u32 = 0xE000_2000;

/// FP_CTRL offset from the unit base.
const CTRL_OFFSET: u32 = 0x0;
/// FP_COMP0 offset from the unit base.
const COMP0_OFFSET: u32 = 0x8;

/// The key bit that every FP_CTRL write must carry.
const CTRL_KEY: u32 = 1 << 1;

/// The hardware breakpoint unit of a core.
#[derive(Debug)]
pub struct Fpb {
    base: u32,
    nb_code: usize,
    nb_lit: usize,
    enabled: bool,
    /// The breakpoint address installed in each code comparator.
    comparators: Vec<Option<u32>>,
}

impl Fpb {
    /// An FPB at the given unit base address.
    pub fn new(base: u32) -> Self {
        Fpb {
            base,
            nb_code: 0,
            nb_lit: 0,
            enabled: false,
            comparators: Vec::new(),
        }
    }

    /// An FPB at the architectural default address.
    pub fn at_default_address() -> Self {
        Self::new(FPB_BASE)
    }

    /// Read the comparator counts, disable the unit and zero every
    /// comparator. The unit is re-enabled when the first breakpoint is set.
    pub fn init(&mut self, memory: &mut dyn MemoryInterface) -> Result<(), ArmError> {
        let ctrl = memory.read_word_32(self.base + CTRL_OFFSET)?;
        self.nb_code = (((ctrl >> 8) & 0x70) | ((ctrl >> 4) & 0xF)) as usize;
        self.nb_lit = ((ctrl >> 7) & 0xF) as usize;
        tracing::info!(
            "{} hardware breakpoints, {} literal comparators",
            self.nb_code,
            self.nb_lit
        );

        self.comparators = vec![None; self.nb_code];

        self.disable(memory)?;
        for index in 0..self.nb_code {
            memory.write_word_32(self.comparator_address(index), 0)?;
        }

        Ok(())
    }

    fn comparator_address(&self, index: usize) -> u32 {
        self.base + COMP0_OFFSET + 4 * index as u32
    }

    /// Turn the unit on.
    pub fn enable(&mut self, memory: &mut dyn MemoryInterface) -> Result<(), ArmError> {
        memory.write_word_32(self.base + CTRL_OFFSET, CTRL_KEY | 1)?;
        self.enabled = true;
        tracing::debug!("FPB enabled");
        Ok(())
    }

    /// Turn the unit off.
    pub fn disable(&mut self, memory: &mut dyn MemoryInterface) -> Result<(), ArmError> {
        memory.write_word_32(self.base + CTRL_OFFSET, CTRL_KEY)?;
        self.enabled = false;
        tracing::debug!("FPB disabled");
        Ok(())
    }

    /// Whether the unit is currently enabled.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// The number of instruction comparators.
    pub fn num_comparators(&self) -> usize {
        self.nb_code
    }

    /// How many comparators are free.
    pub fn available_breakpoints(&self) -> usize {
        self.comparators.iter().filter(|c| c.is_none()).count()
    }

    /// The addresses with an installed hardware breakpoint.
    pub fn installed_breakpoints(&self) -> Vec<u32> {
        self.comparators.iter().flatten().copied().collect()
    }

    /// Install a hardware breakpoint at `addr`, returning the address of the
    /// comparator register used.
    ///
    /// Returns `None` when all comparators are in use. Addresses at or above
    /// 0x2000_0000 cannot be matched by FPB version 1 and are rejected.
    pub fn set_breakpoint(
        &mut self,
        memory: &mut dyn MemoryInterface,
        addr: u32,
    ) -> Result<Option<u32>, ArmError> {
        if addr >= 0x2000_0000 {
            tracing::error!("Breakpoint out of range: {:#010x}", addr);
            return Err(ArmError::UnsupportedBreakpointAddress(addr));
        }

        if !self.enabled {
            self.enable(memory)?;
        }

        let Some(index) = self.comparators.iter().position(Option::is_none) else {
            tracing::error!("No free breakpoint comparator, dropped bp at {:#010x}", addr);
            return Ok(None);
        };

        // The comparator matches either the upper or the lower halfword of
        // the word at the address.
        let bp_match = if addr & 0x2 != 0 { 2 << 30 } else { 1 << 30 };
        memory.write_word_32(
            self.comparator_address(index),
            (addr & 0x1FFF_FFFC) | bp_match | 1,
        )?;
        self.comparators[index] = Some(addr);

        Ok(Some(self.comparator_address(index)))
    }

    /// Remove the hardware breakpoint at `addr`, if one is installed.
    pub fn remove_breakpoint(
        &mut self,
        memory: &mut dyn MemoryInterface,
        addr: u32,
    ) -> Result<(), ArmError> {
        if let Some(index) = self.comparators.iter().position(|c| *c == Some(addr)) {
            memory.write_word_32(self.comparator_address(index), 0)?;
            self.comparators[index] = None;
        }
        Ok(())
    }

    /// Remove every installed breakpoint and disable the unit.
    pub fn remove_all(&mut self, memory: &mut dyn MemoryInterface) -> Result<(), ArmError> {
        for index in 0..self.comparators.len() {
            if self.comparators[index].is_some() {
                memory.write_word_32(self.comparator_address(index), 0)?;
                self.comparators[index] = None;
            }
        }
        self.disable(memory)
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
    fn init_reads_comparator_count_and_disables() {
        let (mut dap, handle) = setup();
        let mut memory = dap.memory_interface(0).unwrap();

        let mut fpb = Fpb::at_default_address();
        fpb.init(&mut memory).unwrap();

        assert_eq!(fpb.num_comparators(), 6);
        assert_eq!(fpb.available_breakpoints(), 6);
        assert!(!handle.fpb_enabled());
    }

    #[test]
    fn first_breakpoint_enables_the_unit() {
        let (mut dap, handle) = setup();
        let mut memory = dap.memory_interface(0).unwrap();

        let mut fpb = Fpb::at_default_address();
        fpb.init(&mut memory).unwrap();

        assert!(fpb.set_breakpoint(&mut memory, 0x0800_0100).unwrap().is_some());
        assert!(handle.fpb_enabled());
        // Lower halfword: match bits 0b01.
        assert_eq!(handle.fp_comparators()[0], 0x0800_0100 | (1 << 30) | 1);
        assert_eq!(fpb.available_breakpoints(), 5);
    }

    #[test]
    fn upper_halfword_match_encoding() {
        let (mut dap, handle) = setup();
        let mut memory = dap.memory_interface(0).unwrap();

        let mut fpb = Fpb::at_default_address();
        fpb.init(&mut memory).unwrap();

        assert!(fpb.set_breakpoint(&mut memory, 0x1FFF_FFFE).unwrap().is_some());
        assert_eq!(
            handle.fp_comparators()[0],
            0x1FFF_FFFC | (2u32 << 30) | 1
        );
    }

    #[test]
    fn ram_addresses_are_rejected() {
        let (mut dap, _) = setup();
        let mut memory = dap.memory_interface(0).unwrap();

        let mut fpb = Fpb::at_default_address();
        fpb.init(&mut memory).unwrap();

        let error = fpb.set_breakpoint(&mut memory, 0x2000_0000).unwrap_err();
        assert!(matches!(
            error,
            ArmError::UnsupportedBreakpointAddress(0x2000_0000)
        ));
    }

    #[test]
    fn remove_frees_the_comparator() {
        let (mut dap, handle) = setup();
        let mut memory = dap.memory_interface(0).unwrap();

        let mut fpb = Fpb::at_default_address();
        fpb.init(&mut memory).unwrap();

        fpb.set_breakpoint(&mut memory, 0x0000_0400).unwrap();
        fpb.remove_breakpoint(&mut memory, 0x0000_0400).unwrap();

        assert_eq!(handle.fp_comparators()[0], 0);
        assert_eq!(fpb.available_breakpoints(), 6);
    }

    #[test]
    fn comparators_exhaust_gracefully() {
        let (mut dap, _) = setup();
        let mut memory = dap.memory_interface(0).unwrap();

        let mut fpb = Fpb::at_default_address();
        fpb.init(&mut memory).unwrap();

        for i in 0..6 {
            assert!(fpb
                .set_breakpoint(&mut memory, 0x1000 + i * 4)
                .unwrap()
                .is_some());
        }
        assert!(fpb.set_breakpoint(&mut memory, 0x2000).unwrap().is_none());
    }
}
