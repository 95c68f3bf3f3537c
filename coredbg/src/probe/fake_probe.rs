//! A probe that emulates a small Cortex-M target behind a MEM-AP.
//!
//! The fake target implements just enough of the DP, one MEM-AP and the
//! memory-mapped debug peripherals (DHCSR/DCRSR/DFSR/DEMCR/AIRCR, FPB, DWT,
//! CPACR) that the layers above can be exercised without hardware. Every
//! register-level operation is recorded, and the emulated state stays
//! reachable through a shared handle after the probe has been boxed away.

use crate::coresight::{ArmError, DapError};
use crate::probe::{
    DebugProbe, DebugProbeError, DeferredResult, ProbeCapabilities, RawDapAccess, RegisterAddress,
    WireProtocol,
};

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

const DHCSR: u32 = 0xE000_EDF0;
const DCRSR: u32 = 0xE000_EDF4;
const DCRDR: u32 = 0xE000_EDF8;
const DEMCR: u32 = 0xE000_EDFC;
const DFSR: u32 = 0xE000_ED30;
const CPUID: u32 = 0xE000_ED00;
const AIRCR: u32 = 0xE000_ED0C;
const CPACR: u32 = 0xE000_ED88;
const FP_CTRL: u32 = 0xE000_2000;
const FP_COMP_BASE: u32 = 0xE000_2008;
const DWT_CTRL: u32 = 0xE000_1000;
const DWT_COMP_BASE: u32 = 0xE000_1020;

const NUM_FP_COMPARATORS: usize = 6;
const NUM_DWT_COMPARATORS: usize = 4;

/// One recorded transport operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeOperation {
    /// A DP register read.
    ReadDp(u8),
    /// A DP register write.
    WriteDp(u8, u32),
    /// An AP register read.
    ReadAp(u8, u8),
    /// An AP register write.
    WriteAp(u8, u8, u32),
    /// A block read of `usize` words from an AP register.
    BlockRead(u8, u8, usize),
    /// A block write of `usize` words to an AP register.
    BlockWrite(u8, u8, usize),
}

/// The emulated core behind the fake MEM-AP.
#[derive(Debug)]
struct FakeCore {
    halted: bool,
    debug_enabled: bool,
    maskints: bool,
    reset_pending_status: bool,
    dfsr: u32,
    demcr: u32,
    dcrdr: u32,
    cpacr: u32,
    cpuid: u32,
    fpu_present: bool,
    /// Register file keyed by DCRSR selector.
    registers: HashMap<u16, u32>,
    fp_ctrl_enable: bool,
    fp_comps: [u32; NUM_FP_COMPARATORS],
    dwt_comps: [[u32; 3]; NUM_DWT_COMPARATORS],
    /// Largest value the DWT MASK registers hold.
    dwt_max_mask: u32,
}

impl FakeCore {
    fn new() -> Self {
        Self {
            halted: false,
            debug_enabled: false,
            maskints: false,
            reset_pending_status: false,
            dfsr: 0,
            demcr: 0,
            dcrdr: 0,
            cpacr: 0,
            // Cortex-M4 r0p1.
            cpuid: 0x410F_C241,
            fpu_present: false,
            registers: HashMap::new(),
            fp_ctrl_enable: false,
            fp_comps: [0; NUM_FP_COMPARATORS],
            dwt_comps: [[0; 3]; NUM_DWT_COMPARATORS],
            dwt_max_mask: 15,
        }
    }

    fn reg(&self, selector: u16) -> u32 {
        self.registers.get(&selector).copied().unwrap_or(0)
    }
}

/// The complete emulated target state.
#[derive(Debug)]
pub struct FakeState {
    dpidr: u32,
    ctrl_stat: u32,
    select: u32,

    csw: u32,
    tar: u32,
    ap_base: u32,
    ap_idr: u32,

    memory: HashMap<u32, u8>,
    core: FakeCore,

    /// Addresses whose access raises a FAULT response.
    fault_addresses: Vec<u32>,

    /// All register-level operations, in wire order.
    pub operations: Vec<FakeOperation>,

    /// SWJ bit sequences clocked out, as `(bit_len, bits)` pairs.
    pub swj_sequences: Vec<(u8, u64)>,
}

impl FakeState {
    fn new() -> Self {
        FakeState {
            // DPv1, designer ARM.
            dpidr: 0x0BB1_1477,
            ctrl_stat: 0,
            select: 0,
            // AHB MEM-AP on a Cortex-M4.
            ap_idr: 0x2477_0011,
            // Debug base address with format and present bits.
            ap_base: 0xE00F_F003,
            csw: 0,
            tar: 0,
            memory: HashMap::new(),
            core: FakeCore::new(),
            fault_addresses: Vec::new(),
            operations: Vec::new(),
            swj_sequences: Vec::new(),
        }
    }

    fn peek8(&self, address: u32) -> u8 {
        self.memory.get(&address).copied().unwrap_or(0)
    }

    fn peek32(&self, address: u32) -> u32 {
        u32::from_le_bytes([
            self.peek8(address),
            self.peek8(address + 1),
            self.peek8(address + 2),
            self.peek8(address + 3),
        ])
    }

    fn poke32(&mut self, address: u32, value: u32) {
        for (i, byte) in value.to_le_bytes().iter().enumerate() {
            self.memory.insert(address + i as u32, *byte);
        }
    }

    /// Reset the emulated core: registers to reset values, sticky reset
    /// status set, halted when reset vector catch is armed.
    fn reset_core(&mut self) {
        let initial_sp = self.peek32(0x0);
        let reset_vector = self.peek32(0x4);

        self.core.registers.clear();
        self.core.registers.insert(13, initial_sp);
        self.core.registers.insert(15, reset_vector & !1);
        self.core.registers.insert(14, 0xFFFF_FFFF);
        self.core.registers.insert(16, 0x0100_0000);
        self.core.reset_pending_status = true;

        // DEMCR.VC_CORERESET halts the core right out of reset.
        if self.core.demcr & 1 != 0 {
            self.core.halted = true;
            self.core.dfsr |= 1 << 3;
        } else {
            self.core.halted = false;
        }

        self.core.fp_ctrl_enable = false;
        self.core.fp_comps = [0; NUM_FP_COMPARATORS];
    }

    fn read_debug_register(&mut self, address: u32) -> u32 {
        match address {
            DHCSR => {
                let mut value = 0u32;
                if self.core.debug_enabled {
                    value |= 1 << 0;
                }
                if self.core.maskints {
                    value |= 1 << 3;
                }
                // S_REGRDY: register transfers complete instantly here.
                value |= 1 << 16;
                if self.core.halted {
                    // The core auto-sets C_HALT when it enters debug state.
                    value |= (1 << 17) | (1 << 1);
                }
                if self.core.reset_pending_status {
                    value |= 1 << 25;
                    // Sticky: cleared by the read.
                    self.core.reset_pending_status = false;
                }
                value
            }
            DCRDR => self.core.dcrdr,
            DFSR => self.core.dfsr,
            DEMCR => self.core.demcr,
            CPUID => self.core.cpuid,
            CPACR => {
                if self.core.fpu_present {
                    self.core.cpacr
                } else {
                    self.core.cpacr & !(0xF << 20)
                }
            }
            FP_CTRL => {
                // Six instruction comparators, no literal comparators, rev 0.
                let mut value = (NUM_FP_COMPARATORS as u32) << 4;
                if self.core.fp_ctrl_enable {
                    value |= 1;
                }
                value
            }
            addr if (FP_COMP_BASE..FP_COMP_BASE + 4 * NUM_FP_COMPARATORS as u32)
                .contains(&addr) =>
            {
                self.core.fp_comps[((addr - FP_COMP_BASE) / 4) as usize]
            }
            DWT_CTRL => (NUM_DWT_COMPARATORS as u32) << 28,
            addr if (DWT_COMP_BASE..DWT_COMP_BASE + 16 * NUM_DWT_COMPARATORS as u32)
                .contains(&addr) =>
            {
                let unit = ((addr - DWT_COMP_BASE) / 16) as usize;
                let reg = ((addr - DWT_COMP_BASE) % 16 / 4) as usize;
                if reg < 3 {
                    self.core.dwt_comps[unit][reg]
                } else {
                    0
                }
            }
            _ => self.peek32(address),
        }
    }

    fn write_debug_register(&mut self, address: u32, value: u32) {
        match address {
            DHCSR => {
                // Writes without the debug key are ignored.
                if value >> 16 != 0xA05F {
                    return;
                }
                let debugen = value & (1 << 0) != 0;
                let halt = value & (1 << 1) != 0;
                let step = value & (1 << 2) != 0;
                let maskints = value & (1 << 3) != 0;

                self.core.debug_enabled = debugen;
                self.core.maskints = maskints;

                if !debugen {
                    // Without halting debug the core cannot stay halted.
                    self.core.halted = false;
                    return;
                }

                if halt && !self.core.halted {
                    self.core.halted = true;
                    self.core.dfsr |= 1 << 0;
                } else if step && self.core.halted && !halt {
                    // One instruction retires, then the core halts again.
                    let pc = self.core.reg(15);
                    self.core.registers.insert(15, pc.wrapping_add(2));
                    self.core.dfsr |= 1 << 0;
                } else if !halt && !step {
                    self.core.halted = false;
                }
            }
            DCRSR => {
                let selector = (value & 0x7F) as u16;
                if value & (1 << 16) != 0 {
                    self.core.registers.insert(selector, self.core.dcrdr);
                } else {
                    self.core.dcrdr = self.core.reg(selector);
                }
            }
            DCRDR => self.core.dcrdr = value,
            DFSR => {
                // Write one to clear.
                self.core.dfsr &= !value;
            }
            DEMCR => self.core.demcr = value,
            AIRCR => {
                if value >> 16 != 0x05FA {
                    return;
                }
                // SYSRESETREQ or VECTRESET.
                if value & (1 << 2) != 0 || value & (1 << 0) != 0 {
                    self.reset_core();
                }
            }
            CPACR => self.core.cpacr = value,
            FP_CTRL => {
                // The key bit must be set for the write to take effect.
                if value & (1 << 1) != 0 {
                    self.core.fp_ctrl_enable = value & 1 != 0;
                }
            }
            addr if (FP_COMP_BASE..FP_COMP_BASE + 4 * NUM_FP_COMPARATORS as u32)
                .contains(&addr) =>
            {
                self.core.fp_comps[((addr - FP_COMP_BASE) / 4) as usize] = value;
            }
            addr if (DWT_COMP_BASE..DWT_COMP_BASE + 16 * NUM_DWT_COMPARATORS as u32)
                .contains(&addr) =>
            {
                let unit = ((addr - DWT_COMP_BASE) / 16) as usize;
                let reg = ((addr - DWT_COMP_BASE) % 16 / 4) as usize;
                if reg < 3 {
                    let value = if reg == 1 {
                        // MASK is limited by the device.
                        value.min(self.core.dwt_max_mask)
                    } else {
                        value
                    };
                    self.core.dwt_comps[unit][reg] = value;
                }
            }
            _ => self.poke32(address, value),
        }
    }

    /// Transfer size in bytes, from the CSW SIZE field.
    fn csw_size(&self) -> u32 {
        match self.csw & 0x7 {
            0 => 1,
            1 => 2,
            _ => 4,
        }
    }

    fn csw_increments(&self) -> bool {
        (self.csw >> 4) & 0x3 != 0
    }

    fn check_fault(&mut self, address: u32) -> Result<(), DapError> {
        if self.fault_addresses.contains(&address) {
            // STICKYERR in CTRL/STAT.
            self.ctrl_stat |= 1 << 5;
            return Err(DapError::FaultResponse);
        }
        Ok(())
    }

    fn drw_read(&mut self) -> Result<u32, DapError> {
        let tar = self.tar;
        self.check_fault(tar)?;
        let size = self.csw_size();

        let aligned = tar & !3;
        let value = if aligned >= 0xE000_0000 {
            self.read_debug_register(aligned)
        } else {
            self.peek32(aligned)
        };

        // Sub-word reads are replicated on their byte lanes.
        let lane_shift = (tar & 3) * 8;
        let value = match size {
            1 => ((value >> lane_shift) & 0xFF) << lane_shift,
            2 => ((value >> lane_shift) & 0xFFFF) << lane_shift,
            _ => value,
        };

        if self.csw_increments() {
            self.tar = tar.wrapping_add(size);
        }

        Ok(value)
    }

    fn drw_write(&mut self, value: u32) -> Result<(), DapError> {
        let tar = self.tar;
        self.check_fault(tar)?;
        let size = self.csw_size();
        let aligned = tar & !3;

        match size {
            4 => {
                if aligned >= 0xE000_0000 {
                    self.write_debug_register(aligned, value);
                } else {
                    self.poke32(aligned, value);
                }
            }
            _ => {
                let lane_shift = (tar & 3) * 8;
                let data = value >> lane_shift;
                for i in 0..size {
                    self.memory
                        .insert(tar.wrapping_add(i), (data >> (i * 8)) as u8);
                }
            }
        }

        if self.csw_increments() {
            self.tar = tar.wrapping_add(size);
        }

        Ok(())
    }

    fn ap_read(&mut self, apsel: u8, address: u8) -> Result<u32, DapError> {
        if apsel != 0 {
            // Only one AP exists; everything else reads as zero.
            return Ok(0);
        }
        match address {
            0x00 => Ok(self.csw),
            0x04 => Ok(self.tar),
            0x0C => self.drw_read(),
            0xF8 => Ok(self.ap_base),
            0xFC => Ok(self.ap_idr),
            _ => Ok(0),
        }
    }

    fn ap_write(&mut self, apsel: u8, address: u8, value: u32) -> Result<(), DapError> {
        if apsel != 0 {
            return Ok(());
        }
        match address {
            0x00 => self.csw = value,
            0x04 => self.tar = value,
            0x0C => self.drw_write(value)?,
            _ => {}
        }
        Ok(())
    }

    fn dp_read(&mut self, address: u8) -> u32 {
        match address {
            0x0 => self.dpidr,
            0x4 => self.ctrl_stat,
            0x8 => self.select,
            _ => 0,
        }
    }

    fn dp_write(&mut self, address: u8, value: u32) {
        match address {
            0x0 => {
                // ABORT: STKERRCLR clears the sticky error.
                if value & (1 << 2) != 0 {
                    self.ctrl_stat &= !(1 << 5);
                }
            }
            0x4 => {
                // Power-up requests are acknowledged immediately.
                let mut ctrl = value;
                if ctrl & (1 << 28) != 0 {
                    ctrl |= 1 << 29;
                }
                if ctrl & (1 << 30) != 0 {
                    ctrl |= 1 << 31;
                }
                self.ctrl_stat = (self.ctrl_stat & (1 << 5)) | ctrl;
            }
            0x8 => self.select = value,
            _ => {}
        }
    }
}

/// A cloneable view on the state of a [`FakeProbe`], usable after the probe
/// itself has been boxed and moved into the stack under test.
#[derive(Clone, Debug)]
pub struct FakeStateHandle(Arc<Mutex<FakeState>>);

impl FakeStateHandle {
    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.0.lock().unwrap()
    }

    /// The recorded transport operations, in wire order.
    pub fn operations(&self) -> Vec<FakeOperation> {
        self.lock().operations.clone()
    }

    /// The SWJ bit sequences clocked out, as `(bit_len, bits)` pairs.
    pub fn swj_sequences(&self) -> Vec<(u8, u64)> {
        self.lock().swj_sequences.clone()
    }

    /// Forget all recorded operations.
    pub fn clear_operations(&self) {
        self.lock().operations.clear();
    }

    /// Preload `data` into the emulated memory at `address`.
    pub fn load_memory(&self, address: u32, data: &[u8]) {
        let mut state = self.lock();
        for (i, byte) in data.iter().enumerate() {
            state.memory.insert(address + i as u32, *byte);
        }
    }

    /// Read back `len` bytes of emulated memory, bypassing the wire.
    pub fn memory_contents(&self, address: u32, len: usize) -> Vec<u8> {
        let state = self.lock();
        (0..len).map(|i| state.peek8(address + i as u32)).collect()
    }

    /// Make any access to `address` respond with a FAULT.
    pub fn add_fault_address(&self, address: u32) {
        self.lock().fault_addresses.push(address);
    }

    /// Stop faulting accesses to `address`.
    pub fn clear_fault_address(&self, address: u32) {
        self.lock().fault_addresses.retain(|a| *a != address);
    }

    /// Give the emulated core a floating point unit.
    pub fn set_fpu_present(&self, present: bool) {
        self.lock().core.fpu_present = present;
    }

    /// Replace the emulated CPUID value.
    pub fn set_cpuid(&self, cpuid: u32) {
        self.lock().core.cpuid = cpuid;
    }

    /// Whether the emulated core is currently halted.
    pub fn core_halted(&self) -> bool {
        self.lock().core.halted
    }

    /// A core register value, bypassing the wire.
    pub fn core_register(&self, selector: u16) -> u32 {
        self.lock().core.reg(selector)
    }

    /// Set a core register value, bypassing the wire.
    pub fn set_core_register(&self, selector: u16, value: u32) {
        self.lock().core.registers.insert(selector, value);
    }

    /// Halt the emulated core directly, as if it hit an event, setting the
    /// given DFSR bits.
    pub fn halt_core(&self, dfsr_bits: u32) {
        let mut state = self.lock();
        state.core.halted = true;
        state.core.dfsr |= dfsr_bits;
    }

    /// The FP comparator values.
    pub fn fp_comparators(&self) -> Vec<u32> {
        self.lock().core.fp_comps.to_vec()
    }

    /// Whether the FPB is enabled.
    pub fn fpb_enabled(&self) -> bool {
        self.lock().core.fp_ctrl_enable
    }

    /// The (COMP, MASK, FUNCTION) triple of a DWT comparator.
    pub fn dwt_comparator(&self, unit: usize) -> (u32, u32, u32) {
        let comps = self.lock().core.dwt_comps[unit];
        (comps[0], comps[1], comps[2])
    }
}

/// A fake debug probe backed by an emulated target.
#[derive(Debug)]
pub struct FakeProbe {
    name: String,
    speed_khz: u32,
    protocol: Option<WireProtocol>,
    reset_asserted: bool,

    state: Arc<Mutex<FakeState>>,

    results: VecDeque<Result<u32, DapError>>,
    next_slot: usize,
    resolved_slot: usize,
}

impl Default for FakeProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeProbe {
    /// A fake probe with an empty memory and a Cortex-M4 style core.
    pub fn new() -> Self {
        FakeProbe {
            name: "Fake probe".to_string(),
            speed_khz: 1_000,
            protocol: None,
            reset_asserted: false,
            state: Arc::new(Mutex::new(FakeState::new())),
            results: VecDeque::new(),
            next_slot: 0,
            resolved_slot: 0,
        }
    }

    /// A handle on the emulated state that stays valid after the probe has
    /// been moved into a session or controller.
    pub fn state_handle(&self) -> FakeStateHandle {
        FakeStateHandle(Arc::clone(&self.state))
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    fn execute_read(&mut self, address: RegisterAddress) -> Result<u32, DapError> {
        let mut state = self.state();
        match address {
            RegisterAddress::Dp(addr) => {
                state.operations.push(FakeOperation::ReadDp(addr));
                Ok(state.dp_read(addr))
            }
            RegisterAddress::Ap { apsel, address } => {
                state.operations.push(FakeOperation::ReadAp(apsel, address));
                state.ap_read(apsel, address)
            }
        }
    }
}

impl RawDapAccess for FakeProbe {
    fn raw_read_register_deferred(
        &mut self,
        address: RegisterAddress,
    ) -> Result<DeferredResult, ArmError> {
        let result = self.execute_read(address);
        let slot = self.next_slot;
        self.next_slot += 1;
        self.results.push_back(result);
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
        let mut state = self.state();
        match address {
            RegisterAddress::Dp(addr) => {
                state.operations.push(FakeOperation::WriteDp(addr, value));
                state.dp_write(addr, value);
                Ok(())
            }
            RegisterAddress::Ap { apsel, address } => {
                state
                    .operations
                    .push(FakeOperation::WriteAp(apsel, address, value));
                state.ap_write(apsel, address, value).map_err(Into::into)
            }
        }
    }

    fn raw_read_block(
        &mut self,
        address: RegisterAddress,
        values: &mut [u32],
    ) -> Result<(), ArmError> {
        let RegisterAddress::Ap { apsel, address } = address else {
            return Err(ArmError::Other("block reads target AP registers".to_string()));
        };
        let mut state = self.state();
        state
            .operations
            .push(FakeOperation::BlockRead(apsel, address, values.len()));
        for value in values.iter_mut() {
            *value = state.ap_read(apsel, address)?;
        }
        Ok(())
    }

    fn raw_write_block(&mut self, address: RegisterAddress, values: &[u32]) -> Result<(), ArmError> {
        let RegisterAddress::Ap { apsel, address } = address else {
            return Err(ArmError::Other("block writes target AP registers".to_string()));
        };
        let mut state = self.state();
        state
            .operations
            .push(FakeOperation::BlockWrite(apsel, address, values.len()));
        for value in values {
            state.ap_write(apsel, address, *value)?;
        }
        Ok(())
    }

    fn raw_flush(&mut self) -> Result<(), ArmError> {
        Ok(())
    }
}

impl DebugProbe for FakeProbe {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> ProbeCapabilities {
        let mut caps = ProbeCapabilities::default();
        caps.set_swd(true);
        caps.set_banked_dp_registers(true);
        caps
    }

    fn speed_khz(&self) -> u32 {
        self.speed_khz
    }

    fn set_speed(&mut self, speed_khz: u32) -> Result<u32, DebugProbeError> {
        self.speed_khz = speed_khz;
        Ok(speed_khz)
    }

    fn attach(
        &mut self,
        protocol: Option<WireProtocol>,
    ) -> Result<WireProtocol, DebugProbeError> {
        let protocol = protocol.unwrap_or(WireProtocol::Swd);
        self.protocol = Some(protocol);
        Ok(protocol)
    }

    fn detach(&mut self) -> Result<(), DebugProbeError> {
        self.protocol = None;
        Ok(())
    }

    fn active_protocol(&self) -> Option<WireProtocol> {
        self.protocol
    }

    fn swj_sequence(&mut self, bit_len: u8, bits: u64) -> Result<(), DebugProbeError> {
        self.state().swj_sequences.push((bit_len, bits));
        Ok(())
    }

    fn assert_reset(&mut self, assert: bool) -> Result<(), DebugProbeError> {
        if assert && !self.reset_asserted {
            self.state().reset_core();
        }
        self.reset_asserted = assert;
        Ok(())
    }

    fn is_reset_asserted(&self) -> bool {
        self.reset_asserted
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn dp_powerup_acks_track_requests() {
        let mut probe = FakeProbe::new();
        probe
            .raw_write_register(RegisterAddress::Dp(0x4), (1 << 28) | (1 << 30))
            .unwrap();
        let ctrl = probe.raw_read_register(RegisterAddress::Dp(0x4)).unwrap();
        assert_ne!(ctrl & (1 << 29), 0);
        assert_ne!(ctrl & (1 << 31), 0);
    }

    #[test]
    fn drw_autoincrement_advances_tar() {
        let mut probe = FakeProbe::new();
        probe
            .state_handle()
            .load_memory(0x2000_0000, &[1, 2, 3, 4, 5, 6, 7, 8]);

        // CSW: word size, single auto-increment.
        probe
            .raw_write_register(RegisterAddress::Ap { apsel: 0, address: 0x00 }, 0x12)
            .unwrap();
        probe
            .raw_write_register(RegisterAddress::Ap { apsel: 0, address: 0x04 }, 0x2000_0000)
            .unwrap();

        let drw = RegisterAddress::Ap { apsel: 0, address: 0x0C };
        assert_eq!(probe.raw_read_register(drw).unwrap(), 0x0403_0201);
        assert_eq!(probe.raw_read_register(drw).unwrap(), 0x0807_0605);
    }

    #[test]
    fn fault_addresses_set_sticky_error() {
        let mut probe = FakeProbe::new();
        probe.state_handle().add_fault_address(0xE004_0000);

        probe
            .raw_write_register(RegisterAddress::Ap { apsel: 0, address: 0x00 }, 0x12)
            .unwrap();
        probe
            .raw_write_register(RegisterAddress::Ap { apsel: 0, address: 0x04 }, 0xE004_0000)
            .unwrap();

        let drw = RegisterAddress::Ap { apsel: 0, address: 0x0C };
        assert!(probe.raw_read_register(drw).is_err());

        let ctrl = probe.raw_read_register(RegisterAddress::Dp(0x4)).unwrap();
        assert_ne!(ctrl & (1 << 5), 0, "sticky error must be set");
    }

    #[test]
    fn dhcsr_write_without_key_is_ignored() {
        let mut probe = FakeProbe::new();
        probe
            .raw_write_register(RegisterAddress::Ap { apsel: 0, address: 0x00 }, 0x12)
            .unwrap();
        probe
            .raw_write_register(RegisterAddress::Ap { apsel: 0, address: 0x04 }, DHCSR)
            .unwrap();
        probe
            .raw_write_register(RegisterAddress::Ap { apsel: 0, address: 0x0C }, 0b11)
            .unwrap();
        assert!(!probe.state_handle().core_halted());
    }
}
