//! Cortex-M core services: execution control, register access, breakpoints
//! and watchpoints.

use super::registers::{cfbp_shift, psr_mask, RegisterCatalog, RegisterValue, CFBP_INDEX, XPSR_INDEX};
use super::{CoreState, CortexMClass, CpuId, HaltReason, ResetType, RunKind, VectorCatch};
use crate::coresight::component::{Dwt, Fpb, Watchpoint, WatchpointKind};
use crate::coresight::component::dwt::DWT_BASE;
use crate::coresight::component::fpb::FPB_BASE;
use crate::coresight::{ApMemory, ArmError, DapController};
use crate::debug::breakpoints::{
    BreakpointKind, BreakpointManager, HardwareBreakpointProvider, SoftwareBreakpointProvider,
};
use crate::event::{DebugEvent, EventHub};
use crate::memory::MemoryInterface;
use crate::sequence::DebugSequence;
use crate::target::MemoryMap;

use bitfield::bitfield;

use std::sync::Arc;
use std::time::{Duration, Instant};

const DHCSR: u32 = 0xE000_EDF0;
const DCRSR: u32 = 0xE000_EDF4;
const DCRDR: u32 = 0xE000_EDF8;
const DEMCR: u32 = 0xE000_EDFC;
const DFSR: u32 = 0xE000_ED30;
const CPUID: u32 = 0xE000_ED00;
const AIRCR: u32 = 0xE000_ED0C;
const VTOR: u32 = 0xE000_ED08;
const ICSR: u32 = 0xE000_ED04;
const CPACR: u32 = 0xE000_ED88;
const ICTR: u32 = 0xE000_E004;
const NVIC_ICER0: u32 = 0xE000_E180;
const NVIC_ICPR0: u32 = 0xE000_E280;
const NVIC_IPR0: u32 = 0xE000_E400;
const SYSTICK_CSR: u32 = 0xE000_E010;

/// The REGWnR bit of DCRSR selecting a write transfer.
const DCRSR_REGWNR: u32 = 1 << 16;

/// The CP10/CP11 full-access bits of CPACR.
const CPACR_CP10_CP11: u32 = 0xF << 20;

/// The thumb bit of xPSR.
const XPSR_THUMB: u32 = 1 << 24;

/// The VC_* bits of DEMCR.
const DEMCR_VC_MASK: u32 = 0x7F1;

bitfield! {
    /// Debug Halting Control and Status Register.
    ///
    /// Writes only take effect with the debug key set; see
    /// [`Dhcsr::enable_write`].
    #[derive(Copy, Clone)]
    pub struct Dhcsr(u32);
    impl Debug;
    /// The core has been reset since the last read; sticky, cleared by the
    /// read.
    pub s_reset_st, _: 25;
    /// An instruction has retired since the last read; sticky.
    pub s_retire_st, _: 24;
    /// The core is locked up on an unrecoverable exception.
    pub s_lockup, _: 19;
    /// The core is sleeping.
    pub s_sleep, _: 18;
    /// The core is in debug state.
    pub s_halt, _: 17;
    /// A DCRSR transfer has completed.
    pub s_regrdy, _: 16;
    /// Mask PendSV, SysTick and external interrupts. Only changes together
    /// with C_HALT set in the same write.
    pub c_maskints, set_c_maskints: 3;
    /// Single step enable.
    pub c_step, set_c_step: 2;
    /// Halt request.
    pub c_halt, set_c_halt: 1;
    /// Halting debug enable.
    pub c_debugen, set_c_debugen: 0;
}

impl Dhcsr {
    /// Put the debug key into bits [31:16], enabling the write.
    pub fn enable_write(&mut self) {
        self.0 &= !(0xFFFF << 16);
        self.0 |= 0xA05F << 16;
    }
}

impl From<u32> for Dhcsr {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<Dhcsr> for u32 {
    fn from(value: Dhcsr) -> Self {
        value.0
    }
}

bitfield! {
    /// Debug Fault Status Register. All bits are sticky and write-one-to-clear.
    #[derive(Copy, Clone)]
    pub struct Dfsr(u32);
    impl Debug;
    /// A PMU counter overflow event.
    pub pmu, _: 5;
    /// The external debug request signal.
    pub external, _: 4;
    /// A vector catch triggered.
    pub vcatch, _: 3;
    /// The DWT generated a debug event.
    pub dwttrap, _: 2;
    /// A breakpoint halted the core.
    pub bkpt, _: 1;
    /// A halt request (or step completion) halted the core.
    pub halted, _: 0;
}

impl Dfsr {
    /// A value clearing every sticky bit.
    fn clear_all() -> u32 {
        0x3F
    }

    /// The halt reason encoded in these bits.
    fn halt_reason(&self) -> HaltReason {
        if self.bkpt() {
            HaltReason::Breakpoint
        } else if self.dwttrap() {
            HaltReason::Watchpoint
        } else if self.vcatch() {
            HaltReason::VectorCatch
        } else if self.external() {
            HaltReason::External
        } else if self.pmu() {
            HaltReason::Pmu
        } else {
            HaltReason::Debug
        }
    }
}

impl From<u32> for Dfsr {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

bitfield! {
    /// Application Interrupt and Reset Control Register.
    ///
    /// [`Aircr::vectkey`] must be called before the value is written.
    #[derive(Copy, Clone)]
    pub struct Aircr(u32);
    impl Debug;
    /// The vector key field.
    u16, get_vectkey, set_vectkey: 31, 16;
    /// Request a system reset from the external system.
    pub sysresetreq, set_sysresetreq: 2;
    /// Clear active exception state.
    pub vectclractive, set_vectclractive: 1;
    /// Request a local core reset (v7-M only).
    pub vectreset, set_vectreset: 0;
}

impl Aircr {
    /// Put the key 0x05FA into the VECTKEY field.
    pub fn vectkey(&mut self) {
        self.set_vectkey(0x05FA);
    }
}

impl From<Aircr> for u32 {
    fn from(value: Aircr) -> Self {
        value.0
    }
}

fn is_double_index(index: i32) -> bool {
    (-0x5F..=-0x40).contains(&index)
}

fn is_cfbp_index(index: i32) -> bool {
    (-4..=-1).contains(&index)
}

fn is_psr_index(index: i32) -> bool {
    (0x10000..=0x10007).contains(&index)
}

/// The persistent state of one Cortex-M core.
///
/// A [`Core`] handle borrows this together with the session's DAP controller
/// for the duration of an operation.
#[derive(Debug)]
pub struct CortexMState {
    pub(crate) core_number: usize,
    pub(crate) apsel: u8,
    initialized: bool,

    cpuid: CpuId,
    class: CortexMClass,
    fpu_present: bool,
    supports_vectreset: bool,

    default_reset_type: ResetType,
    default_software_reset_type: ResetType,

    registers: RegisterCatalog,
    target_xml: String,

    fpb_base: u32,
    dwt_base: u32,
    pub(crate) dwt: Dwt,
    pub(crate) breakpoints: BreakpointManager,

    reset_catch_saved_demcr: Option<u32>,
    reset_catch_delegated: bool,
}

impl CortexMState {
    /// State for core `core_number` behind the MEM-AP with `apsel`.
    pub fn new(core_number: usize, apsel: u8) -> Self {
        CortexMState {
            core_number,
            apsel,
            initialized: false,
            cpuid: CpuId(0),
            class: CortexMClass::V7M,
            fpu_present: false,
            supports_vectreset: false,
            default_reset_type: ResetType::Sw,
            default_software_reset_type: ResetType::SwSysresetreq,
            registers: RegisterCatalog::for_core(true, false),
            target_xml: String::new(),
            fpb_base: FPB_BASE,
            dwt_base: DWT_BASE,
            dwt: Dwt::at_default_address(),
            breakpoints: BreakpointManager::new(),
            reset_catch_saved_demcr: None,
            reset_catch_delegated: false,
        }
    }

    /// Use component base addresses discovered in the ROM table instead of
    /// the architectural defaults. Must run before init.
    pub fn set_component_bases(&mut self, fpb: Option<u32>, dwt: Option<u32>) {
        if let Some(fpb) = fpb {
            self.fpb_base = fpb;
        }
        if let Some(dwt) = dwt {
            self.dwt_base = dwt;
        }
    }

    /// The default reset type used when none is requested.
    pub fn set_default_reset_type(&mut self, reset_type: ResetType) {
        self.default_reset_type = reset_type;
    }

    /// The software reset type [`ResetType::Sw`] resolves to.
    pub fn set_default_software_reset_type(&mut self, reset_type: ResetType) {
        self.default_software_reset_type = reset_type;
    }

    /// Whether this core has a floating point unit.
    pub fn has_fpu(&self) -> bool {
        self.fpu_present
    }

    /// The decoded CPUID.
    pub fn cpuid(&self) -> CpuId {
        self.cpuid
    }

    /// The register catalog of this core.
    pub fn registers(&self) -> &RegisterCatalog {
        &self.registers
    }

    /// The GDB target description XML built at init.
    pub fn target_xml(&self) -> &str {
        &self.target_xml
    }
}

/// A live handle on one core, borrowed from the session.
pub struct Core<'s> {
    pub(crate) state: &'s mut CortexMState,
    pub(crate) dap: &'s mut DapController,
    pub(crate) memory_map: &'s MemoryMap,
    pub(crate) sequence: &'s Arc<dyn DebugSequence>,
    pub(crate) events: &'s mut EventHub,
}

impl Core<'_> {
    fn memory(dap: &mut DapController, apsel: u8) -> Result<ApMemory<'_>, ArmError> {
        dap.memory_interface(apsel)
    }

    /// The number of this core.
    pub fn core_number(&self) -> usize {
        self.state.core_number
    }

    /// Discover the core's identity and bring up its debug units.
    ///
    /// Reads and decodes CPUID, probes for an FPU through CPACR, builds the
    /// register catalog and target XML, and initializes the FPB and DWT.
    pub fn init(&mut self) -> Result<(), ArmError> {
        if self.state.initialized {
            return Ok(());
        }

        let mut memory = Self::memory(self.dap, self.state.apsel)?;

        self.sequence.will_start_debug_core(&mut memory)?;

        // Identify the core.
        let cpuid = CpuId(memory.read_word_32(CPUID)?);
        let class = cpuid.class();
        tracing::info!(
            "CPU core is {} r{}p{}",
            cpuid.part_name(),
            cpuid.variant(),
            cpuid.revision()
        );
        self.state.supports_vectreset = cpuid.supports_vectreset();

        // FPU presence check: the CP10/CP11 access bits only take writes
        // when the coprocessors exist. v6-M has no coprocessor space.
        let fpu_present = if class == CortexMClass::V7M {
            let original_cpacr = memory.read_word_32(CPACR)?;
            memory.write_word_32(CPACR, original_cpacr | CPACR_CP10_CP11)?;
            let probed = memory.read_word_32(CPACR)?;
            memory.write_word_32(CPACR, original_cpacr)?;
            probed & CPACR_CP10_CP11 == CPACR_CP10_CP11
        } else {
            false
        };
        if fpu_present {
            tracing::info!("FPU present");
        }

        self.state.cpuid = cpuid;
        self.state.class = class;
        self.state.fpu_present = fpu_present;
        self.state.registers =
            RegisterCatalog::for_core(class == CortexMClass::V7M, fpu_present);
        self.state.target_xml = self.state.registers.target_xml();

        // Bring up the breakpoint and watchpoint units.
        let mut fpb = Fpb::new(self.state.fpb_base);
        fpb.init(&mut memory)?;
        self.state
            .breakpoints
            .add_provider(Box::new(HardwareBreakpointProvider::new(fpb)));
        self.state
            .breakpoints
            .add_provider(Box::new(SoftwareBreakpointProvider::new()));

        self.state.dwt = Dwt::new(self.state.dwt_base);
        self.state.dwt.init(&mut memory)?;

        self.sequence.did_start_debug_core(&mut memory)?;

        self.state.initialized = true;
        Ok(())
    }

    /// Stop debugging this core: remove all breakpoints and watchpoints and
    /// disable halting debug. Errors are reported but not propagated, so a
    /// dead link cannot prevent shutdown.
    pub fn stop_debugging(&mut self) {
        self.events.notify(&DebugEvent::PreDisconnect);

        let result = (|| -> Result<(), ArmError> {
            let mut memory = Self::memory(self.dap, self.state.apsel)?;
            self.state.breakpoints.remove_all_breakpoints(&mut memory)?;
            self.state.dwt.remove_all(&mut memory)?;
            self.sequence.will_stop_debug_core(&mut memory)?;

            let mut dhcsr = Dhcsr(0);
            dhcsr.enable_write();
            memory.write_word_32(DHCSR, dhcsr.into())?;
            memory.flush()
        })();

        if let Err(e) = result {
            tracing::warn!("Error while stopping core debug: {}", e);
        }
    }

    /// The execution state, decoded from DHCSR.
    pub fn get_state(&mut self) -> Result<CoreState, ArmError> {
        let mut memory = Self::memory(self.dap, self.state.apsel)?;
        let dhcsr = Dhcsr(memory.read_word_32(DHCSR)?);

        if dhcsr.s_reset_st() {
            // S_RESET_ST means "was reset since the last read". Only a
            // re-read showing it still set with no instructions retired
            // proves the core is actually held in reset.
            let second = Dhcsr(memory.read_word_32(DHCSR)?);
            if second.s_reset_st() && !second.s_retire_st() {
                return Ok(CoreState::Reset);
            }
        }

        Ok(if dhcsr.s_lockup() {
            CoreState::Lockup
        } else if dhcsr.s_sleep() {
            CoreState::Sleeping
        } else if dhcsr.s_halt() {
            CoreState::Halted
        } else {
            CoreState::Running
        })
    }

    /// Whether the core is halted.
    pub fn is_halted(&mut self) -> Result<bool, ArmError> {
        Ok(self.get_state()? == CoreState::Halted)
    }

    /// Why the core halted, decoded from the sticky DFSR bits.
    pub fn get_halt_reason(&mut self) -> Result<HaltReason, ArmError> {
        let mut memory = Self::memory(self.dap, self.state.apsel)?;
        let dfsr = Dfsr(memory.read_word_32(DFSR)?);
        Ok(dfsr.halt_reason())
    }

    /// Request a halt and wait for the core to enter debug state.
    pub fn halt(&mut self) -> Result<(), ArmError> {
        tracing::debug!("halting core {}", self.state.core_number);
        self.events.notify(&DebugEvent::PreHalt);

        let mut memory = Self::memory(self.dap, self.state.apsel)?;
        let mut dhcsr = Dhcsr(0);
        dhcsr.set_c_debugen(true);
        dhcsr.set_c_halt(true);
        dhcsr.enable_write();
        memory.write_word_32(DHCSR, dhcsr.into())?;
        memory.flush()?;

        wait_for_halt(&mut memory, Duration::from_secs(2))?;

        self.events.notify(&DebugEvent::PostHalt);
        Ok(())
    }

    /// Clear the sticky debug-cause bits in DFSR.
    fn clear_debug_cause_bits(memory: &mut ApMemory<'_>) -> Result<(), ArmError> {
        memory.write_word_32(DFSR, Dfsr::clear_all())
    }

    /// Resume execution. Pending breakpoint changes are flushed first.
    pub fn resume(&mut self) -> Result<(), ArmError> {
        if self.get_state()? != CoreState::Halted {
            tracing::debug!("cannot resume: target not halted");
            return Ok(());
        }

        tracing::debug!("resuming core {}", self.state.core_number);

        // Breakpoint changes reach the target before it runs again.
        {
            let mut memory = Self::memory(self.dap, self.state.apsel)?;
            self.state
                .breakpoints
                .flush(&mut memory, self.memory_map, false)?;
        }

        self.events.notify(&DebugEvent::PreRun(RunKind::Resume));

        let mut memory = Self::memory(self.dap, self.state.apsel)?;
        Self::clear_debug_cause_bits(&mut memory)?;

        let mut dhcsr = Dhcsr(0);
        dhcsr.set_c_debugen(true);
        dhcsr.enable_write();
        memory.write_word_32(DHCSR, dhcsr.into())?;
        memory.flush()?;

        self.events.notify(&DebugEvent::PostRun(RunKind::Resume));
        Ok(())
    }

    /// Perform an instruction level step, preserving the previous interrupt
    /// mask state.
    ///
    /// With a non-empty range, stepping repeats while the program counter
    /// stays inside `[start, end)` and no breakpoint or watchpoint event is
    /// recorded.
    pub fn step(&mut self, disable_interrupts: bool, start: u32, end: u32) -> Result<(), ArmError> {
        let dhcsr = {
            let mut memory = Self::memory(self.dap, self.state.apsel)?;
            Dhcsr(memory.read_word_32(DHCSR)?)
        };
        if !dhcsr.s_halt() {
            return Err(ArmError::CoreNotHalted);
        }

        tracing::debug!("step core {}", self.state.core_number);

        // Breakpoint changes reach the target before stepping.
        {
            let mut memory = Self::memory(self.dap, self.state.apsel)?;
            self.state
                .breakpoints
                .flush(&mut memory, self.memory_map, true)?;
        }

        self.events.notify(&DebugEvent::PreRun(RunKind::Step));

        {
            let mut memory = Self::memory(self.dap, self.state.apsel)?;
            Self::clear_debug_cause_bits(&mut memory)?;
        }

        let interrupts_masked = dhcsr.c_maskints();

        // C_MASKINTS only changes while C_HALT is set in the same write.
        if !interrupts_masked && disable_interrupts {
            let mut memory = Self::memory(self.dap, self.state.apsel)?;
            let mut value = Dhcsr(0);
            value.set_c_debugen(true);
            value.set_c_halt(true);
            value.set_c_maskints(true);
            value.enable_write();
            memory.write_word_32(DHCSR, value.into())?;
        }

        loop {
            {
                let mut memory = Self::memory(self.dap, self.state.apsel)?;
                let mut value = Dhcsr(0);
                value.set_c_debugen(true);
                value.set_c_step(true);
                value.set_c_maskints(disable_interrupts || interrupts_masked);
                value.enable_write();
                memory.write_word_32(DHCSR, value.into())?;

                // Wait for the halt to auto set after the instruction.
                let started = Instant::now();
                while !Dhcsr(memory.read_word_32(DHCSR)?).c_halt() {
                    if started.elapsed() > Duration::from_secs(2) {
                        return Err(ArmError::Timeout);
                    }
                }
            }

            // An empty range degenerates to a single step.
            if start == end {
                break;
            }

            let pc = self.read_core_register_raw(15)? as u32;
            if pc < start || end <= pc {
                break;
            }

            // Stop on any other halt source inside the range.
            let mut memory = Self::memory(self.dap, self.state.apsel)?;
            let dfsr = Dfsr(memory.read_word_32(DFSR)?);
            if dfsr.dwttrap() || dfsr.bkpt() {
                break;
            }
        }

        // Restore the previous mask state, again with C_HALT set.
        if !interrupts_masked && disable_interrupts {
            let mut memory = Self::memory(self.dap, self.state.apsel)?;
            let mut value = Dhcsr(0);
            value.set_c_debugen(true);
            value.set_c_halt(true);
            value.enable_write();
            memory.write_word_32(DHCSR, value.into())?;
            memory.flush()?;
        }

        self.events.notify(&DebugEvent::PostRun(RunKind::Step));
        Ok(())
    }

    /// Resolve the requested reset type against the defaults and the core's
    /// capabilities.
    fn actual_reset_type(&self, requested: Option<ResetType>) -> ResetType {
        let mut reset_type = requested.unwrap_or(self.state.default_reset_type);

        if reset_type == ResetType::Sw {
            reset_type = self.state.default_software_reset_type;
        }

        // Only v7-M implements VECTRESET; fall back to the emulated reset.
        if reset_type == ResetType::SwVectreset && !self.state.supports_vectreset {
            tracing::debug!("VECTRESET not supported; using emulated reset");
            reset_type = ResetType::SwEmulated;
        }

        reset_type
    }

    fn perform_reset(&mut self, reset_type: ResetType) -> Result<(), ArmError> {
        match reset_type {
            ResetType::Hw => {
                self.dap.reset()?;
                Ok(())
            }
            ResetType::SwEmulated => self.perform_emulated_reset(),
            ResetType::SwSysresetreq | ResetType::SwVectreset => {
                let mut aircr = Aircr(0);
                aircr.vectkey();
                if reset_type == ResetType::SwSysresetreq {
                    aircr.set_sysresetreq(true);
                } else {
                    aircr.set_vectreset(true);
                }

                let mut memory = Self::memory(self.dap, self.state.apsel)?;
                // The reset may tear the link down mid-write; that is fine.
                let _ = memory.write_word_32(AIRCR, aircr.into());
                let _ = memory.flush();
                Ok(())
            }
            ResetType::Sw => unreachable!("resolved by actual_reset_type"),
        }
    }

    /// Emulate a reset by writing registers and scrubbing the NVIC and
    /// SysTick.
    ///
    /// This does not set DHCSR.S_RESET_ST or DFSR.VCATCH. Whether the core
    /// stays halted afterwards follows DEMCR.VC_CORERESET, matching the
    /// behavior of a caught architectural reset.
    fn perform_emulated_reset(&mut self) -> Result<(), ArmError> {
        self.halt()?;

        let vector_base = {
            let mut memory = Self::memory(self.dap, self.state.apsel)?;
            match self.memory_map.boot_memory() {
                Some(region) => region.range.start,
                // Without a boot region the current VTOR at least points at
                // a valid table.
                None => memory.read_word_32(VTOR)?,
            }
        };

        let (initial_sp, initial_pc) = {
            let mut memory = Self::memory(self.dap, self.state.apsel)?;
            (
                memory.read_word_32(vector_base)?,
                memory.read_word_32(vector_base + 4)?,
            )
        };

        // Core registers to reset values.
        let mut regs: Vec<i32> = (0..=12).collect();
        let mut values: Vec<u64> = vec![0; 13];
        regs.extend_from_slice(&[18, 17, 14, 15, XPSR_INDEX, CFBP_INDEX]);
        values.extend_from_slice(&[
            0,                    // PSP
            u64::from(initial_sp), // MSP
            0xFFFF_FFFF,          // LR
            u64::from(initial_pc), // PC
            0x0100_0000,          // xPSR
            0,                    // CFBP
        ]);
        // SP mirrors MSP out of reset.
        regs.push(13);
        values.push(u64::from(initial_sp));

        if self.state.fpu_present {
            for s in 0x40..=0x5F {
                regs.push(s);
                values.push(0);
            }
            regs.push(33);
            values.push(0);
        }

        self.write_core_registers_raw(&regs, &values)?;

        let mut memory = Self::memory(self.dap, self.state.apsel)?;

        // System control space to reset values.
        memory.write_word_32(ICSR, (1 << 27) | (1 << 25))?; // PENDSVCLR | PENDSTCLR
        memory.write_word_32(VTOR, vector_base)?;
        let mut aircr = Aircr(0);
        aircr.vectkey();
        aircr.set_vectclractive(true);
        memory.write_word_32(AIRCR, aircr.into())?;
        memory.write_word_32(CPACR, 0)?;

        // SysTick off.
        memory.write_32(SYSTICK_CSR, &[0, 0, 0])?;

        // NVIC: clear enables and pendings, priorities back to zero.
        let num_regs = (memory.read_word_32(ICTR)? & 0xF) as usize + 1;
        memory.write_32(NVIC_ICER0, &vec![0xFFFF_FFFF; num_regs])?;
        memory.write_32(NVIC_ICPR0, &vec![0xFFFF_FFFF; num_regs])?;
        memory.write_32(NVIC_IPR0, &vec![0; num_regs * 8])?;

        // VC_CORERESET decides whether a caught reset stays halted.
        let demcr = memory.read_word_32(DEMCR)?;
        if demcr & 1 == 0 {
            let mut dhcsr = Dhcsr(0);
            dhcsr.set_c_debugen(true);
            dhcsr.enable_write();
            memory.write_word_32(DHCSR, dhcsr.into())?;
        }

        Ok(())
    }

    /// Reset the core and let it run.
    pub fn reset(&mut self, requested: Option<ResetType>) -> Result<(), ArmError> {
        let reset_type = self.actual_reset_type(requested);
        tracing::debug!(
            "reset core {}, type {:?}",
            self.state.core_number,
            reset_type
        );

        self.events.notify(&DebugEvent::PreReset(reset_type));

        let delegated = {
            let mut memory = Self::memory(self.dap, self.state.apsel)?;
            self.sequence.will_reset(&mut memory, reset_type)?
        };
        if !delegated {
            self.perform_reset(reset_type)?;
        }
        {
            let mut memory = Self::memory(self.dap, self.state.apsel)?;
            self.sequence.did_reset(&mut memory, reset_type)?;
        }

        // Wait for the system to come out of reset: keep reading DHCSR until
        // S_RESET_ST clears. The target may be unreachable for a moment, so
        // transport errors inside the window are tolerated.
        let start = Instant::now();
        while start.elapsed() < Duration::from_secs(2) {
            let mut memory = Self::memory(self.dap, self.state.apsel)?;
            match memory.read_word_32(DHCSR) {
                Ok(dhcsr) if !Dhcsr(dhcsr).s_reset_st() => break,
                Ok(_) => std::thread::sleep(Duration::from_millis(10)),
                Err(_) => {
                    let _ = memory.flush();
                    std::thread::sleep(Duration::from_millis(10));
                }
            }
        }

        self.events.notify(&DebugEvent::PostReset(reset_type));
        Ok(())
    }

    /// Arm halt-on-reset.
    fn set_reset_catch(&mut self, reset_type: ResetType) -> Result<(), ArmError> {
        tracing::debug!("set reset catch, core {}", self.state.core_number);

        let delegated = {
            let mut memory = Self::memory(self.dap, self.state.apsel)?;
            self.sequence.set_reset_catch(&mut memory, reset_type)?
        };
        self.state.reset_catch_delegated = delegated;
        if delegated {
            return Ok(());
        }

        self.halt()?;

        let mut memory = Self::memory(self.dap, self.state.apsel)?;
        let demcr = memory.read_word_32(DEMCR)?;
        self.state.reset_catch_saved_demcr = Some(demcr);

        if demcr & 1 == 0 {
            memory.write_word_32(DEMCR, demcr | 1)?;
        }
        Ok(())
    }

    /// Disarm halt-on-reset and restore DEMCR.
    fn clear_reset_catch(&mut self, reset_type: ResetType) -> Result<(), ArmError> {
        tracing::debug!("clear reset catch, core {}", self.state.core_number);

        let mut memory = Self::memory(self.dap, self.state.apsel)?;
        self.sequence.clear_reset_catch(&mut memory, reset_type)?;

        if !self.state.reset_catch_delegated {
            if let Some(demcr) = self.state.reset_catch_saved_demcr.take() {
                memory.write_word_32(DEMCR, demcr)?;
            }
        }
        Ok(())
    }

    /// Reset the core and halt it on the reset handler.
    pub fn reset_and_halt(&mut self, requested: Option<ResetType>) -> Result<(), ArmError> {
        let reset_type = self.actual_reset_type(requested);

        self.set_reset_catch(reset_type)?;
        self.reset(Some(reset_type))?;

        // Wait until the caught reset settles into a stable state.
        let start = Instant::now();
        while start.elapsed() < Duration::from_secs(2) {
            let state = self.get_state()?;
            if !matches!(state, CoreState::Reset | CoreState::Running) {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        // Make sure the thumb bit is set in case the reset handler points at
        // an invalid address.
        let xpsr = self.read_core_register_raw(XPSR_INDEX)? as u32;
        if xpsr & XPSR_THUMB == 0 {
            self.write_core_register_raw(XPSR_INDEX, u64::from(xpsr | XPSR_THUMB))?;
        }

        self.clear_reset_catch(reset_type)?;
        Ok(())
    }

    /// Read one core register by name, with type conversion for FP
    /// registers.
    pub fn read_core_register(&mut self, name: &str) -> Result<RegisterValue, ArmError> {
        let info = *self
            .state
            .registers
            .by_name(name)
            .ok_or_else(|| ArmError::Other(format!("unknown register '{name}'")))?;
        let raw = self.read_core_register_raw(info.index)?;
        Ok(RegisterValue::from_raw(&info, raw))
    }

    /// Write one core register by name, accepting floats for FP registers.
    pub fn write_core_register(
        &mut self,
        name: &str,
        value: RegisterValue,
    ) -> Result<(), ArmError> {
        let info = *self
            .state
            .registers
            .by_name(name)
            .ok_or_else(|| ArmError::Other(format!("unknown register '{name}'")))?;
        self.write_core_register_raw(info.index, value.to_raw(&info))
    }

    /// Read one register as its raw bit pattern.
    pub fn read_core_register_raw(&mut self, index: i32) -> Result<u64, ArmError> {
        Ok(self.read_core_registers_raw(&[index])?[0])
    }

    /// Write one register from its raw bit pattern.
    pub fn write_core_register_raw(&mut self, index: i32, value: u64) -> Result<(), ArmError> {
        self.write_core_registers_raw(&[index], &[value])
    }

    fn validate_registers(&self, reg_list: &[i32]) -> Result<(), ArmError> {
        for index in reg_list {
            if self.state.registers.by_index(*index).is_none() {
                return Err(ArmError::Other(format!(
                    "register index {index:#x} not available on this core"
                )));
            }
        }
        Ok(())
    }

    /// Read several core registers as raw bit patterns.
    pub fn read_core_registers_raw(&mut self, reg_list: &[i32]) -> Result<Vec<u64>, ArmError> {
        self.validate_registers(reg_list)?;

        // Doubles become two single-precision reads.
        let mut expanded = Vec::with_capacity(reg_list.len());
        for reg in reg_list {
            if is_double_index(*reg) {
                expanded.push(-*reg);
                expanded.push(-*reg + 1);
            } else {
                expanded.push(*reg);
            }
        }

        let raw = self.read_raw_list(&expanded)?;

        let mut out = Vec::with_capacity(reg_list.len());
        let mut cursor = 0;
        for reg in reg_list {
            if is_double_index(*reg) {
                let low = u64::from(raw[cursor]);
                let high = u64::from(raw[cursor + 1]);
                cursor += 2;
                out.push((high << 32) | low);
            } else {
                out.push(u64::from(raw[cursor]));
                cursor += 1;
            }
        }
        Ok(out)
    }

    /// The DCRSR-driven read loop: all selector writes and status reads are
    /// issued first, then the values are demanded in order.
    fn read_raw_list(&mut self, reg_list: &[i32]) -> Result<Vec<u32>, ArmError> {
        let apsel = self.state.apsel;
        let mut memory = Self::memory(self.dap, apsel)?;

        let mut pending = Vec::with_capacity(reg_list.len());
        for reg in reg_list {
            let selector = if is_cfbp_index(*reg) {
                CFBP_INDEX as u32
            } else if is_psr_index(*reg) {
                XPSR_INDEX as u32
            } else {
                *reg as u32
            };

            memory.write_word_32(DCRSR, selector)?;

            let dhcsr = memory.read_word_32_deferred(DHCSR)?;
            let value = memory.read_word_32_deferred(DCRDR)?;
            pending.push((dhcsr, value));
        }

        let mut results = Vec::with_capacity(reg_list.len());
        for (reg, (dhcsr, value)) in reg_list.iter().zip(pending) {
            let dhcsr = Dhcsr(memory.resolve(dhcsr)?);
            let mut value = memory.resolve(value)?;

            if !dhcsr.s_regrdy() {
                // The transfer lagged behind the pipeline; poll it out.
                wait_for_regrdy(&mut memory)?;
                value = memory.read_word_32(DCRDR)?;
            }

            if is_cfbp_index(*reg) {
                value = (value >> cfbp_shift(*reg)) & 0xFF;
            } else if is_psr_index(*reg) {
                value &= psr_mask(*reg);
            }

            results.push(value);
        }

        Ok(results)
    }

    /// Write several core registers from raw bit patterns.
    pub fn write_core_registers_raw(
        &mut self,
        reg_list: &[i32],
        values: &[u64],
    ) -> Result<(), ArmError> {
        assert_eq!(reg_list.len(), values.len());
        self.validate_registers(reg_list)?;

        // CFBP and xPSR subfields modify a full shared register; fetch the
        // current values once.
        let mut cfbp = if reg_list.iter().any(|r| is_cfbp_index(*r)) {
            Some(self.read_raw_list(&[CFBP_INDEX])?[0])
        } else {
            None
        };
        let mut xpsr = if reg_list.iter().any(|r| is_psr_index(*r)) {
            Some(self.read_raw_list(&[XPSR_INDEX])?[0])
        } else {
            None
        };

        let mut writes: Vec<(u32, u32)> = Vec::with_capacity(reg_list.len());
        for (reg, value) in reg_list.iter().zip(values) {
            if is_double_index(*reg) {
                // A double is two consecutive single-precision writes.
                writes.push(((-*reg) as u32, *value as u32));
                writes.push(((-*reg + 1) as u32, (*value >> 32) as u32));
            } else if is_cfbp_index(*reg) {
                let shift = cfbp_shift(*reg);
                let current = cfbp.expect("read above");
                let merged = (current & !(0xFF << shift)) | ((*value as u32 & 0xFF) << shift);
                cfbp = Some(merged);
                writes.push((CFBP_INDEX as u32, merged));
            } else if is_psr_index(*reg) {
                let mask = psr_mask(*reg);
                let current = xpsr.expect("read above");
                let merged = (current & !mask) | (*value as u32 & mask);
                xpsr = Some(merged);
                writes.push((XPSR_INDEX as u32, merged));
            } else {
                writes.push((*reg as u32, *value as u32));
            }
        }

        let apsel = self.state.apsel;
        let mut memory = Self::memory(self.dap, apsel)?;

        let mut pending = Vec::with_capacity(writes.len());
        for (selector, value) in writes {
            memory.write_word_32(DCRDR, value)?;
            memory.write_word_32(DCRSR, selector | DCRSR_REGWNR)?;
            pending.push(memory.read_word_32_deferred(DHCSR)?);
        }

        for deferred in pending {
            let dhcsr = Dhcsr(memory.resolve(deferred)?);
            if !dhcsr.s_regrdy() {
                wait_for_regrdy(&mut memory)?;
            }
        }

        Ok(())
    }

    /// Request a breakpoint; it reaches the target at the next flush (before
    /// resume, step or disconnect).
    pub fn set_breakpoint(&mut self, addr: u32, kind: BreakpointKind) -> Result<(), ArmError> {
        self.state.breakpoints.set_breakpoint(addr, kind)
    }

    /// Request removal of the breakpoint at `addr`.
    pub fn remove_breakpoint(&mut self, addr: u32) -> Result<(), ArmError> {
        self.state.breakpoints.remove_breakpoint(addr);
        Ok(())
    }

    /// Apply pending breakpoint changes right now.
    pub fn flush_breakpoints(&mut self) -> Result<(), ArmError> {
        let mut memory = Self::memory(self.dap, self.state.apsel)?;
        self.state
            .breakpoints
            .flush(&mut memory, self.memory_map, false)
    }

    /// The number of free hardware breakpoint comparators.
    pub fn available_breakpoint_count(&self) -> usize {
        self.state.breakpoints.available_hw_breakpoints()
    }

    /// Register a flash breakpoint provider backed by `pager`.
    ///
    /// Without one, breakpoints in flash are limited to the hardware
    /// comparators.
    pub fn add_flash_breakpoint_provider(
        &mut self,
        pager: Box<dyn crate::debug::breakpoints::FlashPager>,
    ) {
        self.state
            .breakpoints
            .add_provider(Box::new(crate::debug::breakpoints::FlashBreakpointProvider::new(pager)));
    }

    /// Install a watchpoint.
    pub fn set_watchpoint(
        &mut self,
        addr: u32,
        size: u32,
        kind: WatchpointKind,
    ) -> Result<(), ArmError> {
        let mut memory = Self::memory(self.dap, self.state.apsel)?;
        let installed = self
            .state
            .dwt
            .set_watchpoint(&mut memory, Watchpoint { addr, size, kind })?;
        if installed {
            Ok(())
        } else {
            Err(ArmError::Other(
                "no free watchpoint comparator".to_string(),
            ))
        }
    }

    /// Remove a watchpoint previously installed with the same parameters.
    pub fn remove_watchpoint(
        &mut self,
        addr: u32,
        size: u32,
        kind: WatchpointKind,
    ) -> Result<(), ArmError> {
        let mut memory = Self::memory(self.dap, self.state.apsel)?;
        self.state
            .dwt
            .remove_watchpoint(&mut memory, Watchpoint { addr, size, kind })
    }

    /// Enable the vector catches in `mask` and disable all others.
    pub fn set_vector_catch(&mut self, mask: VectorCatch) -> Result<(), ArmError> {
        let mut memory = Self::memory(self.dap, self.state.apsel)?;
        let demcr = memory.read_word_32(DEMCR)?;
        memory.write_word_32(DEMCR, (demcr & !DEMCR_VC_MASK) | mask.bits())
    }

    /// The currently enabled vector catches.
    pub fn get_vector_catch(&mut self) -> Result<VectorCatch, ArmError> {
        let mut memory = Self::memory(self.dap, self.state.apsel)?;
        let demcr = memory.read_word_32(DEMCR)?;
        Ok(VectorCatch(demcr & DEMCR_VC_MASK))
    }

    /// Read a value of `bits` width. Software and flash breakpoints are
    /// transparently unpatched from the result.
    pub fn read_memory(&mut self, address: u32, bits: usize) -> Result<u32, ArmError> {
        let value = {
            let mut memory = Self::memory(self.dap, self.state.apsel)?;
            memory.read_memory(address, bits)?
        };

        let mut bytes = value.to_le_bytes();
        self.state
            .breakpoints
            .filter_memory(address, &mut bytes[..bits / 8]);
        Ok(u32::from_le_bytes(bytes))
    }

    /// Write a value of `bits` width.
    pub fn write_memory(&mut self, address: u32, value: u32, bits: usize) -> Result<(), ArmError> {
        let mut memory = Self::memory(self.dap, self.state.apsel)?;
        memory.write_memory(address, value, bits)
    }

    /// Read a block of bytes, unpatching breakpoints from the result.
    pub fn read_memory_block8(&mut self, address: u32, len: usize) -> Result<Vec<u8>, ArmError> {
        let mut data = vec![0u8; len];
        {
            let mut memory = Self::memory(self.dap, self.state.apsel)?;
            memory.read_8(address, &mut data)?;
        }
        self.state.breakpoints.filter_memory(address, &mut data);
        Ok(data)
    }

    /// Write a block of bytes.
    pub fn write_memory_block8(&mut self, address: u32, data: &[u8]) -> Result<(), ArmError> {
        let mut memory = Self::memory(self.dap, self.state.apsel)?;
        memory.write_8(address, data)
    }

    /// Read a block of words, unpatching breakpoints from the result.
    pub fn read_memory_block32(&mut self, address: u32, len: usize) -> Result<Vec<u32>, ArmError> {
        let mut data = vec![0u32; len];
        {
            let mut memory = Self::memory(self.dap, self.state.apsel)?;
            memory.read_32(address, &mut data)?;
        }

        let mut bytes = Vec::with_capacity(len * 4);
        for word in &data {
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        self.state.breakpoints.filter_memory(address, &mut bytes);
        for (word, chunk) in data.iter_mut().zip(bytes.chunks_exact(4)) {
            *word = u32::from_le_bytes(chunk.try_into().unwrap());
        }
        Ok(data)
    }

    /// Write a block of words.
    pub fn write_memory_block32(&mut self, address: u32, data: &[u32]) -> Result<(), ArmError> {
        let mut memory = Self::memory(self.dap, self.state.apsel)?;
        memory.write_32(address, data)
    }
}

fn wait_for_halt(memory: &mut ApMemory<'_>, timeout: Duration) -> Result<(), ArmError> {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if Dhcsr(memory.read_word_32(DHCSR)?).s_halt() {
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    Err(ArmError::Timeout)
}

fn wait_for_regrdy(memory: &mut ApMemory<'_>) -> Result<(), ArmError> {
    let start = Instant::now();
    while start.elapsed() < Duration::from_millis(100) {
        if Dhcsr(memory.read_word_32(DHCSR)?).s_regrdy() {
            return Ok(());
        }
    }
    Err(ArmError::RegisterTransferTimeout)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::probe::fake_probe::{FakeProbe, FakeStateHandle};
    use crate::sequence::DefaultSequence;
    use crate::target::Board;

    struct Harness {
        state: CortexMState,
        dap: DapController,
        board: Board,
        sequence: Arc<dyn DebugSequence>,
        events: EventHub,
        handle: FakeStateHandle,
    }

    impl Harness {
        fn new() -> Self {
            let probe = FakeProbe::new();
            let handle = probe.state_handle();
            let mut dap = DapController::new(Box::new(probe));
            dap.init().unwrap();
            dap.find_aps().unwrap();

            Harness {
                state: CortexMState::new(0, 0),
                dap,
                board: Board::generic(),
                sequence: Arc::new(DefaultSequence),
                events: EventHub::new(),
                handle,
            }
        }

        fn core(&mut self) -> Core<'_> {
            Core {
                state: &mut self.state,
                dap: &mut self.dap,
                memory_map: &self.board.memory_map,
                sequence: &self.sequence,
                events: &mut self.events,
            }
        }
    }

    #[test]
    fn init_detects_core_and_builds_catalog() {
        let mut harness = Harness::new();
        let mut core = harness.core();
        core.init().unwrap();

        assert_eq!(harness.state.cpuid().part_name(), "Cortex-M4");
        assert!(harness.state.registers().by_name("basepri").is_some());
        // No FPU on the default fake.
        assert!(!harness.state.has_fpu());
        assert!(harness.state.registers().by_name("s0").is_none());
        assert!(harness.state.target_xml().contains("m-profile"));
    }

    #[test]
    fn fpu_detection_through_cpacr() {
        let mut harness = Harness::new();
        harness.handle.set_fpu_present(true);
        let mut core = harness.core();
        core.init().unwrap();

        assert!(harness.state.has_fpu());
        assert!(harness.state.registers().by_name("d15").is_some());
    }

    #[test]
    fn v6m_core_has_no_v7m_registers() {
        let mut harness = Harness::new();
        harness.handle.set_cpuid(0x410C_C601); // Cortex-M0+
        let mut core = harness.core();
        core.init().unwrap();

        assert!(harness.state.registers().by_name("basepri").is_none());
        assert!(!harness.state.cpuid().supports_vectreset());
    }

    #[test]
    fn halt_and_resume_round_trip() {
        let mut harness = Harness::new();
        let mut core = harness.core();
        core.init().unwrap();

        core.halt().unwrap();
        assert_eq!(core.get_state().unwrap(), CoreState::Halted);
        assert_eq!(core.get_halt_reason().unwrap(), HaltReason::Debug);

        core.resume().unwrap();
        assert_eq!(core.get_state().unwrap(), CoreState::Running);
    }

    #[test]
    fn register_read_write_round_trip() {
        let mut harness = Harness::new();
        let mut core = harness.core();
        core.init().unwrap();
        core.halt().unwrap();

        core.write_core_register("r0", RegisterValue::U32(0x1234_5678))
            .unwrap();
        assert_eq!(
            core.read_core_register("r0").unwrap(),
            RegisterValue::U32(0x1234_5678)
        );

        core.write_core_register("pc", RegisterValue::U32(0x0000_0400))
            .unwrap();
        assert_eq!(harness.handle.core_register(15), 0x0000_0400);
    }

    #[test]
    fn cfbp_subregister_write_preserves_siblings() {
        let mut harness = Harness::new();
        harness.handle.halt_core(1);
        // CFBP: CONTROL=0x11, FAULTMASK=0x22, BASEPRI=0x33, PRIMASK=0x01.
        harness.handle.set_core_register(20, 0x1122_3301);
        let mut core = harness.core();
        core.init().unwrap();

        assert_eq!(
            core.read_core_register("basepri").unwrap(),
            RegisterValue::U32(0x33)
        );
        assert_eq!(
            core.read_core_register("control").unwrap(),
            RegisterValue::U32(0x11)
        );

        core.write_core_register("basepri", RegisterValue::U32(0x40))
            .unwrap();
        assert_eq!(harness.handle.core_register(20), 0x1122_4001);
    }

    #[test]
    fn xpsr_subfield_write_preserves_other_fields() {
        let mut harness = Harness::new();
        let handle = harness.handle.clone();
        handle.halt_core(1);
        handle.set_core_register(16, 0x0100_0003); // thumb bit + IPSR bits
        let mut core = harness.core();
        core.init().unwrap();

        // Writing APSR flags must leave IPSR and EPSR untouched.
        core.write_core_register("apsr", RegisterValue::U32(0xF800_0000))
            .unwrap();
        assert_eq!(handle.core_register(16), 0xF900_0003);

        assert_eq!(
            core.read_core_register("ipsr").unwrap(),
            RegisterValue::U32(0x3)
        );
        assert_eq!(
            core.read_core_register("apsr").unwrap(),
            RegisterValue::U32(0xF800_0000)
        );
    }

    #[test]
    fn double_precision_registers_split_into_singles() {
        let mut harness = Harness::new();
        let handle = harness.handle.clone();
        handle.set_fpu_present(true);
        handle.halt_core(1);
        let mut core = harness.core();
        core.init().unwrap();

        core.write_core_register("d1", RegisterValue::F64(2.5))
            .unwrap();

        let bits = 2.5f64.to_bits();
        // D1 lives in S2/S3, selectors 0x42 and 0x43.
        assert_eq!(handle.core_register(0x42), bits as u32);
        assert_eq!(handle.core_register(0x43), (bits >> 32) as u32);

        assert_eq!(
            core.read_core_register("d1").unwrap(),
            RegisterValue::F64(2.5)
        );
    }

    #[test]
    fn step_advances_pc_and_stays_halted() {
        let mut harness = Harness::new();
        let mut core = harness.core();
        core.init().unwrap();
        core.halt().unwrap();
        core.write_core_register("pc", RegisterValue::U32(0x100))
            .unwrap();

        core.step(true, 0, 0).unwrap();

        assert_eq!(core.get_state().unwrap(), CoreState::Halted);
        assert_eq!(harness.handle.core_register(15), 0x102);
    }

    #[test]
    fn ranged_step_stops_at_range_end() {
        let mut harness = Harness::new();
        let mut core = harness.core();
        core.init().unwrap();
        core.halt().unwrap();
        core.write_core_register("pc", RegisterValue::U32(0x100))
            .unwrap();

        core.step(true, 0x100, 0x108).unwrap();

        // 0x100 -> 0x102 -> 0x104 -> 0x106 -> 0x108 (out of range).
        assert_eq!(harness.handle.core_register(15), 0x108);
    }

    #[test]
    fn step_requires_halted_core() {
        let mut harness = Harness::new();
        let mut core = harness.core();
        core.init().unwrap();

        assert!(matches!(
            core.step(true, 0, 0),
            Err(ArmError::CoreNotHalted)
        ));
    }

    #[test]
    fn sysresetreq_reset_loads_vector_table() {
        let mut harness = Harness::new();
        // Vector table: SP = 0x2000_8000, reset handler = 0x0000_0401.
        harness.handle.load_memory(0x0, &0x2000_8000u32.to_le_bytes());
        harness.handle.load_memory(0x4, &0x0000_0401u32.to_le_bytes());

        let mut core = harness.core();
        core.init().unwrap();
        core.reset(Some(ResetType::SwSysresetreq)).unwrap();

        assert_eq!(core.get_state().unwrap(), CoreState::Running);
        assert_eq!(harness.handle.core_register(13), 0x2000_8000);
    }

    #[test]
    fn reset_and_halt_sets_thumb_bit() {
        let mut harness = Harness::new();
        harness.handle.load_memory(0x0, &0x2000_8000u32.to_le_bytes());
        // Reset vector without the thumb bit.
        harness.handle.load_memory(0x4, &0x0000_0400u32.to_le_bytes());

        let mut core = harness.core();
        core.init().unwrap();
        core.reset_and_halt(Some(ResetType::SwSysresetreq)).unwrap();

        assert_eq!(core.get_state().unwrap(), CoreState::Halted);
        let xpsr = core.read_core_register_raw(XPSR_INDEX).unwrap() as u32;
        assert_ne!(xpsr & XPSR_THUMB, 0, "thumb bit must be set");
    }

    #[test]
    fn vectreset_downgrades_to_emulated_on_v6m() {
        let mut harness = Harness::new();
        harness.handle.set_cpuid(0x410C_C601); // Cortex-M0+
        harness.handle.load_memory(0x0, &0x2000_4000u32.to_le_bytes());
        harness.handle.load_memory(0x4, &0x0000_0201u32.to_le_bytes());

        let mut core = harness.core();
        core.init().unwrap();
        harness
            .state
            .set_default_software_reset_type(ResetType::SwVectreset);

        let mut core = harness.core();
        core.reset_and_halt(Some(ResetType::Sw)).unwrap();

        // The emulated reset wrote the register file directly.
        assert_eq!(core.get_state().unwrap(), CoreState::Halted);
        assert_eq!(harness.handle.core_register(14), 0xFFFF_FFFF);
        assert_eq!(harness.handle.core_register(17), 0x2000_4000);
        let xpsr = harness.handle.core_register(16);
        assert_ne!(xpsr & XPSR_THUMB, 0);
    }

    #[test]
    fn vector_catch_round_trip() {
        let mut harness = Harness::new();
        let mut core = harness.core();
        core.init().unwrap();

        let mut mask = VectorCatch::default();
        mask.set_hard_fault(true);
        mask.set_core_reset(true);
        core.set_vector_catch(mask).unwrap();

        assert_eq!(core.get_vector_catch().unwrap(), mask);

        // TRCENA (set by DWT init) must have survived.
        let mut memory = Core::memory(&mut harness.dap, 0).unwrap();
        let demcr = memory.read_word_32(DEMCR).unwrap();
        assert_ne!(demcr & (1 << 24), 0);
    }

    #[test]
    fn watchpoints_reach_the_dwt() {
        let mut harness = Harness::new();
        let handle = harness.handle.clone();
        let mut core = harness.core();
        core.init().unwrap();

        core.set_watchpoint(0x2000_0040, 4, WatchpointKind::ReadWrite)
            .unwrap();
        let (comp, mask, function) = handle.dwt_comparator(0);
        assert_eq!((comp, mask, function), (0x2000_0040, 2, 7));

        core.remove_watchpoint(0x2000_0040, 4, WatchpointKind::ReadWrite)
            .unwrap();
        assert_eq!(handle.dwt_comparator(0).2, 0);
    }

    #[test]
    fn software_breakpoint_is_invisible_to_memory_reads() {
        let mut harness = Harness::new();
        harness.handle.load_memory(0x2000_0100, &[0x70, 0x47]);

        let mut core = harness.core();
        core.init().unwrap();
        core.halt().unwrap();

        core.set_breakpoint(0x2000_0100, BreakpointKind::Auto).unwrap();
        core.flush_breakpoints().unwrap();

        // The raw target memory holds a BKPT instruction now.
        assert_eq!(
            harness.handle.memory_contents(0x2000_0100, 2),
            vec![0x00, 0xBE]
        );

        // The core-level read shows the original instruction.
        let mut core = harness.core();
        assert_eq!(core.read_memory(0x2000_0100, 16).unwrap(), 0x4770);
        assert_eq!(
            core.read_memory_block8(0x2000_0100, 2).unwrap(),
            vec![0x70, 0x47]
        );
    }

    #[test]
    fn resume_flushes_pending_breakpoints() {
        let mut harness = Harness::new();
        harness.handle.load_memory(0x2000_0200, &[0x00, 0x20]);

        let mut core = harness.core();
        core.init().unwrap();
        core.halt().unwrap();
        core.set_breakpoint(0x2000_0200, BreakpointKind::Sw).unwrap();

        // Nothing on the target until the resume flush.
        assert_eq!(
            harness.handle.memory_contents(0x2000_0200, 2),
            vec![0x00, 0x20]
        );

        let mut core = harness.core();
        core.resume().unwrap();
        assert_eq!(
            harness.handle.memory_contents(0x2000_0200, 2),
            vec![0x00, 0xBE]
        );
    }

    #[test]
    fn halt_reason_reports_breakpoints() {
        let mut harness = Harness::new();
        let mut core = harness.core();
        core.init().unwrap();

        // As if the core hit a BKPT.
        harness.handle.halt_core(1 << 1);
        let mut core = harness.core();
        assert_eq!(core.get_halt_reason().unwrap(), HaltReason::Breakpoint);
    }

    #[test]
    fn events_fire_around_halt_and_run() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let mut harness = Harness::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        harness.events.subscribe(
            crate::event::DebugEventKind::PostHalt,
            Box::new(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let mut core = harness.core();
        core.init().unwrap();
        core.halt().unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
