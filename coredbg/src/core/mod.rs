//! Cortex-M core services.

pub mod cortex_m;
pub mod registers;

pub use cortex_m::{Core, CortexMState};
pub use registers::{CoreRegisterInfo, RegisterValue};

use bitfield::bitfield;

/// The execution state of a core.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CoreState {
    /// The core is executing code.
    Running,
    /// The core is halted in debug state.
    Halted,
    /// The core is sleeping (WFI/WFE).
    Sleeping,
    /// The core is locked up after an unrecoverable exception.
    Lockup,
    /// The core is held in reset.
    Reset,
}

/// Why a halted core stopped, decoded from DFSR.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HaltReason {
    /// An explicit halt request (C_HALT or a completed step).
    Debug,
    /// A breakpoint, either a BKPT instruction or an FPB comparator.
    Breakpoint,
    /// A DWT watchpoint.
    Watchpoint,
    /// A vector catch.
    VectorCatch,
    /// The external debug request signal.
    External,
    /// A PMU counter overflow event.
    Pmu,
}

/// How to reset the core.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ResetType {
    /// Drive the reset line through the probe.
    Hw,
    /// Whatever software reset the core defaults to.
    Sw,
    /// Write AIRCR.SYSRESETREQ.
    SwSysresetreq,
    /// Write AIRCR.VECTRESET; v7-M only, downgraded to [`ResetType::SwEmulated`]
    /// elsewhere.
    SwVectreset,
    /// Rewrite core and system registers to their reset values.
    SwEmulated,
}

/// Whether a run request resumes or steps, for event subscribers.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RunKind {
    /// Free-running resume.
    Resume,
    /// Instruction (or ranged) step.
    Step,
}

bitfield! {
    /// The vector catch mask, laid out like the VC_* bits of DEMCR.
    #[derive(Copy, Clone, Default, PartialEq, Eq)]
    pub struct VectorCatch(u32);
    impl Debug;
    /// Catch a HardFault exception.
    pub hard_fault, set_hard_fault: 10;
    /// Catch a fault during exception entry or return.
    pub interrupt_err, set_interrupt_err: 9;
    /// Catch a BusFault exception.
    pub bus_err, set_bus_err: 8;
    /// Catch a UsageFault caused by a state information error.
    pub state_err, set_state_err: 7;
    /// Catch a UsageFault caused by a checking error.
    pub check_err, set_check_err: 6;
    /// Catch a UsageFault caused by a coprocessor access.
    pub coprocessor_err, set_coprocessor_err: 5;
    /// Catch a MemManage exception.
    pub mem_fault, set_mem_fault: 4;
    /// Catch the reset vector.
    pub core_reset, set_core_reset: 0;
}

impl VectorCatch {
    /// All catchable conditions.
    pub fn all() -> Self {
        VectorCatch(0x7F1)
    }

    /// The raw DEMCR bits of this mask.
    pub fn bits(&self) -> u32 {
        self.0
    }
}

/// The architecture family of a Cortex-M core, from CPUID.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CortexMClass {
    /// ARMv6-M (Cortex-M0, M0+, M1).
    V6M,
    /// ARMv7-M (Cortex-M3, M4, M7).
    V7M,
}

bitfield! {
    /// The CPUID register of the system control space.
    #[derive(Copy, Clone)]
    pub struct CpuId(u32);
    impl Debug;
    /// The implementer code; 0x41 is ARM.
    pub u8, implementer, _: 31, 24;
    /// The implementation variant.
    pub u8, variant, _: 23, 20;
    /// The architecture family; 0xC is ARMv6-M, 0xF is ARMv7-M.
    pub u8, architecture, _: 19, 16;
    /// The part number.
    pub u16, partno, _: 15, 4;
    /// The revision.
    pub u8, revision, _: 3, 0;
}

impl From<u32> for CpuId {
    fn from(value: u32) -> Self {
        CpuId(value)
    }
}

impl CpuId {
    /// Part number of the Cortex-M0.
    pub const PARTNO_CORTEX_M0: u16 = 0xC20;
    /// Part number of the Cortex-M0+.
    pub const PARTNO_CORTEX_M0P: u16 = 0xC60;
    /// Part number of the Cortex-M1.
    pub const PARTNO_CORTEX_M1: u16 = 0xC21;
    /// Part number of the Cortex-M3.
    pub const PARTNO_CORTEX_M3: u16 = 0xC23;
    /// Part number of the Cortex-M4.
    pub const PARTNO_CORTEX_M4: u16 = 0xC24;
    /// Part number of the Cortex-M7.
    pub const PARTNO_CORTEX_M7: u16 = 0xC27;

    /// The architecture family this part belongs to.
    pub fn class(&self) -> CortexMClass {
        match self.architecture() {
            0xC => CortexMClass::V6M,
            _ => CortexMClass::V7M,
        }
    }

    /// Whether this part implements the VECTRESET reset request.
    pub fn supports_vectreset(&self) -> bool {
        matches!(
            self.partno(),
            Self::PARTNO_CORTEX_M3 | Self::PARTNO_CORTEX_M4 | Self::PARTNO_CORTEX_M7
        )
    }

    /// A human readable part name.
    pub fn part_name(&self) -> &'static str {
        match self.partno() {
            Self::PARTNO_CORTEX_M0 => "Cortex-M0",
            Self::PARTNO_CORTEX_M0P => "Cortex-M0+",
            Self::PARTNO_CORTEX_M1 => "Cortex-M1",
            Self::PARTNO_CORTEX_M3 => "Cortex-M3",
            Self::PARTNO_CORTEX_M4 => "Cortex-M4",
            Self::PARTNO_CORTEX_M7 => "Cortex-M7",
            _ => "unknown Cortex-M",
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cpuid_decoding() {
        // Cortex-M4 r0p1.
        let cpuid = CpuId(0x410F_C241);
        assert_eq!(cpuid.implementer(), 0x41);
        assert_eq!(cpuid.partno(), CpuId::PARTNO_CORTEX_M4);
        assert_eq!(cpuid.class(), CortexMClass::V7M);
        assert!(cpuid.supports_vectreset());
        assert_eq!(cpuid.part_name(), "Cortex-M4");

        // Cortex-M0+ r0p1.
        let cpuid = CpuId(0x410C_C601);
        assert_eq!(cpuid.class(), CortexMClass::V6M);
        assert!(!cpuid.supports_vectreset());
    }

    #[test]
    fn vector_catch_mask_layout() {
        let mut catch = VectorCatch::default();
        catch.set_core_reset(true);
        catch.set_hard_fault(true);
        assert_eq!(catch.bits(), (1 << 10) | 1);
        assert_eq!(VectorCatch::all().bits(), 0x7F1);
    }
}
