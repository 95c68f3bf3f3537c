//! Breakpoint management.
//!
//! The manager records add and remove requests without touching the target;
//! the requests are flushed before every resume, step or disconnect. At flush
//! time each new breakpoint is assigned a provider: a hardware comparator, a
//! RAM-patched BKPT instruction or a flash rewrite, depending on the memory
//! region, the FPB address range and how many comparators should stay free
//! for stepping.

pub mod flash;
pub mod hardware;
pub mod software;

pub use flash::{FlashBreakpointProvider, FlashPager};
pub use hardware::HardwareBreakpointProvider;
pub use software::SoftwareBreakpointProvider;

use crate::coresight::ArmError;
use crate::memory::MemoryInterface;
use crate::target::MemoryMap;

use std::collections::HashMap;

/// Number of hardware comparators the manager tries to keep free, so a step
/// over an existing hardware breakpoint stays possible.
const MIN_HW_BREAKPOINTS: usize = 1;

/// The requested (or chosen) implementation of a breakpoint.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum BreakpointKind {
    /// Let the manager pick.
    Auto,
    /// A hardware comparator in the FPB.
    Hw,
    /// A BKPT instruction patched into RAM.
    Sw,
    /// A BKPT instruction written into flash.
    Flash,
}

/// One realized breakpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Breakpoint {
    /// A hardware comparator.
    Hw {
        /// The comparator register holding this breakpoint.
        comparator_addr: u32,
        /// The breakpoint address.
        addr: u32,
    },
    /// A patched instruction in RAM.
    Sw {
        /// The breakpoint address.
        addr: u32,
        /// The halfword that was replaced.
        original_instr: u16,
    },
    /// A patched instruction in flash.
    Flash {
        /// The breakpoint address.
        addr: u32,
        /// The halfword that was replaced.
        original_instr: u16,
        /// The base of the flash page holding the patch.
        page_base: u32,
    },
}

impl Breakpoint {
    /// The address of this breakpoint.
    pub fn addr(&self) -> u32 {
        match self {
            Breakpoint::Hw { addr, .. }
            | Breakpoint::Sw { addr, .. }
            | Breakpoint::Flash { addr, .. } => *addr,
        }
    }

    /// The kind of provider that realized this breakpoint.
    pub fn kind(&self) -> BreakpointKind {
        match self {
            Breakpoint::Hw { .. } => BreakpointKind::Hw,
            Breakpoint::Sw { .. } => BreakpointKind::Sw,
            Breakpoint::Flash { .. } => BreakpointKind::Flash,
        }
    }
}

/// A backend that can realize breakpoints of one kind.
pub trait BreakpointProvider: Send {
    /// The kind of breakpoints this provider realizes.
    fn kind(&self) -> BreakpointKind;

    /// Install a breakpoint at `addr`. `None` means the provider is out of
    /// resources.
    fn set_breakpoint(
        &mut self,
        memory: &mut dyn MemoryInterface,
        addr: u32,
    ) -> Result<Option<Breakpoint>, ArmError>;

    /// Remove a previously installed breakpoint.
    fn remove_breakpoint(
        &mut self,
        memory: &mut dyn MemoryInterface,
        breakpoint: &Breakpoint,
    ) -> Result<(), ArmError>;

    /// How many more breakpoints the provider can install, when bounded.
    fn available_breakpoints(&self) -> Option<usize> {
        None
    }

    /// Whether reads must be filtered through this provider.
    fn do_filter_memory(&self) -> bool {
        false
    }

    /// Substitute original instruction bytes for patched ones in `data`,
    /// which was read starting at `addr`.
    fn filter_memory(&self, _addr: u32, _data: &mut [u8]) {}

    /// Write out any deferred work (e.g. coalesced page rewrites).
    fn flush(&mut self, _memory: &mut dyn MemoryInterface) -> Result<(), ArmError> {
        Ok(())
    }
}

/// What is known about a breakpoint that has been requested but not flushed.
#[derive(Debug, Clone)]
enum PendingBreakpoint {
    /// Requested with the given kind; realized at the next flush.
    Requested(BreakpointKind),
    /// Already live; carried over so the flush diff leaves it alone.
    Existing(Breakpoint),
}

/// Manages all breakpoints of one core.
pub struct BreakpointManager {
    /// Live breakpoints on the target, keyed by address.
    breakpoints: HashMap<u32, Breakpoint>,
    /// The requested state after the next flush, keyed by address.
    updated_breakpoints: HashMap<u32, PendingBreakpoint>,
    providers: Vec<Box<dyn BreakpointProvider>>,
    /// Cleared while a provider is rewriting flash, so reads of the page
    /// being modified are not filtered.
    filtering_enabled: bool,
}

impl std::fmt::Debug for BreakpointManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BreakpointManager")
            .field("breakpoints", &self.breakpoints)
            .field("providers", &self.providers.len())
            .finish()
    }
}

impl BreakpointManager {
    /// A manager with no providers; register them with
    /// [`BreakpointManager::add_provider`].
    pub fn new() -> Self {
        BreakpointManager {
            breakpoints: HashMap::new(),
            updated_breakpoints: HashMap::new(),
            providers: Vec::new(),
            filtering_enabled: true,
        }
    }

    /// Register a provider for its kind.
    pub fn add_provider(&mut self, provider: Box<dyn BreakpointProvider>) {
        self.providers.push(provider);
    }

    fn provider(&mut self, kind: BreakpointKind) -> Option<&mut Box<dyn BreakpointProvider>> {
        self.providers.iter_mut().find(|p| p.kind() == kind)
    }

    fn has_provider(&self, kind: BreakpointKind) -> bool {
        self.providers.iter().any(|p| p.kind() == kind)
    }

    /// How many hardware comparators are still free.
    pub fn available_hw_breakpoints(&self) -> usize {
        self.providers
            .iter()
            .find(|p| p.kind() == BreakpointKind::Hw)
            .and_then(|p| p.available_breakpoints())
            .unwrap_or(0)
    }

    /// The addresses of all live breakpoints.
    pub fn breakpoint_addresses(&self) -> Vec<u32> {
        self.breakpoints.keys().copied().collect()
    }

    /// The pending breakpoint at `addr`, live or requested.
    pub fn find_breakpoint(&self, addr: u32) -> bool {
        self.updated_breakpoints.contains_key(&(addr & !1))
    }

    /// Request a breakpoint at `addr`. The thumb bit is ignored. Requesting
    /// an address that already has a breakpoint succeeds without effect.
    pub fn set_breakpoint(&mut self, addr: u32, kind: BreakpointKind) -> Result<(), ArmError> {
        let addr = addr & !1;
        tracing::debug!("set bkpt {:?} at {:#010x}", kind, addr);

        if self.updated_breakpoints.contains_key(&addr) {
            return Ok(());
        }

        let pending = match self.breakpoints.get(&addr) {
            // Keep the realized breakpoint so the original instruction cache
            // survives a remove/set cycle within one flush window.
            Some(live) => PendingBreakpoint::Existing(live.clone()),
            None => PendingBreakpoint::Requested(kind),
        };
        self.updated_breakpoints.insert(addr, pending);
        Ok(())
    }

    /// Request removal of the breakpoint at `addr`.
    pub fn remove_breakpoint(&mut self, addr: u32) {
        let addr = addr & !1;
        tracing::debug!("remove bkpt at {:#010x}", addr);

        if self.updated_breakpoints.remove(&addr).is_none() {
            tracing::debug!("Tried to remove breakpoint {addr:#010x} that wasn't set");
        }
    }

    /// Pick the provider kind for one added breakpoint.
    ///
    /// `allow_all_hw` lifts the reserve-for-step policy when this flush adds
    /// only a single breakpoint outside a step.
    fn select_breakpoint_type(
        &self,
        addr: u32,
        requested: BreakpointKind,
        memory_map: &MemoryMap,
        allow_all_hw: bool,
    ) -> Option<BreakpointKind> {
        let mut kind = requested;

        let region = memory_map.region_for_address(addr);
        let (is_flash, is_ram) = match region {
            Some(region) => (region.is_flash(), region.is_ram()),
            None => {
                // Unknown memory: only a hardware comparator is safe.
                (false, false)
            }
        };
        if region.is_none() {
            kind = BreakpointKind::Hw;
        }

        let in_hw_range = addr < 0x2000_0000;
        let available_hw = self.available_hw_breakpoints();
        let have_hw_bp = self.has_provider(BreakpointKind::Hw)
            && (available_hw > MIN_HW_BREAKPOINTS || (allow_all_hw && available_hw > 0));

        if kind == BreakpointKind::Auto {
            kind = if !in_hw_range || !have_hw_bp {
                if is_ram {
                    BreakpointKind::Sw
                } else if is_flash {
                    BreakpointKind::Flash
                } else {
                    tracing::debug!("unable to set bp because no hw bp is available");
                    return None;
                }
            } else {
                BreakpointKind::Hw
            };
        }

        // A hardware comparator cannot match above 0x2000_0000.
        if kind == BreakpointKind::Hw && !in_hw_range {
            if is_ram {
                kind = BreakpointKind::Sw;
            } else if is_flash && self.has_provider(BreakpointKind::Flash) {
                kind = BreakpointKind::Flash;
            } else {
                tracing::debug!("could not fall back from hw breakpoint at {:#010x}", addr);
                return None;
            }
        }

        // Flash prefers hardware while comparators last, and needs the flash
        // provider once they run out.
        if is_flash {
            if !have_hw_bp && self.has_provider(BreakpointKind::Flash) {
                kind = BreakpointKind::Flash;
            } else if in_hw_range && have_hw_bp {
                kind = BreakpointKind::Hw;
            } else {
                tracing::debug!("could not realize flash breakpoint at {:#010x}", addr);
                return None;
            }
        }

        tracing::debug!("selected bkpt type {:?} for addr {:#010x}", kind, addr);
        Some(kind)
    }

    /// Apply all pending add and remove requests to the target.
    ///
    /// Called synchronously by resume, step and disconnect before the core
    /// runs again; it never re-enters itself through an event subscriber.
    pub fn flush(
        &mut self,
        memory: &mut dyn MemoryInterface,
        memory_map: &MemoryMap,
        is_step: bool,
    ) -> Result<(), ArmError> {
        // Diff the requested state against the live state.
        let added: Vec<(u32, BreakpointKind)> = self
            .updated_breakpoints
            .iter()
            .filter(|(addr, _)| !self.breakpoints.contains_key(*addr))
            .map(|(addr, pending)| {
                let kind = match pending {
                    PendingBreakpoint::Requested(kind) => *kind,
                    PendingBreakpoint::Existing(bp) => bp.kind(),
                };
                (*addr, kind)
            })
            .collect();
        let removed: Vec<Breakpoint> = self
            .breakpoints
            .values()
            .filter(|bp| !self.updated_breakpoints.contains_key(&bp.addr()))
            .cloned()
            .collect();

        tracing::debug!("bpmgr: added={:x?} removed={:x?}", added, removed);

        for bp in removed {
            if let Some(provider) = self.provider(bp.kind()) {
                provider.remove_breakpoint(memory, &bp)?;
            }
            self.breakpoints.remove(&bp.addr());
        }

        // The reserve-for-step policy is lifted for a lone new breakpoint
        // outside a step.
        let allow_all_hw = !is_step && added.len() == 1;

        for (addr, requested) in added {
            let Some(kind) =
                self.select_breakpoint_type(addr, requested, memory_map, allow_all_hw)
            else {
                continue;
            };

            let Some(provider) = self.provider(kind) else {
                return Err(ArmError::Other(format!(
                    "no provider registered for breakpoint kind {kind:?}"
                )));
            };

            if let Some(bp) = provider.set_breakpoint(memory, addr)? {
                self.breakpoints.insert(addr, bp);
            }
        }

        // The requested state now mirrors the live state.
        self.updated_breakpoints = self
            .breakpoints
            .iter()
            .map(|(addr, bp)| (*addr, PendingBreakpoint::Existing(bp.clone())))
            .collect();

        self.flush_providers(memory)
    }

    fn flush_providers(&mut self, memory: &mut dyn MemoryInterface) -> Result<(), ArmError> {
        // Reads issued by a provider while it rewrites flash must see the
        // patched bytes, not the filtered view.
        self.filtering_enabled = false;
        let mut result = Ok(());
        for provider in &mut self.providers {
            if let Err(e) = provider.flush(memory) {
                result = Err(e);
                break;
            }
        }
        self.filtering_enabled = true;
        result
    }

    /// Remove every live breakpoint right now.
    pub fn remove_all_breakpoints(
        &mut self,
        memory: &mut dyn MemoryInterface,
    ) -> Result<(), ArmError> {
        let all: Vec<Breakpoint> = self.breakpoints.values().cloned().collect();
        for bp in all {
            if let Some(provider) = self.provider(bp.kind()) {
                provider.remove_breakpoint(memory, &bp)?;
            }
        }
        self.breakpoints.clear();
        self.updated_breakpoints.clear();
        self.flush_providers(memory)
    }

    /// Whether memory reads should currently be filtered.
    pub fn filtering_enabled(&self) -> bool {
        self.filtering_enabled
    }

    /// Replace patched bytes in `data` (read from `addr`) with the original
    /// instructions, chaining the filters of all providers.
    pub fn filter_memory(&self, addr: u32, data: &mut [u8]) {
        if !self.filtering_enabled {
            return;
        }
        for provider in &self.providers {
            if provider.do_filter_memory() {
                provider.filter_memory(addr, data);
            }
        }
    }
}

impl Default for BreakpointManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::coresight::component::Fpb;
    use crate::coresight::dp::DapController;
    use crate::probe::fake_probe::{FakeProbe, FakeStateHandle};
    use crate::target::Board;

    fn setup() -> (DapController, FakeStateHandle) {
        let probe = FakeProbe::new();
        let handle = probe.state_handle();
        let mut dap = DapController::new(Box::new(probe));
        dap.init().unwrap();
        dap.find_aps().unwrap();
        (dap, handle)
    }

    fn manager_with_hw_and_sw(dap: &mut DapController) -> BreakpointManager {
        let mut memory = dap.memory_interface(0).unwrap();
        let mut fpb = Fpb::at_default_address();
        fpb.init(&mut memory).unwrap();

        let mut manager = BreakpointManager::new();
        manager.add_provider(Box::new(HardwareBreakpointProvider::new(fpb)));
        manager.add_provider(Box::new(SoftwareBreakpointProvider::new()));
        manager
    }

    #[test]
    fn flash_addresses_get_hardware_breakpoints() {
        let (mut dap, handle) = setup();
        let mut manager = manager_with_hw_and_sw(&mut dap);
        let board = Board::generic();

        manager
            .set_breakpoint(0x0000_0100, BreakpointKind::Auto)
            .unwrap();
        let mut memory = dap.memory_interface(0).unwrap();
        manager.flush(&mut memory, &board.memory_map, false).unwrap();

        assert_eq!(manager.breakpoint_addresses(), vec![0x0000_0100]);
        assert_ne!(handle.fp_comparators()[0], 0);
    }

    #[test]
    fn ram_addresses_get_software_breakpoints() {
        let (mut dap, handle) = setup();
        handle.load_memory(0x2000_0100, &[0x70, 0x47]); // bx lr
        let mut manager = manager_with_hw_and_sw(&mut dap);
        let board = Board::generic();

        manager
            .set_breakpoint(0x2000_0101, BreakpointKind::Auto) // thumb bit set
            .unwrap();
        let mut memory = dap.memory_interface(0).unwrap();
        manager.flush(&mut memory, &board.memory_map, false).unwrap();

        // The BKPT instruction has been patched in.
        assert_eq!(
            handle.memory_contents(0x2000_0100, 2),
            vec![0x00, 0xBE],
            "expected a BKPT instruction"
        );

        // Removal restores the original instruction.
        manager.remove_breakpoint(0x2000_0100);
        let mut memory = dap.memory_interface(0).unwrap();
        manager.flush(&mut memory, &board.memory_map, false).unwrap();
        assert_eq!(handle.memory_contents(0x2000_0100, 2), vec![0x70, 0x47]);
    }

    #[test]
    fn setting_twice_is_idempotent() {
        let (mut dap, _) = setup();
        let mut manager = manager_with_hw_and_sw(&mut dap);
        let board = Board::generic();

        manager
            .set_breakpoint(0x0000_0200, BreakpointKind::Auto)
            .unwrap();
        manager
            .set_breakpoint(0x0000_0200, BreakpointKind::Auto)
            .unwrap();
        let mut memory = dap.memory_interface(0).unwrap();
        manager.flush(&mut memory, &board.memory_map, false).unwrap();

        assert_eq!(manager.breakpoint_addresses().len(), 1);
        assert_eq!(manager.available_hw_breakpoints(), 5);
    }

    #[test]
    fn reserve_policy_keeps_one_comparator_for_stepping() {
        let (mut dap, _) = setup();
        let mut manager = manager_with_hw_and_sw(&mut dap);
        let board = Board::generic();

        // Fill five of the six comparators across several flushes.
        for i in 0..5u32 {
            manager
                .set_breakpoint(0x100 + i * 8, BreakpointKind::Auto)
                .unwrap();
            let mut memory = dap.memory_interface(0).unwrap();
            manager.flush(&mut memory, &board.memory_map, false).unwrap();
        }
        assert_eq!(manager.available_hw_breakpoints(), 1);

        // Two more at once: the reserve policy kicks in and neither may take
        // the last comparator. Both are in flash, so without a flash provider
        // they are dropped.
        manager.set_breakpoint(0x800, BreakpointKind::Auto).unwrap();
        manager.set_breakpoint(0x808, BreakpointKind::Auto).unwrap();
        let mut memory = dap.memory_interface(0).unwrap();
        manager.flush(&mut memory, &board.memory_map, false).unwrap();
        assert_eq!(manager.available_hw_breakpoints(), 1);

        // A single new breakpoint may use the reserve.
        manager.remove_breakpoint(0x800);
        manager.remove_breakpoint(0x808);
        manager.set_breakpoint(0x900, BreakpointKind::Auto).unwrap();
        let mut memory = dap.memory_interface(0).unwrap();
        manager.flush(&mut memory, &board.memory_map, false).unwrap();
        assert_eq!(manager.available_hw_breakpoints(), 0);
    }

    #[test]
    fn hw_request_in_ram_falls_back_to_software() {
        let (mut dap, handle) = setup();
        handle.load_memory(0x2000_0200, &[0x00, 0x20]);
        let mut manager = manager_with_hw_and_sw(&mut dap);
        let board = Board::generic();

        manager
            .set_breakpoint(0x2000_0200, BreakpointKind::Hw)
            .unwrap();
        let mut memory = dap.memory_interface(0).unwrap();
        manager.flush(&mut memory, &board.memory_map, false).unwrap();

        assert_eq!(handle.memory_contents(0x2000_0200, 2), vec![0x00, 0xBE]);
        // No comparator was consumed.
        assert_eq!(manager.available_hw_breakpoints(), 6);
    }

    #[test]
    fn memory_filter_restores_original_bytes() {
        let (mut dap, handle) = setup();
        handle.load_memory(0x2000_0300, &[0x70, 0x47, 0x00, 0xBF]);
        let mut manager = manager_with_hw_and_sw(&mut dap);
        let board = Board::generic();

        manager
            .set_breakpoint(0x2000_0300, BreakpointKind::Sw)
            .unwrap();
        let mut memory = dap.memory_interface(0).unwrap();
        manager.flush(&mut memory, &board.memory_map, false).unwrap();

        // Raw memory holds the BKPT; the filtered view shows the original.
        let mut memory = dap.memory_interface(0).unwrap();
        let mut data = [0u8; 4];
        crate::memory::MemoryInterface::read_8(&mut memory, 0x2000_0300, &mut data).unwrap();
        assert_eq!(&data[..2], &[0x00, 0xBE]);

        manager.filter_memory(0x2000_0300, &mut data);
        assert_eq!(&data, &[0x70, 0x47, 0x00, 0xBF]);
    }
}
