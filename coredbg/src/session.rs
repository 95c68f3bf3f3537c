//! The debug session: probe, board and cores under one handle.
//!
//! A [`Session`] exclusively owns its probe (through the [`DapController`])
//! and walks the full bring-up on open: wire connect, clock, DP init, debug
//! power-up, AP discovery, ROM table walk, core creation and core init.
//! Closing runs the sequence in reverse and tolerates link errors at every
//! step, so a dead target never leaks the probe handle.

use crate::core::{Core, CortexMState, ResetType};
use crate::coresight::romtable::{Component, PeripheralType};
use crate::coresight::DapController;
use crate::error::Error;
use crate::event::{DebugEventKind, EventHandler, EventHub};
use crate::probe::{DebugProbe, WireProtocol};
use crate::sequence::{DebugSequence, DefaultSequence};
use crate::target::Board;

use std::collections::HashMap;
use std::sync::Arc;

/// A scalar session option value.
#[derive(Debug, Clone, PartialEq)]
pub enum OptionValue {
    /// A boolean option.
    Bool(bool),
    /// An integer option.
    Int(u32),
    /// A string option.
    String(String),
}

/// The process-local option bag of a session.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    values: HashMap<String, OptionValue>,
}

impl SessionOptions {
    /// Set an option.
    pub fn set(&mut self, key: impl Into<String>, value: OptionValue) {
        self.values.insert(key.into(), value);
    }

    /// Read an option.
    pub fn get(&self, key: &str) -> Option<&OptionValue> {
        self.values.get(key)
    }

    /// Read an integer option, falling back to `default`.
    pub fn get_int(&self, key: &str, default: u32) -> u32 {
        match self.values.get(key) {
            Some(OptionValue::Int(value)) => *value,
            _ => default,
        }
    }

    /// Read a boolean option, falling back to `default`.
    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.values.get(key) {
            Some(OptionValue::Bool(value)) => *value,
            _ => default,
        }
    }

    /// Read a string option.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.values.get(key) {
            Some(OptionValue::String(value)) => Some(value),
            _ => None,
        }
    }
}

/// An active debug session.
pub struct Session {
    interface: DapController,
    board: Board,
    cores: Vec<CortexMState>,
    /// Discovered component trees, paired with the AP they sit behind.
    components: Vec<(u8, Component)>,
    sequence: Arc<dyn DebugSequence>,
    events: EventHub,
    options: SessionOptions,
    opened: bool,
    closed: bool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("board", &self.board.name)
            .field("cores", &self.cores.len())
            .field("opened", &self.opened)
            .finish()
    }
}

impl Session {
    /// Wrap a probe into an unopened session on a generic board.
    pub fn new(probe: Box<dyn DebugProbe>) -> Self {
        Session {
            interface: DapController::new(probe),
            board: Board::generic(),
            cores: Vec::new(),
            components: Vec::new(),
            sequence: Arc::new(DefaultSequence),
            events: EventHub::new(),
            options: SessionOptions::default(),
            opened: false,
            closed: false,
        }
    }

    /// Replace the board description. Only effective before `open`.
    pub fn set_board(&mut self, board: Board) {
        self.board = board;
    }

    /// The board of this session.
    pub fn board(&self) -> &Board {
        &self.board
    }

    /// Replace the delegate hook implementation. Only effective before
    /// `open`.
    pub fn set_sequence(&mut self, sequence: Arc<dyn DebugSequence>) {
        self.sequence = sequence;
    }

    /// The option bag.
    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// The option bag, mutably.
    pub fn options_mut(&mut self) -> &mut SessionOptions {
        &mut self.options
    }

    /// Subscribe to debug events of `kind`.
    pub fn subscribe(&mut self, kind: DebugEventKind, handler: EventHandler) {
        self.events.subscribe(kind, handler);
    }

    /// The components discovered in the ROM tables.
    pub fn components(&self) -> impl Iterator<Item = &Component> {
        self.components.iter().map(|(_, component)| component)
    }

    /// The number of discovered cores.
    pub fn core_count(&self) -> usize {
        self.cores.len()
    }

    /// The DAP controller, for collaborators that need raw register access.
    pub fn interface_mut(&mut self) -> &mut DapController {
        &mut self.interface
    }

    /// Bring the target up: connect, clock, DP init, power-up, AP discovery,
    /// ROM table walk, core creation and core init.
    pub fn open(&mut self) -> Result<(), Error> {
        if self.opened {
            return Ok(());
        }

        let protocol = match self.options.get_str("protocol") {
            Some("swd") => Some(WireProtocol::Swd),
            Some("jtag") => Some(WireProtocol::Jtag),
            _ => None,
        };
        self.interface.connect(protocol)?;

        let frequency_khz = self.options.get_int("frequency_khz", 1_000);
        self.interface.set_clock(frequency_khz)?;

        self.interface.init().map_err(Error::Arm)?;
        self.interface.power_up_debug().map_err(Error::Arm)?;
        self.interface.find_aps().map_err(Error::Arm)?;

        self.discover_components()?;
        self.create_cores()?;

        // The reset_type option overrides the cores' default.
        let reset_type = match self.options.get_str("reset_type") {
            Some("hw") => Some(ResetType::Hw),
            Some("sysresetreq") => Some(ResetType::SwSysresetreq),
            Some("vectreset") => Some(ResetType::SwVectreset),
            Some("emulated") => Some(ResetType::SwEmulated),
            Some("sw") | Some("default") | None => None,
            Some(other) => {
                tracing::warn!("Unknown reset_type option '{}'", other);
                None
            }
        };
        if let Some(reset_type) = reset_type {
            for core in &mut self.cores {
                core.set_default_reset_type(reset_type);
            }
        }

        // Initialize every core's debug units.
        for index in 0..self.cores.len() {
            self.core(index)?.init().map_err(Error::Arm)?;
        }

        self.opened = true;
        Ok(())
    }

    /// Walk the ROM table of every MEM-AP that advertises one.
    fn discover_components(&mut self) -> Result<(), Error> {
        let ap_bases: Vec<(u8, u32)> = self
            .interface
            .access_ports()
            .iter()
            .filter_map(|ap| ap.rom_table_base.map(|base| (ap.apsel, base)))
            .collect();

        let mut components = Vec::new();
        for (apsel, base) in ap_bases {
            let mut memory = self.interface.memory_interface(apsel).map_err(Error::Arm)?;
            match Component::try_parse(&mut memory, base) {
                Ok(component) => components.push((apsel, component)),
                Err(e) => {
                    tracing::warn!("Failed to parse ROM table on AP {}: {}", apsel, e);
                }
            }
        }

        self.components = components;
        Ok(())
    }

    /// Create a core state for every system control space found; without any
    /// identified SCS, assume a single core behind the first MEM-AP.
    fn create_cores(&mut self) -> Result<(), Error> {
        let mut cores = Vec::new();

        for (apsel, component) in &self.components {
            if component.find_component(PeripheralType::Scs).is_some() {
                let mut state = CortexMState::new(cores.len(), *apsel);
                state.set_component_bases(
                    component
                        .find_component(PeripheralType::Fpb)
                        .map(|id| id.top_address),
                    component
                        .find_component(PeripheralType::Dwt)
                        .map(|id| id.top_address),
                );
                cores.push(state);
            }
        }

        if cores.is_empty() {
            if let Some(ap) = self
                .interface
                .access_ports()
                .iter()
                .find(|ap| ap.idr.is_mem_ap())
            {
                tracing::debug!("No SCS component identified; assuming one core on AP 0");
                cores.push(CortexMState::new(0, ap.apsel));
            }
        }

        self.cores = cores;
        Ok(())
    }

    /// A handle on core `n`. The handle borrows the session; drop it before
    /// asking for another one.
    pub fn core(&mut self, n: usize) -> Result<Core<'_>, Error> {
        let Session {
            interface,
            board,
            cores,
            sequence,
            events,
            ..
        } = self;

        let state = cores.get_mut(n).ok_or(Error::CoreNotFound(n))?;
        Ok(Core {
            state,
            dap: interface,
            memory_map: &board.memory_map,
            sequence,
            events,
        })
    }

    /// The target supply voltage, when the probe can measure it.
    pub fn target_voltage(&mut self) -> Result<Option<f32>, Error> {
        self.interface.target_voltage().map_err(Error::Probe)
    }

    /// Shut the session down, tolerating link errors at every step.
    ///
    /// Cores stop debugging first, then debug power is dropped and the probe
    /// disconnects. Errors are logged and swallowed per resource so a
    /// partial failure never leaks a handle.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }

        for index in 0..self.cores.len() {
            if let Ok(mut core) = self.core(index) {
                core.stop_debugging();
            }
        }

        if let Err(e) = self.interface.power_down_debug() {
            tracing::warn!("Failed to power down debug domain: {}", e);
        }

        if let Err(e) = self.interface.disconnect() {
            tracing::warn!("Failed to disconnect probe: {}", e);
        }

        self.opened = false;
        self.closed = true;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::core::{CoreState, ResetType};
    use crate::debug::breakpoints::BreakpointKind;
    use crate::event::DebugEvent;
    use crate::probe::fake_probe::{FakeOperation, FakeProbe, FakeStateHandle};

    fn open_session() -> (Session, FakeStateHandle) {
        let probe = FakeProbe::new();
        let handle = probe.state_handle();
        let mut session = Session::new(Box::new(probe));
        session.open().unwrap();
        (session, handle)
    }

    #[test]
    fn open_runs_the_bringup_sequence_in_order() {
        let (session, handle) = open_session();

        assert_eq!(session.core_count(), 1);

        let ops = handle.operations();
        // DPIDR read comes before the power-up request, which comes before
        // the first AP access.
        let dpidr_read = ops
            .iter()
            .position(|op| *op == FakeOperation::ReadDp(0x0))
            .unwrap();
        let powerup = ops
            .iter()
            .position(|op| matches!(op, FakeOperation::WriteDp(0x4, v) if v & (1 << 28) != 0))
            .unwrap();
        let first_ap = ops
            .iter()
            .position(|op| matches!(op, FakeOperation::ReadAp(..)))
            .unwrap();
        assert!(dpidr_read < powerup);
        assert!(powerup < first_ap);
    }

    #[test]
    fn open_switches_the_wire_to_swd() {
        let (_session, handle) = open_session();

        // Line reset, JTAG-to-SWD select sequence, line reset, idle.
        let sequences = handle.swj_sequences();
        assert_eq!(sequences.len(), 4);
        assert_eq!(sequences[1], (16, 0xE79E));
        assert_eq!(sequences[0], (51, 0x0007_FFFF_FFFF_FFFF));
    }

    #[test]
    fn open_twice_is_a_no_op() {
        let (mut session, handle) = open_session();
        handle.clear_operations();
        session.open().unwrap();
        assert!(handle.operations().is_empty());
    }

    #[test]
    fn invalid_core_number_is_reported() {
        let (mut session, _) = open_session();
        assert!(matches!(session.core(7), Err(Error::CoreNotFound(7))));
    }

    #[test]
    fn end_to_end_halt_and_read_pc() {
        let (mut session, handle) = open_session();
        handle.set_core_register(15, 0x0000_0400);

        let mut core = session.core(0).unwrap();
        core.halt().unwrap();
        assert_eq!(core.get_state().unwrap(), CoreState::Halted);

        let pc = core.read_core_register_raw(15).unwrap();
        assert_eq!(pc, 0x0000_0400);
    }

    #[test]
    fn end_to_end_breakpoint_and_memory_filter() {
        let (mut session, handle) = open_session();
        handle.load_memory(0x2000_0100, &[0x70, 0x47]);

        let mut core = session.core(0).unwrap();
        core.halt().unwrap();
        core.set_breakpoint(0x2000_0100, BreakpointKind::Auto)
            .unwrap();
        core.resume().unwrap();

        // The patched instruction is live but filtered on read.
        assert_eq!(
            handle.memory_contents(0x2000_0100, 2),
            vec![0x00, 0xBE]
        );
        let mut core = session.core(0).unwrap();
        core.halt().unwrap();
        assert_eq!(core.read_memory(0x2000_0100, 16).unwrap(), 0x4770);
    }

    #[test]
    fn end_to_end_reset_and_halt() {
        let (mut session, handle) = open_session();
        handle.load_memory(0x0, &0x2000_8000u32.to_le_bytes());
        handle.load_memory(0x4, &0x0000_0401u32.to_le_bytes());

        let mut core = session.core(0).unwrap();
        core.reset_and_halt(Some(ResetType::SwSysresetreq)).unwrap();
        assert_eq!(core.get_state().unwrap(), CoreState::Halted);
    }

    #[test]
    fn fault_recovery_leaves_session_usable() {
        let (mut session, handle) = open_session();
        handle.add_fault_address(0xE004_0000);

        let mut core = session.core(0).unwrap();
        assert!(core.read_memory(0xE004_0000, 32).is_err());

        handle.clear_operations();
        handle.clear_fault_address(0xE004_0000);

        // The next operation succeeds and re-issues SELECT first.
        let mut core = session.core(0).unwrap();
        core.read_memory(0x2000_0000, 32).unwrap();
        assert!(handle
            .operations()
            .iter()
            .any(|op| matches!(op, FakeOperation::WriteDp(0x8, _))));
    }

    #[test]
    fn close_disables_debug_and_is_idempotent() {
        let (mut session, handle) = open_session();

        {
            let mut core = session.core(0).unwrap();
            core.halt().unwrap();
            core.set_breakpoint(0x2000_0000, BreakpointKind::Sw)
                .unwrap();
            core.flush_breakpoints().unwrap();
        }

        session.close();
        session.close();

        // Halting debug got turned off on the way out, releasing the core.
        assert!(!handle.core_halted());
        // All patched breakpoints were restored.
        assert_eq!(handle.memory_contents(0x2000_0000, 2), vec![0x00, 0x00]);
    }

    #[test]
    fn events_reach_session_subscribers() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let (mut session, _) = open_session();
        let resumes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&resumes);
        session.subscribe(
            DebugEventKind::PostRun,
            Box::new(move |event| {
                if matches!(event, DebugEvent::PostRun(_)) {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            }),
        );

        let mut core = session.core(0).unwrap();
        core.halt().unwrap();
        core.resume().unwrap();

        assert_eq!(resumes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn options_round_trip() {
        let probe = FakeProbe::new();
        let mut session = Session::new(Box::new(probe));
        session
            .options_mut()
            .set("frequency_khz", OptionValue::Int(4_000));
        session
            .options_mut()
            .set("protocol", OptionValue::String("swd".to_string()));

        assert_eq!(session.options().get_int("frequency_khz", 1_000), 4_000);
        assert_eq!(session.options().get_str("protocol"), Some("swd"));
        assert!(session.options().get_bool("missing", true));

        session.open().unwrap();
    }
}
