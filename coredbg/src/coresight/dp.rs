//! The debug port layer.
//!
//! [`DapController`] owns the probe and funnels every DP/AP register access
//! through the SELECT cache. It powers up the debug domain, discovers access
//! ports, clears sticky errors after faults and invalidates its caches on
//! every error so no command ever runs against stale bank state.

use super::ap::{ap_addr, AccessPort, Base, Csw, Idr};
use super::memory::ApMemory;
use super::{ArmError, DapError, Register};
use crate::probe::{
    DebugProbe, DebugProbeError, DeferredResult, RegisterAddress, WireProtocol,
};

use bitfield::bitfield;
use jep106::JEP106Code;

use std::time::{Duration, Instant};

bitfield! {
    /// The DP ABORT register, at address 0x0 (write only).
    #[derive(Clone)]
    pub struct Abort(u32);
    impl Debug;
    /// Clear the overrun sticky flag.
    pub _, set_orunerrclr: 4;
    /// Clear the write data error sticky flag.
    pub _, set_wderrclr: 3;
    /// Clear the sticky error flag.
    pub _, set_stkerrclr: 2;
    /// Clear the sticky compare flag.
    pub _, set_stkcmpclr: 1;
    /// Abort the current AP transaction.
    pub _, set_dapabort: 0;
}

impl Abort {
    /// An ABORT value clearing every sticky flag.
    pub fn clear_all() -> Abort {
        let mut abort = Abort(0);
        abort.set_orunerrclr(true);
        abort.set_wderrclr(true);
        abort.set_stkerrclr(true);
        abort.set_stkcmpclr(true);
        abort
    }
}

impl From<u32> for Abort {
    fn from(raw: u32) -> Self {
        Abort(raw)
    }
}

impl From<Abort> for u32 {
    fn from(raw: Abort) -> Self {
        raw.0
    }
}

impl Register for Abort {
    const ADDRESS: u8 = 0x0;
    const NAME: &'static str = "ABORT";
}

bitfield! {
    /// The DP CTRL/STAT register, at address 0x4 (bank 0).
    #[derive(Clone, Default)]
    pub struct Ctrl(u32);
    impl Debug;
    /// System power-up acknowledge.
    pub csyspwrupack, _: 31;
    /// System power-up request.
    pub csyspwrupreq, set_csyspwrupreq: 30;
    /// Debug power-up acknowledge.
    pub cdbgpwrupack, _: 29;
    /// Debug power-up request.
    pub cdbgpwrupreq, set_cdbgpwrupreq: 28;
    /// Debug reset acknowledge.
    pub cdbgrstack, _: 27;
    /// Debug reset request.
    pub c_dbg_rst_req, set_c_dbg_rst_req: 26;
    /// Transaction counter.
    pub u16, trn_cnt, set_trn_cnt: 23, 12;
    /// The byte lanes masked on pushed compares.
    pub u8, mask_lane, set_mask_lane: 11, 8;
    /// A write data error occurred.
    pub w_data_err, _: 7;
    /// The response to a previous read was OK.
    pub read_ok, _: 6;
    /// A FAULT was issued by the target; sticky.
    pub sticky_err, set_sticky_err: 5;
    /// A pushed compare mismatch occurred; sticky.
    pub stick_cmp, _: 4;
    /// The transfer mode.
    pub u8, trn_mode, _: 3, 2;
    /// An overrun occurred; sticky.
    pub sticky_orun, _: 1;
    /// Overrun detection enable.
    pub orun_detect, set_orun_detect: 0;
}

impl From<u32> for Ctrl {
    fn from(raw: u32) -> Self {
        Ctrl(raw)
    }
}

impl From<Ctrl> for u32 {
    fn from(raw: Ctrl) -> Self {
        raw.0
    }
}

impl Register for Ctrl {
    const ADDRESS: u8 = 0x4;
    const NAME: &'static str = "CTRL/STAT";
}

bitfield! {
    /// The DP SELECT register, at address 0x8 (write only).
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct Select(u32);
    impl Debug;
    /// The selected access port.
    pub u8, ap_sel, set_ap_sel: 31, 24;
    /// The selected 16-byte AP register bank.
    pub u8, ap_bank_sel, set_ap_bank_sel: 7, 4;
    /// The selected DP register bank.
    pub u8, dp_bank_sel, set_dp_bank_sel: 3, 0;
}

impl From<u32> for Select {
    fn from(raw: u32) -> Self {
        Select(raw)
    }
}

impl From<Select> for u32 {
    fn from(raw: Select) -> Self {
        raw.0
    }
}

impl Register for Select {
    const ADDRESS: u8 = 0x8;
    const NAME: &'static str = "SELECT";
}

bitfield! {
    /// The DP identification register, at address 0x0 (read only).
    #[derive(Clone)]
    pub struct Dpidr(u32);
    impl Debug;
    /// The DP revision.
    pub u8, revision, _: 31, 28;
    /// The DP part number.
    pub u8, part_no, _: 27, 20;
    /// This is a minimal DP implementation.
    pub min, _: 16;
    /// The DP architecture version.
    pub u8, version, _: 15, 12;
    u8, jep_cc, _: 11, 8;
    u8, jep_id, _: 7, 1;
}

impl From<u32> for Dpidr {
    fn from(raw: u32) -> Self {
        Dpidr(raw)
    }
}

impl From<Dpidr> for u32 {
    fn from(raw: Dpidr) -> Self {
        raw.0
    }
}

impl Register for Dpidr {
    const ADDRESS: u8 = 0x0;
    const NAME: &'static str = "DPIDR";
}

/// The architecture version of a debug port.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DebugPortVersion {
    /// DPv0 (JTAG only, no DPIDR).
    DPv0,
    /// DPv1.
    DPv1,
    /// DPv2.
    DPv2,
    /// A version this crate does not support.
    Unsupported,
}

impl From<u8> for DebugPortVersion {
    fn from(value: u8) -> Self {
        match value {
            0 => DebugPortVersion::DPv0,
            1 => DebugPortVersion::DPv1,
            2 => DebugPortVersion::DPv2,
            _ => DebugPortVersion::Unsupported,
        }
    }
}

/// Whether the DP is a minimal implementation without pushed operations.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MinDpSupport {
    /// The full DP register set is implemented.
    NotImplemented,
    /// The minimal DP register set is implemented.
    Implemented,
}

impl From<bool> for MinDpSupport {
    fn from(bit_set: bool) -> Self {
        if bit_set {
            MinDpSupport::Implemented
        } else {
            MinDpSupport::NotImplemented
        }
    }
}

/// Decoded DPIDR snapshot.
#[derive(Debug, Clone)]
pub struct DebugPortId {
    /// The DP revision.
    pub revision: u8,
    /// The DP part number.
    pub part_no: u8,
    /// The DP architecture version.
    pub version: DebugPortVersion,
    /// Whether the DP is a minimal implementation.
    pub min_dp_support: MinDpSupport,
    /// The designer of the DP.
    pub designer: JEP106Code,
}

impl From<Dpidr> for DebugPortId {
    fn from(dpidr: Dpidr) -> DebugPortId {
        DebugPortId {
            revision: dpidr.revision(),
            part_no: dpidr.part_no(),
            version: dpidr.version().into(),
            min_dp_support: dpidr.min().into(),
            designer: JEP106Code::new(dpidr.jep_cc(), dpidr.jep_id()),
        }
    }
}

/// Called after a transfer fault once the sticky error has been cleared.
pub type FaultHandler = Box<dyn FnMut(&ArmError) + Send>;

/// The debug port controller.
///
/// All DP and AP register traffic of a session flows through this type. The
/// 28 bit AP addresses used by [`DapController::read_ap`] and friends follow
/// `(APSEL << 24) | (APBANKSEL << 4) | A[3:2]`.
pub struct DapController {
    probe: Box<dyn DebugProbe>,
    dp_id: Option<DebugPortId>,
    /// The SELECT value on the target, `None` when unknown.
    select: Option<u32>,
    /// The CSW value on the target and the AP it was written to, `None` when
    /// unknown.
    csw: Option<(u8, u32)>,
    aps: Vec<AccessPort>,
    fault_handler: Option<FaultHandler>,
}

impl std::fmt::Debug for DapController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DapController")
            .field("probe", &self.probe.name())
            .field("dp_id", &self.dp_id)
            .field("select", &self.select)
            .field("csw", &self.csw)
            .field("aps", &self.aps)
            .finish()
    }
}

impl DapController {
    /// Wrap a probe. No wire traffic happens until [`DapController::init`].
    pub fn new(probe: Box<dyn DebugProbe>) -> Self {
        DapController {
            probe,
            dp_id: None,
            select: None,
            csw: None,
            aps: Vec::new(),
            fault_handler: None,
        }
    }

    /// Install a callback invoked after transfer-fault recovery.
    pub fn set_fault_handler(&mut self, handler: FaultHandler) {
        self.fault_handler = Some(handler);
    }

    /// The decoded DPIDR, once [`DapController::init`] has run.
    pub fn dp_id(&self) -> Option<&DebugPortId> {
        self.dp_id.as_ref()
    }

    /// The discovered access ports.
    pub fn access_ports(&self) -> &[AccessPort] {
        &self.aps
    }

    /// The access port with the given APSEL, if discovered.
    pub fn access_port(&self, apsel: u8) -> Option<&AccessPort> {
        self.aps.iter().find(|ap| ap.apsel == apsel)
    }

    /// Give the probe back, consuming the controller.
    pub fn close(self) -> Box<dyn DebugProbe> {
        self.probe
    }

    /// Connect the probe with the given (or default) wire protocol.
    pub fn connect(&mut self, protocol: Option<WireProtocol>) -> Result<WireProtocol, DebugProbeError> {
        self.invalidate_caches();
        self.probe.attach(protocol)
    }

    /// Disconnect the probe from the target.
    pub fn disconnect(&mut self) -> Result<(), DebugProbeError> {
        self.invalidate_caches();
        self.probe.detach()
    }

    /// Set the wire clock, returning the frequency actually configured.
    pub fn set_clock(&mut self, speed_khz: u32) -> Result<u32, DebugProbeError> {
        self.probe.set_speed(speed_khz)
    }

    /// Drive or release the nRESET line. Caches are invalidated, because the
    /// target side of the link does not survive a reset.
    pub fn assert_reset(&mut self, assert: bool) -> Result<(), DebugProbeError> {
        self.invalidate_caches();
        self.probe.assert_reset(assert)
    }

    /// Whether the probe currently drives nRESET low.
    pub fn is_reset_asserted(&self) -> bool {
        self.probe.is_reset_asserted()
    }

    /// Pulse the reset line.
    pub fn reset(&mut self) -> Result<(), DebugProbeError> {
        self.assert_reset(true)?;
        std::thread::sleep(std::time::Duration::from_millis(10));
        self.assert_reset(false)
    }

    /// The target supply voltage, when the probe can measure it.
    pub fn target_voltage(&mut self) -> Result<Option<f32>, DebugProbeError> {
        self.probe.target_voltage()
    }

    /// Bring the wire into SWD mode, read DPIDR and clear any sticky error
    /// flags left from previous sessions.
    pub fn init(&mut self) -> Result<(), ArmError> {
        self.invalidate_caches();

        if self.probe.active_protocol() == Some(WireProtocol::Swd) {
            self.swd_line_reset()?;
        }

        let dpidr = Dpidr(self.read_dp(Dpidr::ADDRESS)?);
        let dp_id: DebugPortId = dpidr.into();
        tracing::info!(
            "DP version {:?}, MinDP: {:?}, designer: {:?}",
            dp_id.version,
            dp_id.min_dp_support,
            dp_id.designer.get()
        );
        self.dp_id = Some(dp_id);

        self.write_dp(Abort::ADDRESS, Abort::clear_all().into())?;

        Ok(())
    }

    /// Reset the SWD line and switch a SWJ-DP from JTAG to SWD.
    ///
    /// At least 50 clocks with SWDIO high, the 0xE79E select sequence,
    /// another line reset, then idle cycles so the first transfer starts
    /// clean. Probes whose firmware performs this itself report the command
    /// as unsupported, which is fine.
    fn swd_line_reset(&mut self) -> Result<(), ArmError> {
        let result = (|| {
            self.probe.swj_sequence(51, 0x0007_FFFF_FFFF_FFFF)?;
            self.probe.swj_sequence(16, 0xE79E)?;
            self.probe.swj_sequence(51, 0x0007_FFFF_FFFF_FFFF)?;
            self.probe.swj_sequence(3, 0x0)
        })();

        match result {
            Ok(()) => Ok(()),
            Err(DebugProbeError::CommandNotSupportedByProbe { .. }) => {
                tracing::debug!("Probe performs the SWD switch sequence itself");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Request debug and system power and wait for both acknowledges.
    pub fn power_up_debug(&mut self) -> Result<(), ArmError> {
        let mut ctrl = Ctrl(0);
        ctrl.set_cdbgpwrupreq(true);
        ctrl.set_csyspwrupreq(true);
        self.write_dp(Ctrl::ADDRESS, ctrl.clone().into())?;

        let start = Instant::now();
        loop {
            let stat = Ctrl(self.read_dp(Ctrl::ADDRESS)?);
            if stat.cdbgpwrupack() && stat.csyspwrupack() {
                break;
            }
            if start.elapsed() > Duration::from_secs(2) {
                tracing::error!("Debug power-up request was not acknowledged");
                return Err(ArmError::Timeout);
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        // Normal transaction mode, mask lane all bytes.
        ctrl.set_mask_lane(0xF);
        self.write_dp(Ctrl::ADDRESS, ctrl.into())?;

        Ok(())
    }

    /// Drop the power-up requests. Errors are reported but the controller
    /// stays usable, so shutdown can proceed past a dead link.
    pub fn power_down_debug(&mut self) -> Result<(), ArmError> {
        self.write_dp(Ctrl::ADDRESS, 0)
    }

    /// Scan APSEL values until the first AP with an IDR of zero and describe
    /// every AP found.
    pub fn find_aps(&mut self) -> Result<&[AccessPort], ArmError> {
        let mut aps = Vec::new();

        for apsel in 0..=255u8 {
            let idr = Idr::from(self.read_ap(ap_addr(apsel, Idr::ADDRESS))?);
            if u32::from(idr) == 0 {
                break;
            }

            let base = if idr.is_mem_ap() {
                Base::from(self.read_ap(ap_addr(apsel, Base::ADDRESS))?)
            } else {
                Base::from(0xFFFF_FFFF)
            };

            let ap = AccessPort::new(apsel, idr, base);
            tracing::info!(
                "AP {}: IDR {:#010x}, ROM table {:?}",
                apsel,
                u32::from(ap.idr),
                ap.rom_table_base
            );
            aps.push(ap);
        }

        self.aps = aps;
        Ok(&self.aps)
    }

    /// A memory engine for the MEM-AP with the given APSEL.
    pub fn memory_interface(&mut self, apsel: u8) -> Result<ApMemory<'_>, ArmError> {
        let wrap_size = self
            .access_port(apsel)
            .map(|ap| ap.wrap_size)
            .unwrap_or(super::ap::DEFAULT_WRAP_SIZE);
        Ok(ApMemory::new(self, apsel, wrap_size))
    }

    /// Read a DP register.
    pub fn read_dp(&mut self, address: u8) -> Result<u32, ArmError> {
        let result = self.probe.raw_read_register(RegisterAddress::Dp(address));
        self.check(result)
    }

    /// Write a DP register.
    pub fn write_dp(&mut self, address: u8, value: u32) -> Result<(), ArmError> {
        // A direct SELECT write makes the cache track the new value.
        if address == Select::ADDRESS {
            self.select = Some(value);
        }
        let result = self
            .probe
            .raw_write_register(RegisterAddress::Dp(address), value);
        self.check(result)
    }

    /// Read an AP register addressed by its 28 bit address.
    pub fn read_ap(&mut self, addr28: u32) -> Result<u32, ArmError> {
        self.ensure_select(addr28)?;
        let result = self.probe.raw_read_register(Self::ap_register(addr28));
        self.check(result)
    }

    /// Issue an AP register read without demanding the value.
    pub fn read_ap_deferred(&mut self, addr28: u32) -> Result<DeferredResult, ArmError> {
        self.ensure_select(addr28)?;
        let result = self
            .probe
            .raw_read_register_deferred(Self::ap_register(addr28));
        self.check(result)
    }

    /// Issue a DP register read without demanding the value.
    pub fn read_dp_deferred(&mut self, address: u8) -> Result<DeferredResult, ArmError> {
        let result = self
            .probe
            .raw_read_register_deferred(RegisterAddress::Dp(address));
        self.check(result)
    }

    /// Demand the value of a previously issued deferred read.
    pub fn resolve(&mut self, deferred: DeferredResult) -> Result<u32, ArmError> {
        let result = self.probe.resolve_deferred(deferred);
        self.check(result)
    }

    /// Write an AP register addressed by its 28 bit address.
    pub fn write_ap(&mut self, addr28: u32, value: u32) -> Result<(), ArmError> {
        self.ensure_select(addr28)?;
        let result = self
            .probe
            .raw_write_register(Self::ap_register(addr28), value);
        self.check(result)
    }

    /// Read `values.len()` words from one AP register with a block transfer.
    pub fn read_ap_repeated(&mut self, addr28: u32, values: &mut [u32]) -> Result<(), ArmError> {
        self.ensure_select(addr28)?;
        let result = self.probe.raw_read_block(Self::ap_register(addr28), values);
        self.check(result)
    }

    /// Write `values` to one AP register with a block transfer.
    pub fn write_ap_repeated(&mut self, addr28: u32, values: &[u32]) -> Result<(), ArmError> {
        self.ensure_select(addr28)?;
        let result = self
            .probe
            .raw_write_block(Self::ap_register(addr28), values);
        self.check(result)
    }

    /// Write the CSW of an AP, skipping the wire when the cached value
    /// already matches.
    pub fn write_csw(&mut self, apsel: u8, csw: Csw) -> Result<(), ArmError> {
        let value: u32 = csw.into();
        if self.csw == Some((apsel, value)) {
            return Ok(());
        }
        self.write_ap(ap_addr(apsel, Csw::ADDRESS), value)?;
        self.csw = Some((apsel, value));
        Ok(())
    }

    /// Force all pending transport operations out.
    pub fn flush(&mut self) -> Result<(), ArmError> {
        let result = self.probe.raw_flush();
        self.check(result)
    }

    /// Whether the probe implements its own memory transfer commands.
    pub(crate) fn has_native_memory_access(&self) -> bool {
        self.probe.has_native_memory_access()
    }

    pub(crate) fn read_memory_native(
        &mut self,
        apsel: u8,
        address: u32,
        data: &mut [u8],
        width: usize,
    ) -> Result<(), ArmError> {
        let result = self.probe.read_memory_native(apsel, address, data, width);
        self.check(result)
    }

    pub(crate) fn write_memory_native(
        &mut self,
        apsel: u8,
        address: u32,
        data: &[u8],
        width: usize,
    ) -> Result<(), ArmError> {
        let result = self.probe.write_memory_native(apsel, address, data, width);
        self.check(result)
    }

    fn ap_register(addr28: u32) -> RegisterAddress {
        RegisterAddress::Ap {
            apsel: (addr28 >> 24) as u8,
            address: (addr28 & 0xFC) as u8,
        }
    }

    /// Write SELECT for the given AP address, unless the cached value
    /// already matches.
    fn ensure_select(&mut self, addr28: u32) -> Result<(), ArmError> {
        let select = addr28 & 0xFF00_00F0;
        if self.select == Some(select) {
            return Ok(());
        }

        tracing::debug!("Writing SELECT = {:#010x}", select);
        let result = self
            .probe
            .raw_write_register(RegisterAddress::Dp(Select::ADDRESS), select);
        self.check(result)?;
        self.select = Some(select);
        Ok(())
    }

    /// Drop all knowledge about target-side register state.
    pub fn invalidate_caches(&mut self) {
        self.select = None;
        self.csw = None;
    }

    /// Funnel for every probe result: any error invalidates the caches
    /// before it propagates, and faults additionally clear the sticky error
    /// and notify the fault handler. The original transaction is never
    /// retried here.
    fn check<T>(&mut self, result: Result<T, ArmError>) -> Result<T, ArmError> {
        let error = match result {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        self.invalidate_caches();

        if matches!(
            error,
            ArmError::Dap(DapError::FaultResponse) | ArmError::TransferFault { .. }
        ) {
            if let Err(e) = self.clear_sticky_errors() {
                tracing::warn!("Failed to clear sticky errors after fault: {}", e);
            }
            let mut handler = self.fault_handler.take();
            if let Some(callback) = handler.as_mut() {
                callback(&error);
            }
            self.fault_handler = handler;
        }

        Err(error)
    }

    /// Clear the sticky error flags: through ABORT on SWD, through a
    /// CTRL/STAT write on JTAG.
    fn clear_sticky_errors(&mut self) -> Result<(), ArmError> {
        match self.probe.active_protocol() {
            Some(WireProtocol::Jtag) => {
                let raw = self
                    .probe
                    .raw_read_register(RegisterAddress::Dp(Ctrl::ADDRESS))?;
                let mut ctrl = Ctrl(raw);
                ctrl.set_sticky_err(true);
                self.probe
                    .raw_write_register(RegisterAddress::Dp(Ctrl::ADDRESS), ctrl.into())
            }
            _ => {
                let mut abort = Abort(0);
                abort.set_stkerrclr(true);
                self.probe
                    .raw_write_register(RegisterAddress::Dp(Abort::ADDRESS), abort.into())
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::probe::fake_probe::{FakeOperation, FakeProbe};

    fn controller() -> (DapController, crate::probe::fake_probe::FakeStateHandle) {
        let probe = FakeProbe::new();
        let handle = probe.state_handle();
        (DapController::new(Box::new(probe)), handle)
    }

    #[test]
    fn init_reads_dpidr_and_clears_sticky() {
        let (mut dap, handle) = controller();
        dap.init().unwrap();

        let id = dap.dp_id().unwrap();
        assert_eq!(id.version, DebugPortVersion::DPv1);
        assert_eq!(id.designer.get(), Some("ARM Ltd"));

        let ops = handle.operations();
        assert_eq!(ops[0], FakeOperation::ReadDp(0x0));
        assert!(matches!(ops[1], FakeOperation::WriteDp(0x0, _)));
    }

    #[test]
    fn power_up_debug_sets_requests_and_sees_acks() {
        let (mut dap, handle) = controller();
        dap.init().unwrap();
        dap.power_up_debug().unwrap();

        let ops = handle.operations();
        // Request write, at least one status poll, then the mask-lane write.
        assert!(ops.contains(&FakeOperation::WriteDp(
            0x4,
            (1 << 28) | (1 << 30)
        )));
        assert!(ops.iter().any(|op| matches!(
            op,
            FakeOperation::WriteDp(0x4, v) if v & (0xF << 8) == (0xF << 8)
        )));
    }

    #[test]
    fn select_cache_elides_redundant_writes() {
        let (mut dap, handle) = controller();
        dap.init().unwrap();
        handle.clear_operations();

        // Two reads from the same AP bank: one SELECT write.
        dap.read_ap(ap_addr(0, 0x00)).unwrap();
        dap.read_ap(ap_addr(0, 0x04)).unwrap();

        let select_writes = handle
            .operations()
            .iter()
            .filter(|op| matches!(op, FakeOperation::WriteDp(0x8, _)))
            .count();
        assert_eq!(select_writes, 1);

        // A different bank forces a new SELECT.
        dap.read_ap(ap_addr(0, 0xFC)).unwrap();
        let select_writes = handle
            .operations()
            .iter()
            .filter(|op| matches!(op, FakeOperation::WriteDp(0x8, _)))
            .count();
        assert_eq!(select_writes, 2);
    }

    #[test]
    fn find_aps_stops_at_first_empty_idr() {
        let (mut dap, _handle) = controller();
        dap.init().unwrap();

        let aps = dap.find_aps().unwrap();
        assert_eq!(aps.len(), 1);
        assert_eq!(aps[0].apsel, 0);
        assert_eq!(aps[0].rom_table_base, Some(0xE00F_F000));
        assert_eq!(aps[0].wrap_size, 0x1000);
    }

    #[test]
    fn fault_invalidates_select_cache_and_clears_sticky() {
        let (mut dap, handle) = controller();
        dap.init().unwrap();
        dap.find_aps().unwrap();
        handle.add_fault_address(0xE000_0000);

        // Point TAR at the faulting address and read DRW.
        dap.write_csw(0, Csw::memory_access(
            super::super::ap::DataSize::U32,
            super::super::ap::AddressIncrement::Single,
        ))
        .unwrap();
        dap.write_ap(ap_addr(0, 0x04), 0xE000_0000).unwrap();
        let error = dap.read_ap(ap_addr(0, 0x0C)).unwrap_err();
        assert!(matches!(error, ArmError::Dap(DapError::FaultResponse)));

        handle.clear_operations();
        handle.clear_fault_address(0xE000_0000);

        // The next AP access must re-issue SELECT.
        dap.read_ap(ap_addr(0, 0x00)).unwrap();
        assert!(handle
            .operations()
            .iter()
            .any(|op| matches!(op, FakeOperation::WriteDp(0x8, _))));
    }

    #[test]
    fn fault_handler_runs_once_per_fault() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let (mut dap, handle) = controller();
        dap.init().unwrap();
        handle.add_fault_address(0x1000_0000);

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in_handler = Arc::clone(&calls);
        dap.set_fault_handler(Box::new(move |_| {
            calls_in_handler.fetch_add(1, Ordering::SeqCst);
        }));

        dap.write_csw(0, Csw::memory_access(
            super::super::ap::DataSize::U32,
            super::super::ap::AddressIncrement::Single,
        ))
        .unwrap();
        dap.write_ap(ap_addr(0, 0x04), 0x1000_0000).unwrap();
        let _ = dap.read_ap(ap_addr(0, 0x0C)).unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn csw_cache_elides_redundant_writes() {
        let (mut dap, handle) = controller();
        dap.init().unwrap();
        handle.clear_operations();

        let csw = Csw::memory_access(
            super::super::ap::DataSize::U32,
            super::super::ap::AddressIncrement::Single,
        );
        dap.write_csw(0, csw.clone()).unwrap();
        dap.write_csw(0, csw).unwrap();

        let csw_writes = handle
            .operations()
            .iter()
            .filter(|op| matches!(op, FakeOperation::WriteAp(0, 0x00, _)))
            .count();
        assert_eq!(csw_writes, 1);
    }
}
