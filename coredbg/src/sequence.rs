//! Delegate hook points for chip-specific behavior.
//!
//! The layers above this crate override these hooks to inject device quirks
//! (debug unlocks, custom reset sequences, reset catch alternatives) without
//! modifying the core stack. Every hook has a default that does nothing.

use crate::core::ResetType;
use crate::coresight::ArmError;
use crate::memory::MemoryInterface;

/// Hooks invoked around core lifecycle operations.
pub trait DebugSequence: Send + Sync {
    /// Runs before the core's debug services are initialized.
    fn will_start_debug_core(&self, _memory: &mut dyn MemoryInterface) -> Result<(), ArmError> {
        Ok(())
    }

    /// Runs after the core's debug services are initialized.
    fn did_start_debug_core(&self, _memory: &mut dyn MemoryInterface) -> Result<(), ArmError> {
        Ok(())
    }

    /// Runs before the session stops debugging the core.
    fn will_stop_debug_core(&self, _memory: &mut dyn MemoryInterface) -> Result<(), ArmError> {
        Ok(())
    }

    /// Runs before a reset. Return `true` when the hook performed the reset
    /// itself and the default mechanism must be skipped.
    fn will_reset(
        &self,
        _memory: &mut dyn MemoryInterface,
        _reset_type: ResetType,
    ) -> Result<bool, ArmError> {
        Ok(false)
    }

    /// Runs after a reset was requested.
    fn did_reset(
        &self,
        _memory: &mut dyn MemoryInterface,
        _reset_type: ResetType,
    ) -> Result<(), ArmError> {
        Ok(())
    }

    /// Arms halt-on-reset. Return `true` when the hook handled it and the
    /// DEMCR-based default must be skipped.
    fn set_reset_catch(
        &self,
        _memory: &mut dyn MemoryInterface,
        _reset_type: ResetType,
    ) -> Result<bool, ArmError> {
        Ok(false)
    }

    /// Disarms halt-on-reset set up by [`DebugSequence::set_reset_catch`].
    fn clear_reset_catch(
        &self,
        _memory: &mut dyn MemoryInterface,
        _reset_type: ResetType,
    ) -> Result<(), ArmError> {
        Ok(())
    }
}

/// The sequence used when a board needs no special handling.
#[derive(Debug, Default)]
pub struct DefaultSequence;

impl DebugSequence for DefaultSequence {}
