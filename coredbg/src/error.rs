//! The overarching error type of the crate.

use crate::coresight::ArmError;
use crate::probe::DebugProbeError;

/// The top level error type, wrapping every layer below.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An error in the probe driver or USB link occurred.
    #[error("An error with the usage of the probe occurred")]
    Probe(#[from] DebugProbeError),

    /// An error between the DP layer and the core services occurred.
    #[error("An ARM debug error occurred")]
    Arm(#[from] ArmError),

    /// The core with the given number does not exist.
    #[error("Core {0} does not exist")]
    CoreNotFound(usize),

    /// The session is not open.
    #[error("The session has not been opened")]
    NotOpen,

    /// Any other error occurred.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
