//! Host-side debug transport stack for ARM Cortex-M targets.
//!
//! The crate speaks the ARM Debug Interface (ADIv5) through a USB debug
//! adapter, drives the target's debug and access ports, discovers CoreSight
//! components through ROM tables and exposes Cortex-M core state: registers,
//! memory, execution control, breakpoints and watchpoints.
//!
//! ```no_run
//! use coredbg::probe::list_all_probes;
//! use coredbg::Session;
//!
//! # fn main() -> Result<(), coredbg::Error> {
//! let probes = list_all_probes();
//! let probe = probes[0].open()?;
//!
//! let mut session = Session::new(probe);
//! session.open()?;
//!
//! let mut core = session.core(0)?;
//! core.halt()?;
//! let pc = core.read_core_register("pc")?;
//! println!("halted at {:x?}", pc);
//! core.resume()?;
//! # Ok(())
//! # }
//! ```
//!
//! The layers, bottom up: [`probe`] (CMSIS-DAP and ST-Link transports),
//! [`coresight`] (DP/AP register access with caching and fault recovery, the
//! MEM-AP memory engine, ROM tables, FPB/DWT/ITM/TPIU), [`core`] (Cortex-M
//! services) and [`debug`] (breakpoint management). A [`Session`] ties one
//! probe, one board and its cores together.

#![warn(missing_docs)]

pub mod core;
pub mod coresight;
pub mod debug;
mod error;
pub mod event;
mod memory;
pub mod probe;
pub mod sequence;
mod session;
pub mod target;

pub use crate::core::{Core, CoreState, CortexMState, HaltReason, ResetType, VectorCatch};
pub use crate::coresight::{ArmError, DapController};
pub use crate::debug::breakpoints::{Breakpoint, BreakpointKind};
pub use crate::error::Error;
pub use crate::event::{DebugEvent, DebugEventKind};
pub use crate::memory::MemoryInterface;
pub use crate::probe::{DebugProbe, DebugProbeError, DebugProbeInfo, WireProtocol};
pub use crate::session::{OptionValue, Session, SessionOptions};
