//! Debug-level services layered on the core: breakpoint management.

pub mod breakpoints;

pub use breakpoints::{Breakpoint, BreakpointKind, BreakpointManager};
