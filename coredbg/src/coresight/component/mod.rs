//! Discoverable CoreSight components.

pub mod dwt;
pub mod fpb;
pub mod itm;
pub mod tpiu;

pub use dwt::{Dwt, Watchpoint, WatchpointKind};
pub use fpb::Fpb;
pub use itm::Itm;
pub use tpiu::Tpiu;
