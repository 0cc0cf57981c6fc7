//! Service Layer
//!
//! Control HTTP server and built-in dependency probes.

pub mod control;
pub mod probe;

pub use control::{ControlState, StatusResponse};
pub use probe::HttpProbe;
