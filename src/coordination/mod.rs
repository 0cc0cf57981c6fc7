//! Coordination Layer
//!
//! Shutdown coordination: coalesced termination requests, drain phases,
//! and OS signal routing.

pub mod shutdown;

pub use shutdown::{
    install_signal_handlers, ShutdownCoordinator, ShutdownPhase, ShutdownRequest, Termination,
};
