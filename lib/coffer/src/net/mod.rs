//! The networking side of the daemon: wire framing, per-donor sessions and
//! the readiness loop that serves them all.

pub mod dispenser;
pub mod endpoint;
pub mod registry;
pub mod session;
pub mod shared;
pub mod wire;
