//! Admin HTTP surface
//!
//! Liveness and a JSON snapshot of the runtime's lifecycle, ports and active calls.

pub mod handlers;
