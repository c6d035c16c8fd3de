//! Per-call context handed to handlers
//!
//! A [`CallContext`] is the only channel between a handler and its call: it reads requests,
//! writes responses, and carries metadata and the terminal status.

mod context;
mod state;

pub use context::{CallContext, CallId, Peer};
pub use state::{CallOutcome, CallShape, CallState};

pub(crate) use context::{CallParts, Inbound};
