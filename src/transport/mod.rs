//! Network plumbing between clients and the call runtime
//!
//! Provides the wire frame codec, the per-connection task that multiplexes calls, and the
//! credentials used to secure ports.

pub(crate) mod connection;
pub mod credentials;
pub mod frame;

pub use credentials::{AuthContext, ServerCredentials, TlsCredentials};
pub use frame::{CallHeader, Frame, FrameCodec, FrameError};
