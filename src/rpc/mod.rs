//! Call outcome vocabulary shared by the server, the wire format and the client
//!
//! Provides the canonical status codes and the ordered metadata representation.

pub mod metadata;
pub mod status;

pub use metadata::{Metadata, MetadataError, MetadataValue};
pub use status::{Status, StatusCode};
