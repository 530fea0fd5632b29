//! Server directory, connection lifecycle and request forwarding.

pub mod registry;
pub mod types;

pub use registry::Router;
pub use types::{RouterEvent, ServerRecord};
