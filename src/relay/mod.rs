//! Relay layer connecting the front-end and kernel-manager processes.

pub mod codec;
pub mod endpoint;

pub use endpoint::{Outbound, RelayEndpoint, RelayHandler, RelaySender, Role};
