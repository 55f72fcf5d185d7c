//! Live connection tracking and the relay engine that owns the message log.

pub mod engine;
pub mod registry;

pub use engine::{Delivery, PersistFailurePolicy, RelayEngine, RelayPolicy};
pub use registry::{ConnectionHandle, ConnectionId, ConnectionRegistry, OutboundFrame, OutboundReceiver};
