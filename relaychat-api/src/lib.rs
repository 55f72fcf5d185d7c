// relaychat API Library
//
// WebSocket transport and health probes in front of the relay engine

pub mod http;

// Re-export commonly used types
pub use http::{create_router, AppState};
