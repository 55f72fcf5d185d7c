//! relaychat Protocol Definitions
//!
//! Wire types shared by the relay and its clients. Frames are JSON text, one
//! frame per WebSocket message, discriminated by a `type` field.

pub mod frame;
pub mod message;

pub use frame::{
    decode_inbound, decode_inbound_bytes, encode_server_frame, InboundFrame, ServerFrame,
};
pub use message::{Message, MessageId, Side};
