//! rgate-core: shared protocol library for the remote session gateway.
//!
//! Provides the JSON envelope model, the wire codec, and the error taxonomy
//! surfaced to callers.

pub mod codec;
pub mod error;
pub mod messages;

// Re-export commonly used items at crate root.
pub use codec::{decode, encode, encode_text, peek_id};
pub use error::{ErrorKind, GatewayError, GatewayResult};
pub use messages::{now_millis, Envelope, MsgType, Payload, PROTOCOL_VERSION};
