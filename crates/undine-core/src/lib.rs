//! undine-core: wire protocol for the undine process daemon.
//!
//! Provides the tagged record types exchanged with the controlling peer,
//! length-prefixed CBOR framing, and shape-reporting record decoding.

pub mod codec;
pub mod error;
pub mod messages;

// Re-export commonly used items at crate root.
pub use codec::{cbor_decode, decode_inbound, frame_encode, Decoded, FrameDecoder};
pub use error::{UndineError, UndineResult};
pub use messages::{ErrorCode, Inbound, InboundKind, Outbound};
