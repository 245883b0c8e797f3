//! # Tether Protocol Library
//!
//! Wire-level definitions shared by every Tether instance: the server hub,
//! agents and viewers.
//!
//! ## Overview
//!
//! - **Frame Codec**: unsigned LEB128 length prefix, restartable decoding
//! - **Envelope**: protobuf `{to, from, id, payload}` wrapper carried in each frame
//! - **Ids**: even request ids, odd stream ids, zero for fire-and-forget
//! - **CVIDs**: per-session instance ids with embedded instance type and flavor
//! - **Control Messages**: the CVID and login handshake
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │          Application Payload            │  opaque bytes
//! ├─────────────────────────────────────────┤
//! │               Envelope                  │  protobuf {to, from, id, payload}
//! ├─────────────────────────────────────────┤
//! │              Framing                    │  varint length prefix
//! ├─────────────────────────────────────────┤
//! │            Transport (TLS/TCP)          │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{Envelope, Frame, FrameCodec};
//!
//! let envelope = Envelope::new(0, b"hello".to_vec()).with_id(protocol::ids::next_request_id());
//!
//! let codec = FrameCodec::new();
//! let wire = codec.encode(&Frame::new(envelope.to_bytes())).unwrap();
//!
//! let (frame, consumed) = codec.decode(&wire).unwrap();
//! assert_eq!(consumed, wire.len());
//! assert_eq!(Envelope::from_bytes(frame.payload).unwrap(), envelope);
//! ```
//!
//! ## Modules
//!
//! - [`varint`]: LEB128 encoding
//! - [`framing`]: Frame codec
//! - [`envelope`]: Envelope message
//! - [`ids`]: Request and stream id allocation
//! - [`cvid`]: CVID generation and inspection
//! - [`messages`]: Handshake control messages
//! - [`error`]: Error types

pub mod cvid;
pub mod envelope;
pub mod error;
pub mod framing;
pub mod ids;
pub mod messages;
pub mod varint;

pub use cvid::{Cvid, InstanceType};
pub use envelope::Envelope;
pub use error::{ProtocolError, Result};
pub use framing::{Frame, FrameCodec, MAX_FRAME_SIZE};
pub use ids::{IdKind, NO_ID};
pub use messages::{control_message, ControlMessage};
