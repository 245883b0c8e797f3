//! The envelope carried in every frame body.
//!
//! ```text
//! message Envelope {
//!     uint32 to      = 1;  // recipient CVID, 0 = directly connected peer
//!     uint32 from    = 2;  // sender CVID, 0 before the handshake
//!     int32  id      = 3;  // 0 = no id, even = request/response, odd = stream
//!     bytes  payload = 4;  // opaque to the transport
//! }
//! ```
//!
//! `to` and `from` lead the message so a hub can read the destination from
//! the first bytes of a body.

use bytes::Bytes;
use prost::Message;

use crate::cvid::Cvid;
use crate::error::{ProtocolError, Result};
use crate::ids::{self, IdKind};

/// Addressed, identified wrapper around an opaque payload.
#[derive(Clone, PartialEq, Message)]
pub struct Envelope {
    /// Recipient CVID.
    #[prost(uint32, tag = "1")]
    pub to: u32,
    /// Sender CVID.
    #[prost(uint32, tag = "2")]
    pub from: u32,
    /// Request, response or stream id.
    #[prost(int32, tag = "3")]
    pub id: i32,
    /// Application payload.
    #[prost(bytes = "bytes", tag = "4")]
    pub payload: Bytes,
}

impl Envelope {
    /// Create an envelope with no id addressed to `to`.
    pub fn new(to: Cvid, payload: impl Into<Bytes>) -> Self {
        Self {
            to,
            from: 0,
            id: 0,
            payload: payload.into(),
        }
    }

    /// Set the id.
    pub fn with_id(mut self, id: i32) -> Self {
        self.id = id;
        self
    }

    /// Set the sender.
    pub fn with_from(mut self, from: Cvid) -> Self {
        self.from = from;
        self
    }

    /// Build the response to this envelope: same id, addressed back to the
    /// sender.
    pub fn reply(&self, payload: impl Into<Bytes>) -> Self {
        Self {
            to: self.from,
            from: self.to,
            id: self.id,
            payload: payload.into(),
        }
    }

    /// Classify the id by parity.
    pub fn kind(&self) -> IdKind {
        ids::classify(self.id)
    }

    /// Serialize to protobuf bytes.
    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.encode_to_vec())
    }

    /// Parse from protobuf bytes.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::EnvelopeDecode`] if the body is not a valid envelope.
    pub fn from_bytes(body: impl bytes::Buf) -> Result<Self> {
        Self::decode(body).map_err(ProtocolError::from)
    }
}
