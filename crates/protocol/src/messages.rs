//! Control messages exchanged during the connection handshake.
//!
//! These travel as envelope payloads between an instance and the hub it is
//! directly connected to. Everything else on the wire is opaque to the
//! transport.
//!
//! ```text
//! message ControlMessage {
//!     oneof body {
//!         CvidRequest    cvid_request    = 1;
//!         CvidResponse   cvid_response   = 2;
//!         LoginRequest   login_request   = 3;
//!         Outcome        outcome         = 4;
//!         EndpointClosed endpoint_closed = 5;
//!         Ping           ping            = 6;
//!         Ping           pong            = 7;
//!     }
//! }
//! ```

use bytes::Bytes;
use prost::Message;
use sha2::{Digest, Sha256};

use crate::cvid::{Cvid, InstanceType};
use crate::error::{ProtocolError, Result};

/// Envelope of every control message.
#[derive(Clone, PartialEq, Message)]
pub struct ControlMessage {
    #[prost(oneof = "control_message::Body", tags = "1, 2, 3, 4, 5, 6, 7")]
    pub body: Option<control_message::Body>,
}

/// Variants of [`ControlMessage`].
pub mod control_message {
    /// The control message body.
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Body {
        #[prost(message, tag = "1")]
        CvidRequest(super::CvidRequest),
        #[prost(message, tag = "2")]
        CvidResponse(super::CvidResponse),
        #[prost(message, tag = "3")]
        LoginRequest(super::LoginRequest),
        #[prost(message, tag = "4")]
        Outcome(super::Outcome),
        #[prost(message, tag = "5")]
        EndpointClosed(super::EndpointClosed),
        #[prost(message, tag = "6")]
        Ping(super::Ping),
        #[prost(message, tag = "7")]
        Pong(super::Ping),
    }
}

/// Ask the hub to assign a CVID.
#[derive(Clone, PartialEq, Message)]
pub struct CvidRequest {
    /// Wire value of the requester's [`InstanceType`].
    #[prost(uint32, tag = "1")]
    pub instance: u32,
    /// Requester's instance flavor (five bits).
    #[prost(uint32, tag = "2")]
    pub flavor: u32,
    /// Requester's long-term uuid.
    #[prost(string, tag = "3")]
    pub uuid: String,
}

/// The hub's answer to a [`CvidRequest`].
#[derive(Clone, PartialEq, Message)]
pub struct CvidResponse {
    /// CVID assigned to the requester. Zero signals refusal.
    #[prost(uint32, tag = "1")]
    pub cvid: u32,
    /// The hub's own CVID.
    #[prost(uint32, tag = "2")]
    pub server_cvid: u32,
    /// The hub's long-term uuid.
    #[prost(string, tag = "3")]
    pub server_uuid: String,
}

/// Credentials presented by a viewer.
#[derive(Clone, PartialEq, Message)]
pub struct LoginRequest {
    #[prost(string, tag = "1")]
    pub username: String,
    /// Lowercase hex SHA-256 of the plaintext password.
    #[prost(string, tag = "2")]
    pub password: String,
}

/// Generic success/failure result.
#[derive(Clone, PartialEq, Message)]
pub struct Outcome {
    #[prost(bool, tag = "1")]
    pub result: bool,
    #[prost(string, tag = "2")]
    pub comment: String,
}

/// Sent by the hub when a routed envelope's recipient is gone.
#[derive(Clone, PartialEq, Message)]
pub struct EndpointClosed {
    #[prost(uint32, tag = "1")]
    pub cvid: u32,
}

/// Keepalive probe, echoed back as `pong`.
#[derive(Clone, PartialEq, Message)]
pub struct Ping {
    #[prost(uint64, tag = "1")]
    pub timestamp: u64,
}

/// Lowercase hex SHA-256 of a plaintext password.
pub fn hash_password(plaintext: &str) -> String {
    hex::encode(Sha256::digest(plaintext.as_bytes()))
}

impl CvidRequest {
    pub fn new(instance: InstanceType, flavor: u8, uuid: impl Into<String>) -> Self {
        Self {
            instance: instance.as_u32(),
            flavor: u32::from(flavor),
            uuid: uuid.into(),
        }
    }

    /// The requested instance type, if known.
    pub fn instance_type(&self) -> Result<InstanceType> {
        InstanceType::from_u32(self.instance)
    }
}

impl LoginRequest {
    /// Build a login request, hashing the plaintext password.
    pub fn new(username: impl Into<String>, plaintext: &str) -> Self {
        Self {
            username: username.into(),
            password: hash_password(plaintext),
        }
    }
}

impl Outcome {
    pub fn success() -> Self {
        Self {
            result: true,
            comment: String::new(),
        }
    }

    pub fn failure(comment: impl Into<String>) -> Self {
        Self {
            result: false,
            comment: comment.into(),
        }
    }
}

impl ControlMessage {
    /// Wrap a body.
    pub fn new(body: control_message::Body) -> Self {
        Self { body: Some(body) }
    }

    /// Serialize for use as an envelope payload.
    pub fn to_payload(&self) -> Bytes {
        Bytes::from(self.encode_to_vec())
    }

    /// Parse an envelope payload.
    ///
    /// An empty or unrecognised body is reported as a deserialization error,
    /// since it carries nothing to act on.
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        let message = Self::decode(payload)
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        if message.body.is_none() {
            return Err(ProtocolError::Deserialization(
                "control message has no body".to_string(),
            ));
        }
        Ok(message)
    }
}

macro_rules! impl_into_control {
    ($($ty:ident => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for ControlMessage {
                fn from(value: $ty) -> Self {
                    ControlMessage::new(control_message::Body::$variant(value))
                }
            }
        )*
    };
}

impl_into_control! {
    CvidRequest => CvidRequest,
    CvidResponse => CvidResponse,
    LoginRequest => LoginRequest,
    Outcome => Outcome,
    EndpointClosed => EndpointClosed,
}

impl EndpointClosed {
    pub fn new(cvid: Cvid) -> Self {
        Self { cvid }
    }
}
