//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering all possible failure modes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Serialization errors
    /// Failed to serialize data.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize data.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    // Frame errors
    /// The varint length prefix overflowed 64 bits.
    ///
    /// The stream can no longer be resynchronised, so this is fatal for the
    /// connection that produced it.
    #[error("malformed length prefix: varint exceeds 64 bits")]
    MalformedLength,

    /// Frame exceeds maximum allowed size.
    #[error("frame too large: {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge {
        /// Declared or actual frame size.
        size: u64,
        /// Maximum allowed size.
        max: usize,
    },

    // Envelope errors
    /// A complete frame body did not parse as an envelope.
    ///
    /// The frame boundary is still trusted, so only this envelope is lost.
    #[error("envelope decode failed: {0}")]
    EnvelopeDecode(String),

    // Identity errors
    /// A CVID was zero or carried an unknown instance type.
    #[error("invalid cvid: {0}")]
    InvalidCvid(u32),

    /// An instance type outside the known set.
    #[error("unknown instance type: {0}")]
    UnknownInstance(u32),
}

impl ProtocolError {
    /// Returns true if the error leaves the byte stream unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProtocolError::MalformedLength | ProtocolError::FrameTooLarge { .. }
        )
    }
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

// Conversions from underlying crate errors

impl From<prost::DecodeError> for ProtocolError {
    fn from(err: prost::DecodeError) -> Self {
        ProtocolError::EnvelopeDecode(err.to_string())
    }
}

impl From<prost::EncodeError> for ProtocolError {
    fn from(err: prost::EncodeError) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn test_serialization_error_display() {
        let err = ProtocolError::Serialization("buffer full".to_string());
        assert_eq!(err.to_string(), "serialization failed: buffer full");
    }

    #[test]
    fn test_malformed_length_display() {
        let err = ProtocolError::MalformedLength;
        assert_eq!(
            err.to_string(),
            "malformed length prefix: varint exceeds 64 bits"
        );
    }

    #[test]
    fn test_frame_too_large_error_display() {
        let err = ProtocolError::FrameTooLarge {
            size: 100_000,
            max: 65536,
        };
        assert_eq!(
            err.to_string(),
            "frame too large: 100000 bytes exceeds maximum of 65536 bytes"
        );
    }

    #[test]
    fn test_invalid_cvid_display() {
        assert_eq!(ProtocolError::InvalidCvid(0).to_string(), "invalid cvid: 0");
    }

    #[test]
    fn test_fatal_classification() {
        assert!(ProtocolError::MalformedLength.is_fatal());
        assert!(ProtocolError::FrameTooLarge { size: 1, max: 0 }.is_fatal());
        assert!(!ProtocolError::EnvelopeDecode("bad".into()).is_fatal());
        assert!(!ProtocolError::Serialization("bad".into()).is_fatal());
    }

    #[test]
    fn test_from_prost_decode_error() {
        // A length-delimited field that claims more bytes than exist
        let err = crate::Envelope::decode(&[0x22, 0x05, 0x01][..]).unwrap_err();
        let protocol_err: ProtocolError = err.into();
        assert!(matches!(protocol_err, ProtocolError::EnvelopeDecode(_)));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ProtocolError>();
    }
}
