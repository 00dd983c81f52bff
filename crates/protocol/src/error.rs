//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering all possible failure modes.
///
/// The rejection family (`AuthenticationFailed`, `UnauthorizedClient`,
/// `MalformedEnvelope`, `RequestExpired`) is produced locally from the
/// envelope state and is never transmitted to the peer. `LogicError` is
/// the only kind whose text crosses the encrypted boundary.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Key errors
    /// A textual key did not decode to exactly 32 bytes.
    #[error("invalid key encoding: {0}")]
    InvalidKeyEncoding(String),

    /// The operating system entropy source failed.
    #[error("entropy source failure: {0}")]
    Entropy(String),

    /// A client call was attempted before both static keys were set.
    #[error("missing key: {0}")]
    MissingKey(String),

    // Envelope errors
    /// AEAD open failed: wrong key, tampered ciphertext or wrong nonce.
    #[error("authentication failed")]
    AuthenticationFailed,

    /// Caller fingerprint is not allow-listed or its proof did not match.
    #[error("unauthorized client")]
    UnauthorizedClient,

    /// Decrypted plaintext is too short or has a bad length prefix.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// Request timestamp is older than the freshness window.
    #[error("request expired: {age_secs}s old")]
    RequestExpired {
        /// Age of the request in seconds.
        age_secs: i64,
    },

    /// Response timestamp is older than the freshness window.
    #[error("response expired: {age_secs}s old, sync time with server")]
    ResponseExpired {
        /// Age of the response in seconds.
        age_secs: i64,
    },

    /// Unexpected result tag, oversized field or bad transport framing.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Application-level failure returned by a handler, carried verbatim.
    #[error("{0}")]
    LogicError(String),

    /// Server-side fault unrelated to the caller's input.
    #[error("internal fault: {0}")]
    InternalFault(String),

    // Serialization errors
    /// Failed to serialize a payload.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize a payload.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    // Transport errors
    /// Ciphertext exceeds what the stream framing can carry.
    #[error("frame too large: {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge {
        /// Actual ciphertext size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// Connection was closed unexpectedly.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Operation timed out.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// The transport reported a failure (I/O error, non-success status).
    #[error("transport failed: {0}")]
    Transport(String),
}

impl ProtocolError {
    /// Returns true for caller-caused rejections.
    ///
    /// Transport bindings must map every rejection to the same externally
    /// observable signal so that the reason never leaks.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            ProtocolError::AuthenticationFailed
                | ProtocolError::UnauthorizedClient
                | ProtocolError::MalformedEnvelope(_)
                | ProtocolError::RequestExpired { .. }
                | ProtocolError::InvalidKeyEncoding(_)
                | ProtocolError::ProtocolViolation(_)
        )
    }

    /// Returns true for server-side faults that must be signalled
    /// differently from rejections.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            ProtocolError::InternalFault(_) | ProtocolError::Entropy(_)
        )
    }
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

// Conversions from underlying crate errors

impl From<rmp_serde::encode::Error> for ProtocolError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for ProtocolError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        ProtocolError::Deserialization(err.to_string())
    }
}

impl From<base64::DecodeError> for ProtocolError {
    fn from(err: base64::DecodeError) -> Self {
        ProtocolError::InvalidKeyEncoding(err.to_string())
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut => ProtocolError::Timeout(err.to_string()),
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => ProtocolError::ConnectionClosed(err.to_string()),
            _ => ProtocolError::Transport(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authentication_failed_display_has_no_detail() {
        let err = ProtocolError::AuthenticationFailed;
        assert_eq!(err.to_string(), "authentication failed");
    }

    #[test]
    fn test_unauthorized_client_display() {
        assert_eq!(
            ProtocolError::UnauthorizedClient.to_string(),
            "unauthorized client"
        );
    }

    #[test]
    fn test_logic_error_display_is_verbatim() {
        let err = ProtocolError::LogicError("unknown name".to_string());
        assert_eq!(err.to_string(), "unknown name");
    }

    #[test]
    fn test_expired_display() {
        let err = ProtocolError::RequestExpired { age_secs: 181 };
        assert_eq!(err.to_string(), "request expired: 181s old");

        let err = ProtocolError::ResponseExpired { age_secs: 200 };
        assert!(err.to_string().starts_with("response expired: 200s old"));
    }

    #[test]
    fn test_frame_too_large_error_display() {
        let err = ProtocolError::FrameTooLarge {
            size: 100_000,
            max: 65535,
        };
        assert_eq!(
            err.to_string(),
            "frame too large: 100000 bytes exceeds maximum of 65535 bytes"
        );
    }

    #[test]
    fn test_rejection_classification() {
        assert!(ProtocolError::AuthenticationFailed.is_rejection());
        assert!(ProtocolError::UnauthorizedClient.is_rejection());
        assert!(ProtocolError::MalformedEnvelope("short".into()).is_rejection());
        assert!(ProtocolError::RequestExpired { age_secs: 500 }.is_rejection());

        assert!(!ProtocolError::InternalFault("boom".into()).is_rejection());
        assert!(!ProtocolError::LogicError("nope".into()).is_rejection());
    }

    #[test]
    fn test_internal_classification() {
        assert!(ProtocolError::InternalFault("dispatcher".into()).is_internal());
        assert!(ProtocolError::Entropy("rng".into()).is_internal());
        assert!(!ProtocolError::AuthenticationFailed.is_internal());
        assert!(!ProtocolError::UnauthorizedClient.is_internal());
    }

    #[test]
    fn test_from_rmp_serde_decode_error() {
        #[derive(Debug, serde::Deserialize)]
        #[allow(dead_code)]
        struct TestStruct {
            field: String,
        }
        let msgpack_err = rmp_serde::from_slice::<TestStruct>(&[0x00]).unwrap_err();
        let protocol_err: ProtocolError = msgpack_err.into();
        assert!(matches!(protocol_err, ProtocolError::Deserialization(_)));
    }

    #[test]
    fn test_from_io_error_timeout() {
        let io_err = std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out");
        let protocol_err: ProtocolError = io_err.into();
        assert!(matches!(protocol_err, ProtocolError::Timeout(_)));
    }

    #[test]
    fn test_from_io_error_unexpected_eof() {
        let io_err = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        let protocol_err: ProtocolError = io_err.into();
        assert!(matches!(protocol_err, ProtocolError::ConnectionClosed(_)));
    }

    #[test]
    fn test_from_io_error_other() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "not found");
        let protocol_err: ProtocolError = io_err.into();
        assert!(matches!(protocol_err, ProtocolError::Transport(_)));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ProtocolError>();
    }
}
