//! Wire representation shared by both transport bindings.
//!
//! Only three fields ever cross the wire in either direction: the sender's
//! ephemeral public key, a Unix timestamp, and the ciphertext.
//!
//! # Stream Format
//!
//! Each message on a byte stream consists of:
//! - 32 bytes: ephemeral public key
//! - 8 bytes: timestamp (signed, big-endian)
//! - 2 bytes: ciphertext length (big-endian)
//! - N bytes: ciphertext
//!
//! # Header Format
//!
//! On request/response channels the ciphertext is the message body and the
//! other two fields travel as `X-Rpc-E` (base64 key) and `X-Rpc-T` (decimal
//! seconds).

use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{ProtocolError, Result};
use crate::keys::{PublicKey, KEY_SIZE};

/// Maximum age in seconds a timestamp may have to be accepted.
pub const MAX_MESSAGE_AGE_SECS: i64 = 180;

/// Maximum ciphertext length a stream frame can carry.
pub const MAX_CIPHERTEXT_LEN: usize = u16::MAX as usize;

/// Stream header size: 32 (key) + 8 (timestamp) + 2 (length) = 42 bytes.
pub const STREAM_HEADER_SIZE: usize = KEY_SIZE + 8 + 2;

/// Header carrying the base64 ephemeral public key.
pub const HEADER_EPHEMERAL_KEY: &str = "X-Rpc-E";

/// Header carrying the decimal Unix timestamp.
pub const HEADER_TIMESTAMP: &str = "X-Rpc-T";

/// Source of the current Unix time in seconds.
pub type Clock = fn() -> i64;

/// Returns the current Unix time in seconds.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Returns how many seconds old `timestamp` is at `now`.
///
/// Negative for timestamps in the future.
pub fn message_age(timestamp: i64, now: i64) -> i64 {
    now.saturating_sub(timestamp)
}

/// One-sided freshness check: rejects old timestamps only.
///
/// A message exactly [`MAX_MESSAGE_AGE_SECS`] old is still fresh. Future
/// timestamps are always accepted.
pub fn is_fresh(timestamp: i64, now: i64) -> bool {
    message_age(timestamp, now) <= MAX_MESSAGE_AGE_SECS
}

/// The three protocol fields of one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMessage {
    /// Sender's single-use public key.
    pub ephemeral_key: PublicKey,
    /// Unix seconds; also the nonce source.
    pub timestamp: i64,
    /// AEAD output including the tag.
    pub ciphertext: Vec<u8>,
}

impl WireMessage {
    /// Creates a wire message from its parts.
    pub fn new(ephemeral_key: PublicKey, timestamp: i64, ciphertext: Vec<u8>) -> Self {
        Self {
            ephemeral_key,
            timestamp,
            ciphertext,
        }
    }

    /// Returns the stream header describing this message.
    ///
    /// Fails if the ciphertext does not fit the 16-bit length field.
    pub fn stream_header(&self) -> Result<StreamHeader> {
        if self.ciphertext.len() > MAX_CIPHERTEXT_LEN {
            return Err(ProtocolError::FrameTooLarge {
                size: self.ciphertext.len(),
                max: MAX_CIPHERTEXT_LEN,
            });
        }
        Ok(StreamHeader {
            ephemeral_key: self.ephemeral_key,
            timestamp: self.timestamp,
            ciphertext_len: self.ciphertext.len() as u16,
        })
    }

    /// Encodes this message in stream framing.
    pub fn encode_stream(&self) -> Result<Vec<u8>> {
        let header = self.stream_header()?;
        let mut output = Vec::with_capacity(STREAM_HEADER_SIZE + self.ciphertext.len());
        output.extend_from_slice(&header.encode());
        output.extend_from_slice(&self.ciphertext);
        Ok(output)
    }

    /// Decodes one stream-framed message.
    ///
    /// Returns the message and the number of bytes consumed.
    pub fn decode_stream(data: &[u8]) -> Result<(Self, usize)> {
        match Self::try_decode_stream(data)? {
            Some(decoded) => Ok(decoded),
            None => Err(ProtocolError::ProtocolViolation(format!(
                "insufficient data for stream frame: have {} bytes",
                data.len()
            ))),
        }
    }

    /// Tries to decode one stream-framed message, returning `None` if more
    /// data is needed.
    pub fn try_decode_stream(data: &[u8]) -> Result<Option<(Self, usize)>> {
        let Some(header_bytes) = data.get(..STREAM_HEADER_SIZE) else {
            return Ok(None);
        };
        let header = StreamHeader::decode(header_bytes)?;
        let total = header.frame_len();
        let Some(ciphertext) = data.get(STREAM_HEADER_SIZE..total) else {
            return Ok(None);
        };
        Ok(Some((header.into_message(ciphertext.to_vec()), total)))
    }

    /// Returns the `(X-Rpc-E, X-Rpc-T)` header values for this message.
    pub fn header_values(&self) -> (String, String) {
        (self.ephemeral_key.to_base64(), self.timestamp.to_string())
    }

    /// Rebuilds a message from header values and a body.
    ///
    /// Missing or unparsable headers are rejected before any decryption can
    /// be attempted.
    pub fn from_header_values(
        ephemeral_key: Option<&str>,
        timestamp: Option<&str>,
        body: Vec<u8>,
    ) -> Result<Self> {
        let (Some(key), Some(ts)) = (
            ephemeral_key.filter(|v| !v.is_empty()),
            timestamp.filter(|v| !v.is_empty()),
        ) else {
            return Err(ProtocolError::ProtocolViolation(
                "required header missing".to_string(),
            ));
        };

        let ephemeral_key = PublicKey::from_base64(key)?;
        let timestamp = ts.trim().parse::<i64>().map_err(|e| {
            ProtocolError::ProtocolViolation(format!("invalid timestamp header: {}", e))
        })?;

        Ok(Self::new(ephemeral_key, timestamp, body))
    }
}

/// The fixed-size prefix of a stream frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHeader {
    /// Sender's single-use public key.
    pub ephemeral_key: PublicKey,
    /// Unix seconds.
    pub timestamp: i64,
    /// Length of the ciphertext that follows.
    pub ciphertext_len: u16,
}

impl StreamHeader {
    /// Decodes a header from at least [`STREAM_HEADER_SIZE`] bytes.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < STREAM_HEADER_SIZE {
            return Err(ProtocolError::ProtocolViolation(format!(
                "insufficient data for stream header: need {} bytes, have {}",
                STREAM_HEADER_SIZE,
                data.len()
            )));
        }

        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&data[..KEY_SIZE]);

        let mut ts = [0u8; 8];
        ts.copy_from_slice(&data[KEY_SIZE..KEY_SIZE + 8]);

        let len = u16::from_be_bytes([data[KEY_SIZE + 8], data[KEY_SIZE + 9]]);

        Ok(Self {
            ephemeral_key: PublicKey::from_bytes(key),
            timestamp: i64::from_be_bytes(ts),
            ciphertext_len: len,
        })
    }

    /// Encodes this header.
    pub fn encode(&self) -> [u8; STREAM_HEADER_SIZE] {
        let mut out = [0u8; STREAM_HEADER_SIZE];
        out[..KEY_SIZE].copy_from_slice(self.ephemeral_key.as_bytes());
        out[KEY_SIZE..KEY_SIZE + 8].copy_from_slice(&self.timestamp.to_be_bytes());
        out[KEY_SIZE + 8..].copy_from_slice(&self.ciphertext_len.to_be_bytes());
        out
    }

    /// Total frame length: header plus ciphertext.
    pub fn frame_len(&self) -> usize {
        STREAM_HEADER_SIZE + self.ciphertext_len as usize
    }

    /// Pairs this header with the ciphertext read after it.
    pub fn into_message(self, ciphertext: Vec<u8>) -> WireMessage {
        WireMessage::new(self.ephemeral_key, self.timestamp, ciphertext)
    }
}
