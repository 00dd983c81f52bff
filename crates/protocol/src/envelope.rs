//! Envelope codec: AEAD sealing and the request/reply plaintext layouts.
//!
//! Every envelope is encrypted with AES-256-GCM under an X25519 shared
//! secret. The 96-bit nonce is derived from the message timestamp: the
//! first 8 bytes are the timestamp in big-endian order, the last 4 are zero.
//! Uniqueness comes from the single-use ephemeral key, not the nonce.
//!
//! # Request plaintext
//!
//! ```text
//! ┌──────────────┬──────────────┬─────┬──────────┬─────────────┐
//! │ client fp(8) │ proof fp(8)  │ len │ name     │ payload ... │
//! └──────────────┴──────────────┴─────┴──────────┴─────────────┘
//! ```
//!
//! # Reply plaintext
//!
//! A one-byte tag followed by the body: `0xFE` and the response payload on
//! success, `0xFF` and the UTF-8 error text on a logic error.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};

use crate::error::{ProtocolError, Result};
use crate::keys::{
    EphemeralKeyPair, KeyFingerprint, PrivateKey, PublicKey, SharedSecret, FINGERPRINT_SIZE,
};
use crate::wire::WireMessage;

/// Reply tag for a successful call.
pub const RESULT_OK: u8 = 0xFE;

/// Reply tag for an application-level error.
pub const RESULT_LOGIC_ERROR: u8 = 0xFF;

/// Longest service name the one-byte length prefix can describe.
pub const MAX_SERVICE_NAME_LEN: usize = u8::MAX as usize;

/// AES-GCM nonce size.
pub const NONCE_SIZE: usize = 12;

/// Size of the two fingerprints that open every request plaintext.
const PROOF_PREFIX_SIZE: usize = 2 * FINGERPRINT_SIZE;

/// Builds the AEAD nonce for a timestamp.
pub fn nonce_for(timestamp: i64) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[..8].copy_from_slice(&(timestamp as u64).to_be_bytes());
    nonce
}

fn cipher(secret: &SharedSecret) -> Result<Aes256Gcm> {
    Aes256Gcm::new_from_slice(secret.as_bytes())
        .map_err(|e| ProtocolError::InternalFault(format!("invalid AEAD key: {}", e)))
}

/// Encrypts `plaintext` under `secret` with the nonce for `timestamp`.
pub fn seal(secret: &SharedSecret, timestamp: i64, plaintext: &[u8]) -> Result<Vec<u8>> {
    let nonce = nonce_for(timestamp);
    cipher(secret)?
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| ProtocolError::InternalFault("AEAD seal failed".to_string()))
}

/// Decrypts and authenticates `ciphertext`.
///
/// Any failure (wrong key, wrong timestamp, flipped bit) is reported as
/// [`ProtocolError::AuthenticationFailed`] with no further detail.
pub fn open(secret: &SharedSecret, timestamp: i64, ciphertext: &[u8]) -> Result<Vec<u8>> {
    let nonce = nonce_for(timestamp);
    cipher(secret)?
        .decrypt(Nonce::from_slice(&nonce), ciphertext)
        .map_err(|_| ProtocolError::AuthenticationFailed)
}

/// Lays out a request plaintext.
pub fn encode_request(
    client: &KeyFingerprint,
    proof: &KeyFingerprint,
    service: &str,
    payload: &[u8],
) -> Result<Vec<u8>> {
    let name = service.as_bytes();
    if name.len() > MAX_SERVICE_NAME_LEN {
        return Err(ProtocolError::ProtocolViolation(format!(
            "service name is {} bytes, maximum is {}",
            name.len(),
            MAX_SERVICE_NAME_LEN
        )));
    }

    let mut plaintext = Vec::with_capacity(PROOF_PREFIX_SIZE + 1 + name.len() + payload.len());
    plaintext.extend_from_slice(client.as_bytes());
    plaintext.extend_from_slice(proof.as_bytes());
    plaintext.push(name.len() as u8);
    plaintext.extend_from_slice(name);
    plaintext.extend_from_slice(payload);
    Ok(plaintext)
}

/// Seals a request for `server` using a fresh ephemeral pair.
///
/// The ephemeral pair is consumed so it cannot encrypt a second message.
pub fn seal_request(
    ephemeral: EphemeralKeyPair,
    server: &PublicKey,
    timestamp: i64,
    client: &KeyFingerprint,
    proof: &KeyFingerprint,
    service: &str,
    payload: &[u8],
) -> Result<WireMessage> {
    let plaintext = encode_request(client, proof, service, payload)?;
    let ephemeral_key = *ephemeral.public_key();
    let secret = ephemeral.into_shared_secret(server);
    let ciphertext = seal(&secret, timestamp, &plaintext)?;
    Ok(WireMessage::new(ephemeral_key, timestamp, ciphertext))
}

/// A request that passed decryption and caller authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedRequest {
    /// Static public key of the authenticated caller.
    pub client_key: PublicKey,
    /// Requested service name.
    pub service: String,
    /// Opaque request payload.
    pub payload: Vec<u8>,
}

/// Decrypts a request and authenticates its caller.
///
/// `lookup` resolves a client fingerprint against the allow-list. Checks run
/// in a fixed order: AEAD open, minimum length, fingerprint lookup,
/// constant-time proof comparison, then the service name.
pub fn open_and_authenticate_request<F>(
    server_private: &PrivateKey,
    msg: &WireMessage,
    lookup: F,
) -> Result<OpenedRequest>
where
    F: FnOnce(&KeyFingerprint) -> Option<PublicKey>,
{
    let secret = server_private.shared_secret(&msg.ephemeral_key);
    let plaintext = open(&secret, msg.timestamp, &msg.ciphertext)?;

    if plaintext.len() < PROOF_PREFIX_SIZE {
        return Err(ProtocolError::MalformedEnvelope(format!(
            "plaintext is {} bytes, need at least {}",
            plaintext.len(),
            PROOF_PREFIX_SIZE
        )));
    }

    let (client_fp, rest) = plaintext.split_at(FINGERPRINT_SIZE);
    let (proof_fp, body) = rest.split_at(FINGERPRINT_SIZE);
    let client_fp = KeyFingerprint::from_slice(client_fp).ok_or(ProtocolError::UnauthorizedClient)?;
    let proof_fp = KeyFingerprint::from_slice(proof_fp).ok_or(ProtocolError::UnauthorizedClient)?;

    let client_key = lookup(&client_fp).ok_or(ProtocolError::UnauthorizedClient)?;

    let expected = server_private.shared_secret(&client_key).fingerprint();
    if !expected.ct_equals(&proof_fp) {
        return Err(ProtocolError::UnauthorizedClient);
    }

    let (&name_len, body) = body.split_first().ok_or_else(|| {
        ProtocolError::MalformedEnvelope("missing service name length".to_string())
    })?;
    let name_len = name_len as usize;
    if body.len() < name_len {
        return Err(ProtocolError::MalformedEnvelope(format!(
            "service name length {} exceeds remaining {} bytes",
            name_len,
            body.len()
        )));
    }
    let (name, payload) = body.split_at(name_len);
    let service = String::from_utf8(name.to_vec())
        .map_err(|_| ProtocolError::MalformedEnvelope("service name is not UTF-8".to_string()))?;

    Ok(OpenedRequest {
        client_key,
        service,
        payload: payload.to_vec(),
    })
}

/// Outcome carried inside a reply envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// The handler produced a response payload.
    Success(Vec<u8>),
    /// The handler reported an application-level error.
    LogicError(String),
}

impl Reply {
    /// Lays out the tagged reply plaintext.
    pub fn encode(&self) -> Vec<u8> {
        let (tag, body) = match self {
            Reply::Success(payload) => (RESULT_OK, payload.as_slice()),
            Reply::LogicError(text) => (RESULT_LOGIC_ERROR, text.as_bytes()),
        };
        let mut plaintext = Vec::with_capacity(1 + body.len());
        plaintext.push(tag);
        plaintext.extend_from_slice(body);
        plaintext
    }

    /// Parses a tagged reply plaintext.
    pub fn decode(plaintext: &[u8]) -> Result<Self> {
        match plaintext.split_first() {
            Some((&RESULT_OK, body)) => Ok(Reply::Success(body.to_vec())),
            Some((&RESULT_LOGIC_ERROR, body)) => {
                Ok(Reply::LogicError(String::from_utf8_lossy(body).into_owned()))
            }
            Some((tag, _)) => Err(ProtocolError::ProtocolViolation(format!(
                "unexpected result tag 0x{:02x}",
                tag
            ))),
            None => Err(ProtocolError::ProtocolViolation("empty reply".to_string())),
        }
    }

    /// Converts the reply into the caller-facing result.
    pub fn into_result(self) -> Result<Vec<u8>> {
        match self {
            Reply::Success(payload) => Ok(payload),
            Reply::LogicError(text) => Err(ProtocolError::LogicError(text)),
        }
    }
}

/// Seals a reply for the caller's static key.
pub fn seal_reply(
    ephemeral: EphemeralKeyPair,
    client: &PublicKey,
    timestamp: i64,
    reply: &Reply,
) -> Result<WireMessage> {
    let ephemeral_key = *ephemeral.public_key();
    let secret = ephemeral.into_shared_secret(client);
    let ciphertext = seal(&secret, timestamp, &reply.encode())?;
    Ok(WireMessage::new(ephemeral_key, timestamp, ciphertext))
}

/// Opens a reply with the caller's static private key.
pub fn open_reply(client_private: &PrivateKey, msg: &WireMessage) -> Result<Reply> {
    let secret = client_private.shared_secret(&msg.ephemeral_key);
    let plaintext = open(&secret, msg.timestamp, &msg.ciphertext)?;
    Reply::decode(&plaintext)
}
