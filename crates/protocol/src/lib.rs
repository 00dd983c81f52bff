//! # SealRPC Protocol Library
//!
//! Authenticated, encrypted request/response envelopes for RPC over any
//! transport that can carry three fields: an ephemeral public key, a Unix
//! timestamp and a ciphertext.
//!
//! ## Overview
//!
//! - **Keys**: X25519 static and ephemeral keypairs, shared secrets and
//!   8-byte fingerprints
//! - **Envelopes**: AES-256-GCM sealing with a timestamp-derived nonce
//! - **Client / Server**: the two state machines, with an allow-list of
//!   caller keys on the server side
//! - **Wire**: stream framing and header encodings for the three fields
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        Service payload (opaque)         │  caller-defined encoding
//! ├─────────────────────────────────────────┤
//! │   Request / reply plaintext layout      │  fingerprints, name, tag
//! ├─────────────────────────────────────────┤
//! │            AES-256-GCM                  │  X25519 shared secret
//! ├─────────────────────────────────────────┤
//! │    Wire fields (stream or headers)      │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{Client, DispatchResult, PrivateKey, Server};
//!
//! let server_key = PrivateKey::generate().unwrap();
//! let client_key = PrivateKey::generate().unwrap();
//!
//! let echo = |_: &str, payload: &[u8]| -> DispatchResult { Ok(payload.to_vec()) };
//! let server = Server::new(server_key, echo);
//! server.add_client_key(client_key.public_key());
//!
//! let client = Client::new(client_key, *server.public_key());
//! let response = client
//!     .call_with("svc.Echo", b"hello", |request| server.handle_envelope(&request))
//!     .unwrap();
//! assert_eq!(response, b"hello");
//! ```
//!
//! ## Modules
//!
//! - [`keys`]: key material and fingerprints
//! - [`envelope`]: AEAD sealing and plaintext layouts
//! - [`client`]: client state machine
//! - [`server`]: server state machine, allow-list and dispatcher seam
//! - [`wire`]: framing, header encoding and freshness
//! - [`error`]: Error types

pub mod client;
pub mod envelope;
pub mod error;
pub mod keys;
pub mod server;
pub mod wire;

pub use client::{Client, PendingCall};
pub use envelope::{Reply, MAX_SERVICE_NAME_LEN, RESULT_LOGIC_ERROR, RESULT_OK};
pub use error::{ProtocolError, Result};
pub use keys::{
    EphemeralKeyPair, KeyFingerprint, PrivateKey, PublicKey, SharedSecret, StaticKeyPair,
    FINGERPRINT_SIZE, KEY_SIZE,
};
pub use server::{AuthorizedKeys, DispatchError, DispatchResult, Dispatcher, Server};
pub use wire::{
    StreamHeader, WireMessage, HEADER_EPHEMERAL_KEY, HEADER_TIMESTAMP, MAX_CIPHERTEXT_LEN,
    MAX_MESSAGE_AGE_SECS, STREAM_HEADER_SIZE,
};
