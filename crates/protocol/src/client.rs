//! Client state machine.
//!
//! A [`Client`] holds its own static private key and the server's static
//! public key, plus the two fingerprints derived from them. Sealing a
//! request returns a [`PendingCall`] that remembers the keys in force at that
//! moment, so a key rotation racing a call cannot open its reply with the
//! wrong key.

use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, trace};

use crate::envelope;
use crate::error::{ProtocolError, Result};
use crate::keys::{EphemeralKeyPair, KeyFingerprint, PrivateKey, PublicKey};
use crate::wire::{self, Clock, WireMessage};

/// Keys and derived fingerprints for one client/server pairing.
struct Session {
    private: PrivateKey,
    server: PublicKey,
    client_fp: KeyFingerprint,
    proof_fp: KeyFingerprint,
}

impl Session {
    fn derive(private: &PrivateKey, server: &PublicKey) -> Self {
        Self {
            private: private.clone(),
            server: *server,
            client_fp: private.public_key().fingerprint(),
            proof_fp: private.shared_secret(server).fingerprint(),
        }
    }
}

#[derive(Default)]
struct KeyState {
    own: Option<PrivateKey>,
    server: Option<PublicKey>,
    session: Option<Arc<Session>>,
}

impl KeyState {
    fn rederive(&mut self) {
        self.session = match (&self.own, &self.server) {
            (Some(own), Some(server)) => Some(Arc::new(Session::derive(own, server))),
            _ => None,
        };
    }
}

/// The client endpoint of the envelope protocol.
pub struct Client {
    keys: RwLock<KeyState>,
    clock: Clock,
}

impl Default for Client {
    fn default() -> Self {
        Self {
            keys: RwLock::new(KeyState::default()),
            clock: wire::unix_now,
        }
    }
}

impl Client {
    /// Creates a client with both static keys set.
    pub fn new(own: PrivateKey, server: PublicKey) -> Self {
        let client = Self::default();
        client.set_own_key(own);
        client.set_server_key(server);
        client
    }

    /// Replaces the time source.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Sets the client's own static private key.
    pub fn set_own_key(&self, own: PrivateKey) {
        let mut keys = self.keys.write().unwrap_or_else(PoisonError::into_inner);
        debug!(key_id = %own.public_key().key_id(), "Client identity set");
        keys.own = Some(own);
        keys.rederive();
    }

    /// Sets the server's static public key.
    pub fn set_server_key(&self, server: PublicKey) {
        let mut keys = self.keys.write().unwrap_or_else(PoisonError::into_inner);
        debug!(key_id = %server.key_id(), "Server key set");
        keys.server = Some(server);
        keys.rederive();
    }

    /// Returns the client's static public key, if set.
    pub fn public_key(&self) -> Option<PublicKey> {
        let keys = self.keys.read().unwrap_or_else(PoisonError::into_inner);
        keys.own.as_ref().map(PrivateKey::public_key)
    }

    /// Returns the server's static public key, if set.
    pub fn server_key(&self) -> Option<PublicKey> {
        self.keys.read().unwrap_or_else(PoisonError::into_inner).server
    }

    fn session(&self) -> Result<Arc<Session>> {
        let keys = self.keys.read().unwrap_or_else(PoisonError::into_inner);
        match (&keys.session, &keys.own) {
            (Some(session), _) => Ok(Arc::clone(session)),
            (None, None) => Err(ProtocolError::MissingKey(
                "client private key not set".to_string(),
            )),
            (None, Some(_)) => Err(ProtocolError::MissingKey(
                "server public key not set".to_string(),
            )),
        }
    }

    /// Seals a call to `service` stamped with the current time.
    pub fn seal_request(
        &self,
        service: &str,
        payload: &[u8],
    ) -> Result<(WireMessage, PendingCall)> {
        self.seal_request_at(service, payload, (self.clock)())
    }

    /// Seals a call to `service` stamped with `timestamp`.
    pub fn seal_request_at(
        &self,
        service: &str,
        payload: &[u8],
        timestamp: i64,
    ) -> Result<(WireMessage, PendingCall)> {
        let session = self.session()?;
        let ephemeral = EphemeralKeyPair::generate()?;

        let request = envelope::seal_request(
            ephemeral,
            &session.server,
            timestamp,
            &session.client_fp,
            &session.proof_fp,
            service,
            payload,
        )?;

        trace!(service, payload_len = payload.len(), "Sealed request");

        Ok((
            request,
            PendingCall {
                session,
                clock: self.clock,
            },
        ))
    }

    /// Performs a complete call through `exchange`, which must deliver the
    /// request and return the server's reply.
    pub fn call_with<F>(&self, service: &str, payload: &[u8], exchange: F) -> Result<Vec<u8>>
    where
        F: FnOnce(WireMessage) -> Result<WireMessage>,
    {
        let (request, pending) = self.seal_request(service, payload)?;
        let reply = exchange(request)?;
        pending.open_response(&reply)
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("public_key", &self.public_key())
            .field("server_key", &self.server_key())
            .finish()
    }
}

/// A sealed request awaiting its reply.
pub struct PendingCall {
    session: Arc<Session>,
    clock: Clock,
}

impl PendingCall {
    /// Opens the server's reply.
    ///
    /// A stale reply is rejected before decryption. A logic error from the
    /// server surfaces as [`ProtocolError::LogicError`] with its text.
    pub fn open_response(self, reply: &WireMessage) -> Result<Vec<u8>> {
        let now = (self.clock)();
        if !wire::is_fresh(reply.timestamp, now) {
            return Err(ProtocolError::ResponseExpired {
                age_secs: wire::message_age(reply.timestamp, now),
            });
        }

        envelope::open_reply(&self.session.private, reply)?.into_result()
    }
}

impl std::fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCall")
            .field("server", &self.session.server)
            .finish_non_exhaustive()
    }
}
