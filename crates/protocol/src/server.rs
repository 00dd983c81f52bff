//! Server state machine.
//!
//! A [`Server`] owns its static keypair, an allow-list of client public keys
//! and a [`Dispatcher`] that runs the requested service. It is
//! transport-agnostic: a binding hands it a [`WireMessage`] and sends back
//! whatever it returns.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::envelope::{self, OpenedRequest, Reply};
use crate::error::{ProtocolError, Result};
use crate::keys::{EphemeralKeyPair, KeyFingerprint, PrivateKey, PublicKey, StaticKeyPair};
use crate::wire::{self, Clock, WireMessage};

/// Failure reported by a dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// Application-level error; the text is returned to the caller.
    #[error("{0}")]
    Logic(String),

    /// Server fault; the caller only learns that the call failed.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result of one dispatched call.
pub type DispatchResult = std::result::Result<Vec<u8>, DispatchError>;

/// Runs a named service against an opaque payload.
///
/// Implementations are shared across concurrent calls.
pub trait Dispatcher: Send + Sync {
    /// Executes `service` with `payload` and returns the response payload.
    fn dispatch(&self, service: &str, payload: &[u8]) -> DispatchResult;
}

impl<F> Dispatcher for F
where
    F: Fn(&str, &[u8]) -> DispatchResult + Send + Sync,
{
    fn dispatch(&self, service: &str, payload: &[u8]) -> DispatchResult {
        self(service, payload)
    }
}

/// The set of client public keys allowed to call, keyed by fingerprint.
///
/// Safe to mutate while requests are being served. Each request sees the
/// set either before or after a change, never a partial state.
#[derive(Debug, Default)]
pub struct AuthorizedKeys {
    keys: RwLock<HashMap<KeyFingerprint, PublicKey>>,
}

impl AuthorizedKeys {
    /// Creates an empty allow-list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a key. Returns false if it was already present.
    pub fn add(&self, key: PublicKey) -> bool {
        let mut keys = self.keys.write().unwrap_or_else(PoisonError::into_inner);
        keys.insert(key.fingerprint(), key).is_none()
    }

    /// Removes a key. Returns false if it was not present.
    pub fn remove(&self, key: &PublicKey) -> bool {
        let mut keys = self.keys.write().unwrap_or_else(PoisonError::into_inner);
        keys.remove(&key.fingerprint()).is_some()
    }

    /// Returns the key registered under `fingerprint`.
    pub fn lookup(&self, fingerprint: &KeyFingerprint) -> Option<PublicKey> {
        let keys = self.keys.read().unwrap_or_else(PoisonError::into_inner);
        keys.get(fingerprint).copied()
    }

    /// Returns true if `key` is allowed.
    pub fn contains(&self, key: &PublicKey) -> bool {
        self.lookup(&key.fingerprint()).is_some()
    }

    /// Replaces the whole set in one step.
    pub fn replace_all<I>(&self, keys: I)
    where
        I: IntoIterator<Item = PublicKey>,
    {
        let fresh: HashMap<_, _> = keys.into_iter().map(|k| (k.fingerprint(), k)).collect();
        let mut keys = self.keys.write().unwrap_or_else(PoisonError::into_inner);
        *keys = fresh;
    }

    /// Returns all allowed keys.
    pub fn list(&self) -> Vec<PublicKey> {
        let keys = self.keys.read().unwrap_or_else(PoisonError::into_inner);
        keys.values().copied().collect()
    }

    /// Number of allowed keys.
    pub fn len(&self) -> usize {
        self.keys.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Returns true if no key is allowed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The server endpoint of the envelope protocol.
pub struct Server<D> {
    keypair: StaticKeyPair,
    authorized: AuthorizedKeys,
    dispatcher: D,
    clock: Clock,
}

impl<D: Dispatcher> Server<D> {
    /// Creates a server with an empty allow-list.
    pub fn new(private: PrivateKey, dispatcher: D) -> Self {
        Self {
            keypair: StaticKeyPair::from_private(private),
            authorized: AuthorizedKeys::new(),
            dispatcher,
            clock: wire::unix_now,
        }
    }

    /// Replaces the time source.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Returns the server's static public key.
    pub fn public_key(&self) -> &PublicKey {
        self.keypair.public_key()
    }

    /// Returns the allow-list.
    pub fn authorized_keys(&self) -> &AuthorizedKeys {
        &self.authorized
    }

    /// Allows `key` to call this server.
    pub fn add_client_key(&self, key: PublicKey) {
        if self.authorized.add(key) {
            debug!(key_id = %key.key_id(), "Client key authorized");
        }
    }

    /// Revokes `key`. Requests already past authentication are unaffected.
    pub fn remove_client_key(&self, key: &PublicKey) {
        if self.authorized.remove(key) {
            debug!(key_id = %key.key_id(), "Client key revoked");
        }
    }

    /// Returns the dispatcher.
    pub fn dispatcher(&self) -> &D {
        &self.dispatcher
    }

    /// Processes one request envelope and returns the reply envelope.
    ///
    /// Rejections are logged at debug level only and carry no detail a
    /// transport should forward. A dispatcher's internal error becomes
    /// [`ProtocolError::InternalFault`]; its logic error is sealed into the
    /// reply.
    pub fn handle_envelope(&self, msg: &WireMessage) -> Result<WireMessage> {
        let now = (self.clock)();
        if !wire::is_fresh(msg.timestamp, now) {
            let age_secs = wire::message_age(msg.timestamp, now);
            debug!(age_secs, "Rejected request: expired");
            return Err(ProtocolError::RequestExpired { age_secs });
        }

        let request = self.authenticate(msg).inspect_err(|e| {
            debug!(reason = %e, "Rejected request");
        })?;

        // Nothing may fail between a completed dispatch and sealing.
        let ephemeral = EphemeralKeyPair::generate().map_err(|e| {
            warn!(error = %e, "Failed to generate reply key");
            ProtocolError::InternalFault(e.to_string())
        })?;

        trace!(
            service = %request.service,
            client = %request.client_key.key_id(),
            payload_len = request.payload.len(),
            "Dispatching request"
        );

        let reply = match self.dispatcher.dispatch(&request.service, &request.payload) {
            Ok(payload) => Reply::Success(payload),
            Err(DispatchError::Logic(text)) => {
                debug!(service = %request.service, error = %text, "Service returned logic error");
                Reply::LogicError(text)
            }
            Err(DispatchError::Internal(text)) => {
                warn!(service = %request.service, error = %text, "Service failed");
                return Err(ProtocolError::InternalFault(text));
            }
        };

        envelope::seal_reply(ephemeral, &request.client_key, (self.clock)(), &reply)
    }

    fn authenticate(&self, msg: &WireMessage) -> Result<OpenedRequest> {
        envelope::open_and_authenticate_request(self.keypair.private_key(), msg, |fp| {
            self.authorized.lookup(fp)
        })
    }
}

impl<D> std::fmt::Debug for Server<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("keypair", &self.keypair)
            .field("authorized", &self.authorized)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use crate::wire::MAX_MESSAGE_AGE_SECS;

    const NOW: i64 = 1_700_000_000;

    fn fixed_clock() -> i64 {
        NOW
    }

    type EchoFn = fn(&str, &[u8]) -> DispatchResult;

    fn echo(service: &str, payload: &[u8]) -> DispatchResult {
        match service {
            "svc.Echo" => Ok(payload.to_vec()),
            "svc.Fail" => Err(DispatchError::Logic("unknown name".to_string())),
            "svc.Crash" => Err(DispatchError::Internal("database unavailable".to_string())),
            other => Err(DispatchError::Logic(format!("can't find service {}", other))),
        }
    }

    fn setup() -> (Server<EchoFn>, Client) {
        let server_key = PrivateKey::generate().unwrap();
        let client_key = PrivateKey::generate().unwrap();

        let server = Server::new(server_key, echo as EchoFn).with_clock(fixed_clock);
        server.add_client_key(client_key.public_key());

        let client = Client::new(client_key, *server.public_key()).with_clock(fixed_clock);
        (server, client)
    }

    #[test]
    fn test_echo_end_to_end() {
        let (server, client) = setup();
        let response = client
            .call_with("svc.Echo", &[0x01, 0x02, 0x03], |req| server.handle_envelope(&req))
            .unwrap();
        assert_eq!(response, vec![0x01, 0x02, 0x03]);
    }

    #[test]
    fn test_empty_payload_end_to_end() {
        let (server, client) = setup();
        let response = client
            .call_with("svc.Echo", &[], |req| server.handle_envelope(&req))
            .unwrap();
        assert!(response.is_empty());
    }

    #[test]
    fn test_logic_error_reaches_client() {
        let (server, client) = setup();
        let err = client
            .call_with("svc.Fail", b"", |req| server.handle_envelope(&req))
            .unwrap_err();
        assert!(matches!(err, ProtocolError::LogicError(ref text) if text == "unknown name"));
    }

    #[test]
    fn test_internal_error_is_fault() {
        let (server, client) = setup();
        let (request, _) = client.seal_request("svc.Crash", b"").unwrap();
        let err = server.handle_envelope(&request).unwrap_err();
        assert!(err.is_internal());
        assert!(!err.is_rejection());
    }

    #[test]
    fn test_removed_client_is_unauthorized() {
        let (server, client) = setup();
        let (request, _) = client.seal_request("svc.Echo", b"hi").unwrap();

        let client_pub = client.public_key().unwrap();
        server.remove_client_key(&client_pub);

        assert!(matches!(
            server.handle_envelope(&request),
            Err(ProtocolError::UnauthorizedClient)
        ));
    }

    #[test]
    fn test_freshness_boundary() {
        let (server, client) = setup();

        let (mut request, _) = client
            .seal_request_at("svc.Echo", b"x", NOW - MAX_MESSAGE_AGE_SECS)
            .unwrap();
        assert!(server.handle_envelope(&request).is_ok());

        let (stale, _) = client
            .seal_request_at("svc.Echo", b"x", NOW - MAX_MESSAGE_AGE_SECS - 1)
            .unwrap();
        assert!(matches!(
            server.handle_envelope(&stale),
            Err(ProtocolError::RequestExpired { age_secs: 181 })
        ));

        // Expiry is checked before decryption, so even garbage is reported
        // as expired.
        request.timestamp = NOW - 1_000;
        request.ciphertext = vec![0; 4];
        assert!(matches!(
            server.handle_envelope(&request),
            Err(ProtocolError::RequestExpired { .. })
        ));
    }

    #[test]
    fn test_future_timestamp_accepted() {
        let (server, client) = setup();
        let (request, pending) = client.seal_request_at("svc.Echo", b"x", NOW + 3_600).unwrap();
        let reply = server.handle_envelope(&request).unwrap();
        assert_eq!(pending.open_response(&reply).unwrap(), b"x");
    }

    #[test]
    fn test_tampered_request_is_rejected() {
        let (server, client) = setup();
        let (mut request, _) = client.seal_request("svc.Echo", b"hi").unwrap();
        request.ciphertext[0] ^= 0xFF;
        assert!(matches!(
            server.handle_envelope(&request),
            Err(ProtocolError::AuthenticationFailed)
        ));
    }

    #[test]
    fn test_request_for_other_server_is_rejected() {
        let (_, client) = setup();
        let other =
            Server::new(PrivateKey::generate().unwrap(), echo as EchoFn).with_clock(fixed_clock);
        other.add_client_key(client.public_key().unwrap());

        let (request, _) = client.seal_request("svc.Echo", b"hi").unwrap();
        assert!(matches!(
            other.handle_envelope(&request),
            Err(ProtocolError::AuthenticationFailed)
        ));
    }

    #[test]
    fn test_reply_timestamp_is_current() {
        let (server, client) = setup();
        let (request, _) = client.seal_request_at("svc.Echo", b"x", NOW - 100).unwrap();
        let reply = server.handle_envelope(&request).unwrap();
        assert_eq!(reply.timestamp, NOW);
        assert_ne!(reply.ephemeral_key, request.ephemeral_key);
    }

    #[test]
    fn test_reply_sealed_to_client_static_key() {
        let (server, _) = setup();
        let client_key = PrivateKey::generate().unwrap();
        let client_pub = client_key.public_key();
        server.add_client_key(client_pub);

        let other = Client::new(client_key.clone(), *server.public_key()).with_clock(fixed_clock);
        let (request, _) = other.seal_request("svc.Echo", b"x").unwrap();
        let reply = server.handle_envelope(&request).unwrap();

        assert_eq!(
            envelope::open_reply(&client_key, &reply).unwrap(),
            Reply::Success(b"x".to_vec())
        );
    }

    #[test]
    fn test_unknown_service_is_logic_error() {
        let (server, client) = setup();
        let err = client
            .call_with("svc.Missing", b"", |req| server.handle_envelope(&req))
            .unwrap_err();
        assert_eq!(err.to_string(), "can't find service svc.Missing");
    }

    #[test]
    fn test_authorized_keys_operations() {
        let keys = AuthorizedKeys::new();
        let a = PrivateKey::generate().unwrap().public_key();
        let b = PrivateKey::generate().unwrap().public_key();

        assert!(keys.is_empty());
        assert!(keys.add(a));
        assert!(!keys.add(a));
        assert!(keys.add(b));
        assert_eq!(keys.len(), 2);
        assert_eq!(keys.lookup(&a.fingerprint()), Some(a));
        assert!(keys.contains(&b));

        assert!(keys.remove(&a));
        assert!(!keys.remove(&a));
        assert!(!keys.contains(&a));

        keys.replace_all([a]);
        assert_eq!(keys.list(), vec![a]);
    }

    #[test]
    fn test_concurrent_calls_and_key_changes() {
        let (server, client) = setup();
        let extra = PrivateKey::generate().unwrap().public_key();

        std::thread::scope(|s| {
            for i in 0..8u8 {
                let server = &server;
                let client = &client;
                s.spawn(move || {
                    for _ in 0..20 {
                        let response = client
                            .call_with("svc.Echo", &[i], |req| server.handle_envelope(&req))
                            .unwrap();
                        assert_eq!(response, vec![i]);
                    }
                });
            }
            s.spawn(|| {
                for _ in 0..50 {
                    server.add_client_key(extra);
                    server.remove_client_key(&extra);
                }
            });
        });
    }

    #[test]
    fn test_closure_dispatcher() {
        let dispatcher =
            |service: &str, _: &[u8]| -> DispatchResult { Ok(service.as_bytes().to_vec()) };
        assert_eq!(dispatcher.dispatch("svc.Name", b"").unwrap(), b"svc.Name");
    }
}
