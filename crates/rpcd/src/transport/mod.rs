//! Transport bindings for the envelope protocol.
//!
//! Both bindings move the same three fields; they differ only in framing:
//!
//! - [`stream`]: one length-prefixed envelope each way on a byte stream
//! - [`http`]: envelope as the request/response body, key and timestamp
//!   in the `X-Rpc-E` / `X-Rpc-T` headers
//!
//! [`RpcClient`] drives a [`protocol::Client`] over any [`Exchange`].

pub mod http;
pub mod stream;

use std::future::Future;
use std::time::Duration;

use protocol::{Client, ProtocolError, WireMessage};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::registry::{decode_payload, encode_payload};

pub use http::{HttpClient, HttpServer};
pub use stream::{Connector, StreamClient, StreamServer, TcpConnector};

/// Default timeout for a complete call in seconds.
pub const DEFAULT_CALL_TIMEOUT_SECS: u64 = 10;

/// Errors returned by [`RpcClient`].
#[derive(Debug, Error)]
pub enum RpcError {
    /// The envelope exchange failed or the server returned a logic error.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The request value could not be encoded.
    #[error("failed to encode request: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// The response payload could not be decoded.
    #[error("failed to decode response: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

impl RpcError {
    /// Returns the handler's error text if this is a logic error.
    pub fn logic_message(&self) -> Option<&str> {
        match self {
            RpcError::Protocol(ProtocolError::LogicError(text)) => Some(text),
            _ => None,
        }
    }

    /// Returns true if the server answered with a logic error.
    pub fn is_logic(&self) -> bool {
        self.logic_message().is_some()
    }
}

/// Delivers one request envelope and returns the reply envelope.
pub trait Exchange: Send + Sync {
    /// Performs one round trip.
    fn exchange(
        &self,
        request: WireMessage,
    ) -> impl Future<Output = protocol::Result<WireMessage>> + Send;
}

/// A protocol client bound to a transport.
pub struct RpcClient<T> {
    client: Client,
    transport: T,
    timeout: Duration,
}

impl<T: Exchange> RpcClient<T> {
    /// Creates a client with the default call timeout.
    pub fn new(client: Client, transport: T) -> Self {
        Self {
            client,
            transport,
            timeout: Duration::from_secs(DEFAULT_CALL_TIMEOUT_SECS),
        }
    }

    /// Sets the overall call timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Returns the protocol client, e.g. to rotate keys.
    pub fn protocol(&self) -> &Client {
        &self.client
    }

    /// Returns the transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Calls `service` with an opaque payload.
    pub async fn call_raw(&self, service: &str, payload: &[u8]) -> Result<Vec<u8>, RpcError> {
        let (request, pending) = self.client.seal_request(service, payload)?;

        let reply = tokio::time::timeout(self.timeout, self.transport.exchange(request))
            .await
            .map_err(|_| ProtocolError::Timeout(format!("call to {} timed out", service)))??;

        let response = pending.open_response(&reply).inspect_err(|e| {
            debug!(service, error = %e, "Call failed");
        })?;
        Ok(response)
    }

    /// Calls `service` with a MessagePack-encoded request value.
    pub async fn call<Req, Resp>(&self, service: &str, request: &Req) -> Result<Resp, RpcError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let payload = encode_payload(request)?;
        let response = self.call_raw(service, &payload).await?;
        Ok(decode_payload(&response)?)
    }
}

impl<T> std::fmt::Debug for RpcClient<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("client", &self.client)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
