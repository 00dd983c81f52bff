//! Header binding over HTTP.
//!
//! The ciphertext is the POST body. The ephemeral key and timestamp travel
//! in the `X-Rpc-E` and `X-Rpc-T` headers, in both directions.
//!
//! Status mapping on the server side:
//! - `200`: reply envelope in the body and headers
//! - `403`: missing or malformed headers, or any authentication rejection
//! - `500`: body read failure or internal fault

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::BytesRejection;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use bytes::Bytes;
use protocol::{
    Dispatcher, ProtocolError, Server, WireMessage, HEADER_EPHEMERAL_KEY, HEADER_TIMESTAMP,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::{Exchange, DEFAULT_CALL_TIMEOUT_SECS};

/// Builds the router serving envelopes at `path`.
///
/// Request bodies are not size-limited.
pub fn router<D: Dispatcher + 'static>(path: &str, server: Arc<Server<D>>) -> Router {
    Router::new()
        .route(path, post(handle_envelope::<D>))
        .layer(DefaultBodyLimit::disable())
        .with_state(server)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

async fn handle_envelope<D: Dispatcher + 'static>(
    State(server): State<Arc<Server<D>>>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    let body = match body {
        Ok(body) => body,
        Err(e) => {
            warn!(error = %e, "Failed to read request body");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let request = match WireMessage::from_header_values(
        header_str(&headers, HEADER_EPHEMERAL_KEY),
        header_str(&headers, HEADER_TIMESTAMP),
        body.to_vec(),
    ) {
        Ok(request) => request,
        Err(e) => {
            debug!(error = %e, "Rejected request headers");
            return StatusCode::FORBIDDEN.into_response();
        }
    };

    let result = tokio::task::spawn_blocking(move || server.handle_envelope(&request))
        .await
        .map_err(|e| ProtocolError::InternalFault(format!("handler task failed: {}", e)))
        .and_then(|result| result);

    match result {
        Ok(reply) => {
            let (key, timestamp) = reply.header_values();
            (
                StatusCode::OK,
                [(HEADER_EPHEMERAL_KEY, key), (HEADER_TIMESTAMP, timestamp)],
                reply.ciphertext,
            )
                .into_response()
        }
        Err(e) if e.is_internal() => {
            warn!(error = %e, "HTTP request failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
        Err(e) => {
            debug!(error = %e, "HTTP request rejected");
            StatusCode::FORBIDDEN.into_response()
        }
    }
}

/// An HTTP listener serving the envelope route.
pub struct HttpServer {
    listener: TcpListener,
    router: Router,
}

impl HttpServer {
    /// Binds to `addr` and serves envelopes at `path`.
    pub async fn bind<D: Dispatcher + 'static>(
        addr: &str,
        path: &str,
        server: Arc<Server<D>>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            router: router(path, server),
        })
    }

    /// Returns the bound address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serves until `shutdown` is cancelled, then drains in-flight requests.
    pub async fn run(self, shutdown: CancellationToken) -> io::Result<()> {
        info!(addr = ?self.listener.local_addr().ok(), "HTTP listener started");
        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
                info!("HTTP listener received shutdown signal");
            })
            .await
    }
}

impl std::fmt::Debug for HttpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpServer")
            .field("addr", &self.listener.local_addr().ok())
            .finish_non_exhaustive()
    }
}

fn transport_error(err: reqwest::Error) -> ProtocolError {
    if err.is_timeout() {
        ProtocolError::Timeout(err.to_string())
    } else {
        ProtocolError::Transport(err.to_string())
    }
}

/// Client side of the header binding.
#[derive(Debug, Clone)]
pub struct HttpClient {
    http: reqwest::Client,
    endpoint: Url,
}

impl HttpClient {
    /// Creates a client posting to `endpoint`.
    pub fn new(endpoint: Url) -> Self {
        Self::with_timeout(endpoint, Duration::from_secs(DEFAULT_CALL_TIMEOUT_SECS))
    }

    /// Parses `endpoint` and creates a client for it.
    pub fn parse(endpoint: &str) -> Result<Self, url::ParseError> {
        Ok(Self::new(Url::parse(endpoint)?))
    }

    /// Creates a client with a per-request timeout.
    pub fn with_timeout(endpoint: Url, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { http, endpoint }
    }

    /// Returns the endpoint URL.
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

impl Exchange for HttpClient {
    async fn exchange(&self, request: WireMessage) -> protocol::Result<WireMessage> {
        let (key, timestamp) = request.header_values();

        let response = self
            .http
            .post(self.endpoint.clone())
            .header(HEADER_EPHEMERAL_KEY, key)
            .header(HEADER_TIMESTAMP, timestamp)
            .body(request.ciphertext)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(ProtocolError::Transport(format!(
                "HTTP status {}",
                status.as_u16()
            )));
        }

        let key = header_owned(response.headers(), HEADER_EPHEMERAL_KEY);
        let timestamp = header_owned(response.headers(), HEADER_TIMESTAMP);
        let body = response.bytes().await.map_err(transport_error)?;

        WireMessage::from_header_values(key.as_deref(), timestamp.as_deref(), body.to_vec())
    }
}

fn header_owned(headers: &reqwest::header::HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
}
