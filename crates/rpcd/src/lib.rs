//! # SealRPC Node Library
//!
//! Runs the envelope protocol from the [`protocol`] crate over real
//! transports and gives it persistent keys and a service table.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     sealrpc serve                         │
//! ├──────────────────────────────────────────────────────────┤
//! │  ┌────────────────┐            ┌──────────────────────┐  │
//! │  │ StreamServer   │            │ HttpServer (axum)    │  │
//! │  └───────┬────────┘            └──────────┬───────────┘  │
//! │          └──────────────┬─────────────────┘              │
//! │                ┌────────┴─────────┐   ┌───────────────┐  │
//! │                │ protocol::Server │◄──│   KeyStore    │  │
//! │                └────────┬─────────┘   └───────────────┘  │
//! │                ┌────────┴─────────┐                      │
//! │                │     Registry     │                      │
//! │                └──────────────────┘                      │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use rpcd::protocol::{Client, PrivateKey, Server};
//! use rpcd::services::{demo_registry, QueryRequest, QueryResponse};
//! use rpcd::transport::{HttpClient, HttpServer, RpcClient};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client_key = PrivateKey::generate()?;
//!     let server = Arc::new(Server::new(PrivateKey::generate()?, demo_registry()));
//!     server.add_client_key(client_key.public_key());
//!
//!     let http = HttpServer::bind("127.0.0.1:10001", "/rpc", Arc::clone(&server)).await?;
//!     let shutdown = CancellationToken::new();
//!     tokio::spawn(http.run(shutdown.clone()));
//!
//!     let rpc = RpcClient::new(
//!         Client::new(client_key, *server.public_key()),
//!         HttpClient::parse("http://127.0.0.1:10001/rpc")?,
//!     );
//!     let reply: QueryResponse = rpc
//!         .call("service.Query", &QueryRequest { name: "admin".into() })
//!         .await?;
//!     assert_eq!(reply.age, 100);
//!
//!     shutdown.cancel();
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`keystore`]: Identity key and authorized client keys on disk
//! - [`registry`]: Service name to handler table
//! - [`services`]: Demo services
//! - [`transport`]: Stream and HTTP bindings, async client

pub mod config;
pub mod keystore;
pub mod registry;
pub mod services;
pub mod transport;

// Re-export protocol for convenience
pub use protocol;

pub use config::Config;
pub use keystore::{load_or_generate_identity, AuthorizedKey, KeyStore};
pub use registry::Registry;
pub use transport::{
    Exchange, HttpClient, HttpServer, RpcClient, RpcError, StreamClient, StreamServer,
};
