//! SealRPC node
//!
//! Serves the envelope protocol and makes one-off calls against it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use rpcd::config::Config;
use rpcd::protocol::{Client, PrivateKey, PublicKey, Server};
use rpcd::services::demo_registry;
use rpcd::transport::{HttpClient, RpcClient, RpcError, StreamClient};
use rpcd::{load_or_generate_identity, HttpServer, KeyStore, StreamServer};
use tokio_util::sync::CancellationToken;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Exit code for a call the server answered with a logic error.
const EXIT_LOGIC_ERROR: i32 = 2;

/// SealRPC - authenticated encrypted RPC over streams and HTTP.
#[derive(Parser, Debug)]
#[command(name = "sealrpc")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Generate a new key pair and print it
    Keygen,

    /// Print the public key for a base64 private key
    Pubkey {
        /// Base64 private key
        private_key: String,
    },

    /// Show this node's identity, creating it if needed
    Identity,

    /// Manage authorized client keys
    #[command(subcommand)]
    Keys(KeysCommands),

    /// Run the stream and HTTP listeners
    Serve {
        /// Stream listen address (overrides config)
        #[arg(long, value_name = "ADDR")]
        stream: Option<String>,

        /// HTTP listen address (overrides config)
        #[arg(long, value_name = "ADDR")]
        http: Option<String>,
    },

    /// Call a service with a JSON request
    Call {
        /// Service name, e.g. service.Query
        service: String,

        /// Request value as JSON
        #[arg(default_value = "{}")]
        request: String,

        /// Transport to use
        #[arg(long, short, value_enum, default_value = "http")]
        transport: TransportKind,

        /// Server public key (overrides config)
        #[arg(long, value_name = "KEY")]
        server_key: Option<String>,
    },
}

/// Subcommands for authorized key management.
#[derive(Subcommand, Debug, Clone)]
pub enum KeysCommands {
    /// List authorized client keys
    List,

    /// Authorize a client key
    Add {
        /// Base64 public key
        public_key: String,

        /// Label for the key
        #[arg(long, short, default_value = "client")]
        name: String,
    },

    /// Revoke a client key
    Remove {
        /// Base64 public key
        public_key: String,
    },
}

/// Transport used by `call`.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// POST with X-Rpc-E / X-Rpc-T headers
    Http,
    /// Length-prefixed frames over TCP
    Stream,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default()?
    };
    config.apply_env_overrides();
    config.validate()?;

    let _log_guard = init_tracing(&config, cli.verbose)?;
    if let Some(config_path) = &cli.config {
        tracing::debug!("Using config file: {:?}", config_path);
    }

    match cli.command {
        Commands::Keygen => {
            let key = PrivateKey::generate()?;
            println!("private: {}", key.to_base64());
            println!("public:  {}", key.public_key());
        }
        Commands::Pubkey { private_key } => {
            let key = PrivateKey::from_base64(&private_key).context("Invalid private key")?;
            println!("{}", key.public_key());
        }
        Commands::Identity => {
            let key = load_or_generate_identity(&config.node.identity_path())?;
            let public = key.public_key();
            println!("Public key:  {}", public);
            println!("Fingerprint: {}", public.fingerprint());
            println!("Key ID:      {}", public.key_id());
        }
        Commands::Keys(cmd) => run_keys(&config, cmd)?,
        Commands::Serve { stream, http } => run_serve(&config, stream, http).await?,
        Commands::Call {
            service,
            request,
            transport,
            server_key,
        } => {
            if let Err(e) = run_call(&config, &service, &request, transport, server_key).await {
                let logic = e.downcast_ref::<RpcError>().and_then(RpcError::logic_message);
                if let Some(message) = logic {
                    eprintln!("Service error: {}", message);
                    std::process::exit(EXIT_LOGIC_ERROR);
                }
                return Err(e);
            }
        }
    }

    Ok(())
}

/// Sets up the global subscriber. The returned guard flushes the log file.
fn init_tracing(config: &Config, verbose: bool) -> anyhow::Result<Option<WorkerGuard>> {
    let level = if verbose {
        "debug"
    } else {
        config.node.log_level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if config.node.log_file.is_empty() {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
        return Ok(None);
    }

    let path = Path::new(&config.node.log_file);
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let file_name = path
        .file_name()
        .with_context(|| format!("Invalid log file path: {}", config.node.log_file))?;
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;

    let appender = tracing_appender::rolling::daily(dir, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(writer)
        .init();
    Ok(Some(guard))
}

fn parse_public_key(value: &str) -> anyhow::Result<PublicKey> {
    PublicKey::from_base64(value).with_context(|| format!("Invalid public key: {}", value))
}

fn run_keys(config: &Config, cmd: KeysCommands) -> anyhow::Result<()> {
    let store = KeyStore::open(config.node.authorized_keys_path())?;

    match cmd {
        KeysCommands::List => {
            let keys = store.list()?;
            if keys.is_empty() {
                println!("No authorized keys.");
                return Ok(());
            }
            println!("{:<20} {:<18} {:<46} ADDED", "NAME", "FINGERPRINT", "PUBLIC KEY");
            for entry in keys {
                println!(
                    "{:<20} {:<18} {:<46} {}",
                    entry.name,
                    entry.public_key.fingerprint().to_string(),
                    entry.public_key.to_string(),
                    entry.added_at
                );
            }
        }
        KeysCommands::Add { public_key, name } => {
            let key = parse_public_key(&public_key)?;
            if store.add(&name, key)? {
                store.save()?;
                println!("Authorized {} ({})", name, key.fingerprint());
            } else {
                println!("Key {} is already authorized", key.fingerprint());
            }
        }
        KeysCommands::Remove { public_key } => {
            let key = parse_public_key(&public_key)?;
            match store.remove(&key)? {
                Some(entry) => {
                    store.save()?;
                    println!("Revoked {} ({})", entry.name, key.fingerprint());
                }
                None => anyhow::bail!("Key {} is not authorized", key.fingerprint()),
            }
        }
    }

    Ok(())
}

async fn run_serve(
    config: &Config,
    stream_addr: Option<String>,
    http_addr: Option<String>,
) -> anyhow::Result<()> {
    let identity = load_or_generate_identity(&config.node.identity_path())?;
    let store = KeyStore::open(config.node.authorized_keys_path())?;

    let server = Arc::new(Server::new(identity, demo_registry()));
    server.authorized_keys().replace_all(store.public_keys()?);
    tracing::info!(
        public_key = %server.public_key(),
        authorized = server.authorized_keys().len(),
        "SealRPC node starting"
    );

    let stream_addr = stream_addr.unwrap_or_else(|| config.server.stream_listen.clone());
    let http_addr = http_addr.unwrap_or_else(|| config.server.http_listen.clone());

    let stream_server = StreamServer::bind(&stream_addr, Arc::clone(&server))
        .await
        .with_context(|| format!("Failed to bind stream listener on {}", stream_addr))?
        .with_io_timeout(config.server.io_timeout());
    let http_server = HttpServer::bind(&http_addr, &config.server.http_path, Arc::clone(&server))
        .await
        .with_context(|| format!("Failed to bind HTTP listener on {}", http_addr))?;

    let shutdown = CancellationToken::new();
    let stream_task = tokio::spawn(stream_server.run(shutdown.clone()));
    let http_task = tokio::spawn(http_server.run(shutdown.clone()));
    let reload_task = tokio::spawn(reload_on_sighup(Arc::clone(&server), store, shutdown.clone()));

    wait_for_shutdown_signal().await?;
    tracing::info!("Received shutdown signal");
    shutdown.cancel();

    stream_task.await?.context("Stream listener failed")?;
    http_task.await?.context("HTTP listener failed")?;
    reload_task.await??;

    tracing::info!("SealRPC node stopped");
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
    Ok(())
}

/// Reloads the authorized keys file into the live allow-list on SIGHUP.
async fn reload_on_sighup<D>(
    server: Arc<Server<D>>,
    store: KeyStore,
    shutdown: CancellationToken,
) -> anyhow::Result<()>
where
    D: rpcd::protocol::Dispatcher,
{
    use tokio::signal::unix::{signal, SignalKind};

    let mut sighup = signal(SignalKind::hangup()).context("Failed to register SIGHUP handler")?;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = sighup.recv() => {
                match store.load().and_then(|()| store.public_keys()) {
                    Ok(keys) => {
                        let count = keys.len();
                        server.authorized_keys().replace_all(keys);
                        tracing::info!(count, "Reloaded authorized keys");
                    }
                    Err(e) => {
                        tracing::warn!(
                            error = %e,
                            "Failed to reload authorized keys, keeping current set"
                        );
                    }
                }
            }
        }
    }
}

async fn run_call(
    config: &Config,
    service: &str,
    request: &str,
    transport: TransportKind,
    server_key: Option<String>,
) -> anyhow::Result<()> {
    let request: serde_json::Value =
        serde_json::from_str(request).context("Request is not valid JSON")?;

    let server_key = match server_key {
        Some(key) => parse_public_key(&key)?,
        None => config.client.server_key()?,
    };
    let identity = load_or_generate_identity(&config.node.identity_path())?;
    let client = Client::new(identity, server_key);
    let timeout = config.client.timeout();

    let response: serde_json::Value = match transport {
        TransportKind::Http => {
            let endpoint = url::Url::parse(&config.client.endpoint)
                .with_context(|| format!("Invalid endpoint: {}", config.client.endpoint))?;
            RpcClient::new(client, HttpClient::with_timeout(endpoint, timeout))
                .with_timeout(timeout)
                .call(service, &request)
                .await?
        }
        TransportKind::Stream => {
            RpcClient::new(
                client,
                StreamClient::tcp(config.client.stream_addr.clone()).with_io_timeout(timeout),
            )
            .with_timeout(timeout)
            .call(service, &request)
            .await?
        }
    };

    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}
