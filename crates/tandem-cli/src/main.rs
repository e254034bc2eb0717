//! tandem CLI
//!
//! Runs an echo server and a ping client over tandem connections.

mod config;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use clap::{Parser, Subcommand};
use tandem_codec::Identity;
use tandem_core::{
    CancelSignal, Connection, DispatchContext, DispatchError, Dispatcher, IncomingRequest,
    OutgoingRequest, OutgoingResponse, RemoteException, ServantMap, encapsulate,
};
use tandem_transport::{Role, TcpAcceptor, TcpTransport, Transport, WebSocketInfo, WebSocketTransport};
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;

use config::Config;

const ECHO_IDENTITY: &str = "Echo";
const ECHO_CATEGORY: &str = "tandem";

/// tandem - multiplexed RPC connections
#[derive(Parser)]
#[command(name = "tandem")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the echo object until interrupted
    Serve {
        /// Listen address
        #[arg(short, long, default_value = "127.0.0.1:4061")]
        bind: SocketAddr,

        /// Frame connections as WebSocket binary messages
        #[arg(long)]
        websocket: bool,
    },

    /// Send echo requests to a server and report round-trip times
    Ping {
        /// Server address
        addr: SocketAddr,

        /// Number of requests
        #[arg(short = 'n', long, default_value_t = 4)]
        count: u32,

        /// Payload size in bytes
        #[arg(short, long, default_value_t = 64)]
        size: usize,

        /// Frame the connection as WebSocket binary messages
        #[arg(long)]
        websocket: bool,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default()?,
    };
    config.validate()?;

    init_logging(cli.verbose, &config);

    match cli.command {
        Commands::Serve { bind, websocket } => serve(bind, websocket, &config).await?,
        Commands::Ping {
            addr,
            count,
            size,
            websocket,
        } => ping(addr, count, size, websocket, &config).await?,
        Commands::Config => print!("{}", toml::to_string_pretty(&config)?),
    }

    Ok(())
}

fn init_logging(verbose: bool, config: &Config) {
    let level = if verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn echo_identity() -> Identity {
    Identity::with_category(ECHO_IDENTITY, ECHO_CATEGORY)
}

fn websocket_info() -> WebSocketInfo {
    WebSocketInfo {
        resource: "/tandem".to_string(),
        protocol: Some("ice.zeroc.com".to_string()),
    }
}

fn wrap(transport: TcpTransport, websocket: bool, role: Role) -> Arc<dyn Transport> {
    if websocket {
        Arc::new(WebSocketTransport::new(transport, role, websocket_info()))
    } else {
        Arc::new(transport)
    }
}

/// Returns the request payload; `fail` raises an unhandled error
struct EchoServant;

#[async_trait]
impl Dispatcher for EchoServant {
    async fn dispatch(
        &self,
        request: IncomingRequest,
        context: DispatchContext,
    ) -> Result<OutgoingResponse, DispatchError> {
        tracing::debug!(
            connection = %context.connection,
            stream_id = context.stream_id,
            operation = %request.operation,
            "echo request"
        );
        match request.operation.as_str() {
            "echo" => Ok(OutgoingResponse::Ok(request.payload)),
            "fail" => Err(DispatchError::unhandled("echo servant asked to fail")),
            _ => Err(RemoteException::operation_not_exist(&request).into()),
        }
    }
}

/// Accept connections and dispatch to the echo servant until Ctrl+C
async fn serve(bind: SocketAddr, websocket: bool, config: &Config) -> anyhow::Result<()> {
    let acceptor = TcpAcceptor::bind(bind).await?;
    let local = acceptor.local_addr()?;
    tracing::info!(%local, websocket, "serving {}", echo_identity());

    println!("tandem server");
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!("Listen: {local}");
    println!("WebSocket: {websocket}");
    println!("Press Ctrl+C to stop");

    let mut servants = ServantMap::new();
    servants.insert(echo_identity(), Arc::new(EchoServant));
    let dispatcher: Arc<dyn Dispatcher> = Arc::new(servants);

    let connections: Arc<Mutex<HashMap<u64, Connection>>> = Arc::default();
    let next_id = AtomicU64::new(0);

    loop {
        tokio::select! {
            accepted = acceptor.accept() => {
                let transport = match accepted {
                    Ok(transport) => wrap(transport, websocket, Role::Server),
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let id = next_id.fetch_add(1, Ordering::Relaxed);
                let options = config.connection_options();
                let dispatcher = dispatcher.clone();
                let connections = connections.clone();
                tokio::spawn(async move {
                    let connection = match Connection::accept(transport, options, Some(dispatcher)).await {
                        Ok(connection) => connection,
                        Err(e) => {
                            tracing::warn!(error = %e, "connection establishment failed");
                            return;
                        }
                    };
                    connection.on_closed(|reason| tracing::info!(%reason, "connection closed"));
                    if let Ok(mut table) = connections.lock() {
                        table.insert(id, connection.clone());
                    }
                    let table = connections.clone();
                    connection.set_remove_callback(move || {
                        if let Ok(mut table) = table.lock() {
                            table.remove(&id);
                        }
                    });
                });
            }
            result = tokio::signal::ctrl_c() => {
                result?;
                break;
            }
        }
    }

    println!("\nShutting down...");
    let open: Vec<Connection> = match connections.lock() {
        Ok(table) => table.values().cloned().collect(),
        Err(_) => Vec::new(),
    };
    let mut closing = JoinSet::new();
    for connection in open {
        closing.spawn(async move { connection.close("server shutdown").await });
    }
    while let Some(result) = closing.join_next().await {
        if let Ok(reason) = result {
            tracing::debug!(%reason, "connection shut down");
        }
    }

    Ok(())
}

/// Invoke `echo` `count` times and print the round-trip times
async fn ping(
    addr: SocketAddr,
    count: u32,
    size: usize,
    websocket: bool,
    config: &Config,
) -> anyhow::Result<()> {
    let transport = wrap(TcpTransport::connect(addr).await?, websocket, Role::Client);
    let connection = Connection::connect(transport, config.connection_options(), None).await?;
    tracing::info!(connection = %connection.description(), "connected");

    let data = vec![0xA5u8; size];
    let payload = encapsulate(|out| {
        out.write_byte_seq(&data);
        Ok(())
    })?;
    let request = OutgoingRequest::new(echo_identity(), "echo", payload.clone());

    println!("PING {addr} ({size} bytes)");
    let mut times = Vec::with_capacity(count as usize);
    for seq in 0..count {
        let start = Instant::now();
        let response = connection
            .invoke(&request, CancelSignal::never())
            .await?
            .ok_or_else(|| anyhow::anyhow!("no response to a twoway request"))?;
        let elapsed = start.elapsed();

        let echoed: Bytes = response.into_result()?;
        if echoed != payload {
            anyhow::bail!("echo payload mismatch on request {seq}");
        }
        println!("seq={seq} bytes={} time={:.3} ms", echoed.len(), millis(elapsed));
        times.push(elapsed);
    }

    if let (Some(min), Some(max)) = (times.iter().min(), times.iter().max()) {
        let total: Duration = times.iter().sum();
        let avg = total / u32::try_from(times.len()).unwrap_or(u32::MAX);
        println!(
            "{} requests, min/avg/max = {:.3}/{:.3}/{:.3} ms",
            times.len(),
            millis(*min),
            millis(avg),
            millis(*max)
        );
    }

    let reason = connection.close("ping finished").await;
    tracing::debug!(%reason, "connection closed");
    Ok(())
}

fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}
