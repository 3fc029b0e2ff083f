//! Gnutella connection engine CLI.
//!
//! # Commands
//!
//! - `connect` - Dial a peer, handshake and print traffic as JSON lines
//! - `listen` - Accept peers and print their traffic as JSON lines

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use gnutella::{
    config::Config, driver_for, handshake::header::names, ChannelDispatcher, Connection,
    ConnectionContext, ConnectionEvent, Headers, IoModel, Message, Notice, Reactor,
    StaticResponder, VERSION,
};
use serde_json::json;
use tokio::sync::mpsc::UnboundedReceiver;

#[derive(Parser)]
#[command(name = "gnutella")]
#[command(version = VERSION)]
#[command(about = "Gnutella 0.6 connection engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: <config dir>/gnutella/config.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// I/O model (blocking, nio)
    #[arg(long, global = true)]
    io_model: Option<String>,

    /// Log level filter (overridden by RUST_LOG)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to a peer
    Connect {
        /// Peer address (host:port)
        addr: String,

        /// Advertise as an ultrapeer
        #[arg(long)]
        ultrapeer: bool,
    },

    /// Accept incoming peers
    Listen {
        /// Listen port (default: from config)
        port: Option<u16>,

        /// Listen host
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level));
    let subscriber = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter);
    if cli.json_logs {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    let mut config = match cli.config {
        Some(path) => Config::from_file(path)?,
        None => match Config::default_path().filter(|p| p.exists()) {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        },
    };
    config.apply_env();
    if let Some(model) = cli.io_model {
        config.io.model = IoModel::from_str(&model).map_err(|e| anyhow::anyhow!(e))?;
    }

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async move {
        match cli.command {
            Commands::Connect { addr, ultrapeer } => cmd_connect(config, &addr, ultrapeer).await,
            Commands::Listen { port, host } => cmd_listen(config, port, &host).await,
        }
    })
}

fn our_headers(config: &Config, ultrapeer: bool) -> Headers {
    Headers::new()
        .with(names::USER_AGENT, format!("gnutella-core/{VERSION}"))
        .with(names::ULTRAPEER, if ultrapeer { "True" } else { "False" })
        .with(names::MAX_TTL, config.messages.soft_max_ttl.to_string())
        .with(names::ACCEPT_ENCODING, "deflate")
        .with(names::GGEP, "0.5")
        .with(names::REMOTE_IP, "0.0.0.0")
}

fn context(
    config: &Arc<Config>,
    headers: Headers,
) -> (ConnectionContext, UnboundedReceiver<Notice>) {
    let (dispatcher, notices) = ChannelDispatcher::new();
    let responder = StaticResponder::new(headers).with_crawler_rejection(true);
    let ctx = ConnectionContext::new(Arc::clone(config), Arc::new(responder))
        .with_dispatcher(Arc::new(dispatcher));
    (ctx, notices)
}

fn print_notice(notice: &Notice) {
    let line = match notice {
        Notice::Message {
            connection,
            message,
        } => json!({
            "connection": connection,
            "guid": message.guid().to_string(),
            "kind": format!("{:?}", message.opcode()),
            "ttl": message.ttl(),
            "hops": message.hops(),
            "length": message.len(),
        }),
        Notice::Event { connection, event } => json!({
            "connection": connection,
            "event": event,
        }),
    };
    println!("{line}");
}

async fn cmd_connect(config: Config, addr: &str, ultrapeer: bool) -> anyhow::Result<()> {
    let remote: SocketAddr = tokio::net::lookup_host(addr)
        .await?
        .next()
        .ok_or_else(|| anyhow::anyhow!("No address for {}", addr))?;

    let config = Arc::new(config);
    let headers = our_headers(&config, ultrapeer);
    let (ctx, mut notices) = context(&config, headers.clone());

    let (reactor, handle) = Reactor::new();
    let reactor_task = (config.io.model == IoModel::Nio).then(|| tokio::spawn(reactor.run()));
    let driver = driver_for(&config, Some(handle))?;

    tracing::info!("Connecting to {} ({} I/O)", remote, driver.model());
    let conn = Arc::new(Connection::outgoing(remote, headers, ctx));
    driver.start(Arc::clone(&conn))?;
    drop(driver);

    while let Some(notice) = notices.recv().await {
        print_notice(&notice);
        match notice {
            Notice::Event {
                event: ConnectionEvent::Connected,
                ..
            } => conn.send(Message::ping(1)),
            Notice::Event {
                event: ConnectionEvent::Closed { .. },
                ..
            } => break,
            _ => {},
        }
    }

    println!("{}", serde_json::to_string(&conn.stats().summary())?);
    if let Some(task) = reactor_task {
        task.await??;
    }
    Ok(())
}

async fn cmd_listen(config: Config, port: Option<u16>, host: &str) -> anyhow::Result<()> {
    let port = port.unwrap_or(config.network.listen_port);
    let addr: SocketAddr = format!("{host}:{port}").parse()?;

    let config = Arc::new(config);
    let headers = our_headers(&config, true);
    let (ctx, mut notices) = context(&config, headers);

    let (reactor, handle) = Reactor::new();
    if config.io.model == IoModel::Nio {
        tokio::spawn(reactor.run());
    }
    let driver = driver_for(&config, Some(handle))?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Listening on {} ({} I/O)", addr, driver.model());

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                tracing::info!("Accepted connection from {}", peer);
                let conn = Connection::incoming(stream.into_std()?, ctx.clone())?;
                driver.start(Arc::new(conn))?;
            }
            Some(notice) = notices.recv() => print_notice(&notice),
        }
    }
}
