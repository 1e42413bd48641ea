//! LanLink chat sample entry point.
//!
//! ```text
//! lanlink-chat server [--bind 127.0.0.1:6695] [--announce]
//! lanlink-chat client [--connect 127.0.0.1:6695] [--discover]
//! ```
//!
//! Both modes read lines from stdin.  The client sends each line to the
//! server, which relays it to every other client.  `/quit` or end of input
//! exits.  Settings not covered by flags come from the TOML file named by
//! `--config` (or `LANLINK_CONFIG`); a missing file means defaults.

use std::io::BufRead;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use lanlink_chat::{encode_line, subscribe_lines, ChatRelay, DEFAULT_CHAT_ADDR};
use lanlink_net::{
    Client, DiscoveryRole, DiscoveryService, NetConfig, NetEvent, ResponseAction, Server,
};

const DISCOVERY_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
#[command(name = "lanlink-chat", about = "LAN chat over framed TCP")]
struct Cli {
    /// Path to a TOML config file.
    #[arg(long, env = "LANLINK_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the relay server.
    Server {
        #[arg(long, default_value = DEFAULT_CHAT_ADDR)]
        bind: SocketAddr,
        /// Answer discovery probes with the listener port.
        #[arg(long)]
        announce: bool,
    },
    /// Connect to a relay server and chat.
    Client {
        #[arg(long, default_value = DEFAULT_CHAT_ADDR)]
        connect: SocketAddr,
        /// Locate the server over UDP discovery before connecting.
        #[arg(long)]
        discover: bool,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => NetConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => NetConfig::default(),
    };

    match cli.command {
        Command::Server { bind, announce } => run_server(&config, bind, announce),
        Command::Client { connect, discover } => run_client(&config, connect, discover),
    }
}

fn run_server(config: &NetConfig, bind: SocketAddr, announce: bool) -> anyhow::Result<()> {
    let server = Arc::new(Server::new(config.connection.clone()));
    server.events().subscribe(|event| match event {
        NetEvent::ConnectionAdded(conn) => info!("client joined from {:?}", conn.remote_addr()),
        NetEvent::ConnectionRemoved(id) => info!("client {id} left"),
        _ => {}
    });
    let relay = ChatRelay::attach(Arc::clone(&server)).context("starting relay")?;
    let addr = server
        .start_listener(Some(bind), config.server.listen_backlog)
        .context("starting listener")?;
    info!("chat server listening on {addr}");

    let discovery = if announce {
        let service = DiscoveryService::new(DiscoveryRole::Server, config.discovery.clone(), None);
        service.set_message_data(i32::from(addr.port()));
        service
            .start_response_service()
            .context("starting discovery responder")?;
        Some(service)
    } else {
        None
    };

    for line in std::io::stdin().lock().lines() {
        let line = line.context("reading stdin")?;
        match line.trim() {
            "/quit" => break,
            "/who" => info!("{} client(s) connected", server.connection_count()),
            "/ping" => server.check_connections(),
            "" => {}
            text => server.send_to_all(&encode_line(&format!("[server] {text}"))?),
        }
    }

    if let Some(service) = discovery {
        service.stop_response_service();
    }
    drop(relay);
    server.shutdown();
    info!("chat server stopped");
    Ok(())
}

fn run_client(config: &NetConfig, fallback: SocketAddr, discover: bool) -> anyhow::Result<()> {
    let target = if discover {
        match discover_server(config)? {
            Some(addr) => addr,
            None => {
                warn!("no server answered discovery; using {fallback}");
                fallback
            }
        }
    } else {
        fallback
    };

    let client = Client::new(config.connection.clone());
    client.events().subscribe(|event| {
        if let NetEvent::ConnectionRemoved(_) = event {
            warn!("disconnected from server");
        }
    });
    subscribe_lines(&client, |text| println!("{text}"));
    client
        .connect(target)
        .with_context(|| format!("connecting to {target}"))?;
    info!("connected to {target}; type a message and press enter");

    for line in std::io::stdin().lock().lines() {
        let line = line.context("reading stdin")?;
        match line.trim() {
            "/quit" => break,
            "" => {}
            text => {
                if !client.is_connected() {
                    anyhow::bail!("connection to {target} lost");
                }
                client.send(&encode_line(text)?);
            }
        }
    }

    client.disconnect();
    Ok(())
}

/// Broadcasts a probe and waits for a server to answer with its endpoint.
///
/// The client's own responder listens one port above the server's discovery
/// port so both can run on one host.
fn discover_server(config: &NetConfig) -> anyhow::Result<Option<SocketAddr>> {
    let reply_port = config.discovery.port.wrapping_add(1);
    let mut responder_config = config.discovery.clone();
    responder_config.port = reply_port;
    responder_config.message_data = i32::from(reply_port);

    let (tx, rx) = mpsc::channel();
    let action: ResponseAction = Arc::new(move |endpoint| {
        if let Some(endpoint) = endpoint {
            let _ = tx.send(endpoint);
        }
    });
    let service = DiscoveryService::new(DiscoveryRole::Client, responder_config, Some(action));
    service
        .start_response_service()
        .context("starting discovery listener")?;

    // Probes go to the server's discovery port, not our reply port.
    let probe_target = SocketAddr::new(
        std::net::Ipv4Addr::BROADCAST.into(),
        config.discovery.port,
    );
    service
        .send_discovery_message(Some(probe_target))
        .context("sending discovery probe")?;
    info!("searching for a chat server...");

    let found = rx.recv_timeout(DISCOVERY_WAIT).ok();
    service.stop_response_service();
    Ok(found)
}
