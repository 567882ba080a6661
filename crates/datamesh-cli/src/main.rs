//! Datamesh CLI
//!
//! Commands:
//! - dmesh controller   - Run a controller node (TCP + UDP presence)
//! - dmesh server       - Run a plain data server
//! - dmesh client       - Send one request and print the reply
//! - dmesh listen       - Print presence broadcasts as they arrive

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use datamesh_core::{
    build_mesh, load_config, Request, DEFAULT_BROADCAST_PORT, DEFAULT_CONTROLLER_PORT,
};
use datamesh_daemon::{Handler, MeshServer, PresenceEvent, PresenceListener};

/// Datamesh - hierarchical data mesh node
#[derive(Parser)]
#[command(name = "dmesh", version, about = "Hierarchical data mesh node")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a controller: data server on the controller port plus presence broadcasts
    Controller {
        /// Controller TCP port
        #[arg(short, long)]
        port: Option<u16>,
        /// Presence UDP port
        #[arg(long)]
        broadcast_port: Option<u16>,
        /// Seconds between presence broadcasts
        #[arg(long)]
        interval: Option<u64>,
        /// Config file (default: ~/.datamesh/config.json)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Run a plain data server (no `add`, no presence)
    Server {
        #[arg(short, long)]
        port: u16,
        /// Config file (default: ~/.datamesh/config.json)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Send one request and print the reply
    Client {
        #[arg(short, long, default_value = "127.0.0.1")]
        addr: String,
        #[arg(short, long, default_value_t = DEFAULT_CONTROLLER_PORT)]
        port: u16,
        /// get, set, run, show, showall, add
        #[arg(short, long)]
        method: String,
        #[arg(short, long, default_value = "/")]
        uri: String,
        /// Request body, sent as a JSON-encoded string
        #[arg(short, long)]
        body: Option<String>,
        #[arg(long)]
        seq: Option<i64>,
    },
    /// Print presence broadcasts with their source address
    #[command(alias = "listener")]
    Listen {
        #[arg(short, long, default_value_t = DEFAULT_BROADCAST_PORT)]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = if e.use_stderr() { 1 } else { 0 };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "datamesh=info,dmesh=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Controller {
            port,
            broadcast_port,
            interval,
            config,
        } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(port) = port {
                config.controller_port = port;
            }
            if let Some(port) = broadcast_port {
                config.broadcast_port = port;
            }
            if let Some(secs) = interval {
                config.broadcast_interval_secs = secs;
            }
            datamesh_daemon::launch(config).await?;
        }
        Commands::Server { port, config } => {
            let config = load_config(config.as_deref())?;
            let mesh = build_mesh(&config);
            let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
            let server = MeshServer::bind(addr, Handler::server(mesh, config.max_request_bytes))
                .with_context(|| format!("Failed to bind port {}", port))?;
            server.run().await;
        }
        Commands::Client {
            addr,
            port,
            method,
            uri,
            body,
            seq,
        } => {
            let request = Request {
                method,
                uri,
                body: body.map(Value::String),
                seq: seq.map(Value::from),
            };
            let reply = datamesh_daemon::send_request(format!("{}:{}", addr, port), &request)
                .await
                .with_context(|| format!("Request to {}:{} failed", addr, port))?;
            println!("{}", reply);
        }
        Commands::Listen { port } => listen(port).await?,
    }

    Ok(())
}

async fn listen(port: u16) -> Result<()> {
    let listener = PresenceListener::bind(port)
        .with_context(|| format!("Failed to bind UDP port {}", port))?;
    println!("📡 Listening for presence on UDP {}", port);

    loop {
        match listener.recv().await? {
            PresenceEvent::Peer { descriptor, source } => {
                println!("{} {}", source, descriptor);
            }
            PresenceEvent::Raw { text, source } => {
                println!("{} (raw) {}", source, text);
            }
        }
    }
}
