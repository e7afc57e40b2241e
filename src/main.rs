//! objsync - shared live object graphs
//!
//! Serves a demo object graph over TCP or stdio, or probes a running backend.

mod demo;

use clap::{Parser, Subcommand};
use objsync_backend::{Config, ConnectionOptions, Server, ServerConfig};
use objsync_frontend::Value;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "objsync")]
#[command(about = "Share a live object graph between a backend and a frontend")]
#[command(version)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, env = "OBJSYNC_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the demo object graph (default)
    Serve {
        /// Address to bind to
        #[arg(short, long)]
        bind: Option<SocketAddr>,

        /// Serve a single connection over stdin/stdout
        #[arg(long)]
        stdio: bool,
    },

    /// Connect to a backend and print its singletons
    Probe {
        /// Backend address
        #[arg(default_value = "127.0.0.1:7402")]
        addr: SocketAddr,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Logs go to stderr: in stdio mode stdout carries the protocol.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve {
        bind: None,
        stdio: false,
    }) {
        Commands::Serve { bind, stdio } => {
            let mut config = load_config(cli.config.as_ref())?;
            if let Some(bind) = bind {
                config.network.bind_addr = bind;
            }
            config.network.stdio |= stdio;
            serve(config).await
        }
        Commands::Probe { addr } => probe(addr).await,
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<Config, Box<dyn std::error::Error>> {
    let Some(path) = path else {
        return Ok(Config::load().unwrap_or_else(|e| {
            tracing::warn!("Ignoring invalid environment configuration: {}", e);
            Config::default()
        }));
    };
    match Config::load_from(path) {
        Ok(config) => {
            tracing::info!("Loaded config from {}", path.display());
            Ok(config)
        }
        Err(e) => {
            // An explicitly named file must load.
            tracing::error!("Failed to load config: {}", e);
            Err(e.into())
        }
    }
}

async fn serve(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!(
        "  Sync: threshold={} grace={}ms interval={}ms",
        config.sync.object_threshold,
        config.sync.grace_period_ms,
        config.sync.sync_interval_ms
    );

    if config.network.stdio {
        tracing::info!("Serving over stdio");
        let mut conn = objsync_backend::Connection::new_split(tokio::io::stdin(), tokio::io::stdout())
            .with_options(ConnectionOptions::from_config(&config));
        demo::setup(&mut conn)?;
        conn.run().await?;
        tracing::info!("Peer disconnected");
        return Ok(());
    }

    tracing::info!("Starting objsync server");
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    tracing::info!("  Max connections: {}", config.network.max_connections);

    let server = Arc::new(Server::new(ServerConfig::from_config(&config), demo::setup));

    // Spawn shutdown signal handler
    let shutdown_server = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping server...");
        shutdown_server.shutdown();
    });

    server.run().await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn probe(addr: SocketAddr) -> Result<(), Box<dyn std::error::Error>> {
    let mut conn = objsync_frontend::Connection::connect(addr).await?;
    conn.handshake().await?;
    tracing::info!("Connected to {} (protocol {:?})", addr, conn.version());

    println!("types: {}", conn.instantiable_types().join(", "));
    let names: Vec<String> = conn.singleton_names().map(str::to_string).collect();
    for name in names {
        let proxy = conn.singleton(&name).await?;
        println!("{} ({})", name, proxy.type_name());
        let properties: Vec<String> = proxy
            .descriptor()
            .properties
            .iter()
            .map(|p| p.name.clone())
            .collect();
        for property in properties {
            let value = conn.property(&proxy, &property).await?;
            println!("  {} = {}", property, describe(&value));
        }
    }

    conn.close().await?;
    Ok(())
}

fn describe(value: &Value) -> String {
    match value {
        Value::Object(proxy) => format!("<{} {}>", proxy.type_name(), proxy.identifier()),
        other => other.to_json().to_string(),
    }
}
