//! TCP server.
//!
//! Every accepted socket gets its own [`Connection`], populated by the
//! setup callback. Objects can only be active on one connection, so the
//! callback builds fresh roots for each peer.

use crate::config::Config;
use crate::connection::{Connection, ConnectionOptions};
use crate::error::BackendError;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

/// Populates a freshly accepted connection before it starts.
pub type SetupFn = Arc<dyn Fn(&mut Connection) -> Result<(), BackendError> + Send + Sync>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Tuning applied to every connection.
    pub options: ConnectionOptions,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            bind_addr: config.network.bind_addr,
            max_connections: config.network.max_connections,
            options: ConnectionOptions::from_config(config),
        }
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub errors_total: AtomicU64,
}

/// TCP server for objsync backends.
pub struct Server {
    config: ServerConfig,
    setup: SetupFn,
    stats: Arc<ServerStats>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

impl Server {
    /// Creates a new server.
    pub fn new<F>(config: ServerConfig, setup: F) -> Self
    where
        F: Fn(&mut Connection) -> Result<(), BackendError> + Send + Sync + 'static,
    {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            setup: Arc::new(setup),
            stats: Arc::new(ServerStats::default()),
            shutdown: shutdown_tx,
            running: AtomicBool::new(false),
        }
    }

    /// Binds the configured address and serves until shutdown.
    pub async fn run(&self) -> Result<(), BackendError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serves connections accepted from `listener` until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BackendError> {
        // Subscribe before flagging as running so a prompt shutdown is seen.
        let mut shutdown_rx = self.shutdown.subscribe();
        self.running.store(true, Ordering::SeqCst);
        tracing::info!("Server listening on {}", listener.local_addr()?);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((tcp_stream, addr)) => {
                            if self.stats.connections_active.load(Ordering::Relaxed)
                                >= self.config.max_connections as u64
                            {
                                tracing::warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }

                            self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
                            self.stats.connections_active.fetch_add(1, Ordering::Relaxed);

                            let setup = self.setup.clone();
                            let options = self.config.options.clone();
                            let stats = self.stats.clone();
                            let mut conn_shutdown = self.shutdown.subscribe();

                            tokio::spawn(async move {
                                tracing::info!("Client connected: {}", addr);
                                let result = Self::handle_connection(
                                    tcp_stream,
                                    addr,
                                    setup,
                                    options,
                                    &mut conn_shutdown,
                                )
                                .await;

                                if let Err(e) = result {
                                    tracing::debug!("Connection {} error: {}", addr, e);
                                    stats.errors_total.fetch_add(1, Ordering::Relaxed);
                                }

                                stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                                tracing::info!("Client disconnected: {}", addr);
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Server shutting down");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        setup: SetupFn,
        options: ConnectionOptions,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), BackendError> {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("[{}] Failed to set TCP_NODELAY: {}", addr, e);
        }

        let mut connection = Connection::new(stream).with_options(options);
        setup(&mut connection)?;

        tokio::select! {
            result = connection.run() => result,
            _ = shutdown.recv() => {
                tracing::debug!("[{}] Shutdown signal received", addr);
                Ok(())
            }
        }
    }

    /// Initiates server shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Returns whether the server is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns server statistics.
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }
}
