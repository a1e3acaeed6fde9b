//! Websocket server: accept loop and shared application state.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};

use crate::config::Config;
use crate::feed::FeedHub;
use crate::registry::Registry;
use crate::store::{Store, StoreConfig, StoreError};
use crate::subscription::Client;
use crate::throttle::Throttle;

/// Events buffered per feed task before producers back off.
const FEED_QUEUE_DEPTH: usize = 256;

/// Shared handles every session works through.
#[derive(Clone)]
pub struct App {
    pub store: Store,
    pub hub: FeedHub,
    pub registry: Registry,
    pub throttle: Throttle,
    pub config: Arc<Config>,
}

impl App {
    pub fn new(store: Store, config: Arc<Config>) -> Self {
        let hub = FeedHub::new(store.clone(), FEED_QUEUE_DEPTH);
        let registry = Registry::new(store.clone());
        let throttle = Throttle::new(store.clone(), config.clone());
        Self {
            store,
            hub,
            registry,
            throttle,
            config,
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Store configuration
    pub store: StoreConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8001".to_string(),
            store: StoreConfig::default(),
        }
    }
}

/// The posting core server.
pub struct Server {
    config: ServerConfig,
    app: App,
}

impl Server {
    pub fn new(config: ServerConfig, app_config: Config) -> Result<Self, StoreError> {
        let store = Store::open(config.store.clone())?;
        let app = App::new(store, Arc::new(app_config));
        Ok(Self { config, app })
    }

    pub fn app(&self) -> &App {
        &self.app
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Populate the registry, start its tail, and serve connections.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let loaded = self.app.registry.populate()?;
        log::info!("registry loaded {loaded} post mappings");
        self.app.registry.start();

        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            let app = self.app.clone();
            tokio::spawn(handle_connection(stream, addr, app));
        }
    }
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, app: App) {
    match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => {
            log::debug!("websocket connection from {addr}");
            Client::new(app, addr.ip()).run(ws).await;
            log::debug!("connection closed from {addr}");
        }
        Err(e) => log::debug!("handshake failed from {addr}: {e}"),
    }
}
