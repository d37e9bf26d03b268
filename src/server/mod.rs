//! Connection listener
//!
//! Accepts front-end WebSocket connections and pairs each with a connection
//! to the browser's inspector endpoint at the same request path. Every pair
//! runs its own relay and bridge.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::{accept_hdr_async, connect_async};

use crate::bridge::Bridge;
use crate::common::config::Config;
use crate::common::{Error, Result};
use crate::relay;
use crate::store::{AssemblyLoader, HttpLoader};

/// The proxy listener
pub struct ProxyServer {
    config: Config,
    loader: Arc<dyn AssemblyLoader>,
}

impl ProxyServer {
    pub fn new(config: Config) -> Result<Self> {
        let loader = Arc::new(HttpLoader::new(&config.store)?);
        Ok(Self::with_loader(config, loader))
    }

    pub fn with_loader(config: Config, loader: Arc<dyn AssemblyLoader>) -> Self {
        Self { config, loader }
    }

    /// Bind the configured address and serve until ctrl-c
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.server.listen).await?;
        tracing::info!(
            listen = %listener.local_addr()?,
            browser = %self.config.server.browser,
            "Proxy listening"
        );
        self.serve(listener).await
    }

    /// Serve connections from `listener` until ctrl-c
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Received Ctrl+C, shutting down");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let config = self.config.clone();
                        let loader = Arc::clone(&self.loader);
                        tokio::spawn(async move {
                            match handle_connection(stream, peer, config, loader).await {
                                Ok(()) => tracing::info!(%peer, "Connection closed"),
                                Err(e) => tracing::error!(%peer, "Connection failed: {}", e),
                            }
                        });
                    }
                    Err(e) => tracing::error!("Accept error: {}", e),
                },
            }
        }
        Ok(())
    }
}

#[tracing::instrument(skip(stream, config, loader))]
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    config: Config,
    loader: Arc<dyn AssemblyLoader>,
) -> Result<()> {
    let mut path = String::new();
    let frontend = accept_hdr_async(stream, |request: &Request, response: Response| {
        path = request
            .uri()
            .path_and_query()
            .map(|p| p.to_string())
            .unwrap_or_default();
        Ok::<Response, ErrorResponse>(response)
    })
    .await?;

    let url = runtime_url(&config.server.browser, &path)?;
    tracing::info!(%url, "Front end connected, connecting to runtime");
    let (runtime, _) = connect_async(url.as_str()).await?;

    let bridge = Arc::new(Bridge::new(config, loader));
    relay::run(frontend, runtime, bridge).await
}

/// WebSocket url of the browser inspector endpoint serving `path_and_query`
pub fn runtime_url(browser: &str, path_and_query: &str) -> Result<String> {
    let mut url = url::Url::parse(browser)
        .map_err(|e| Error::Config(format!("invalid browser url '{browser}': {e}")))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(Error::Config(format!(
                "unsupported browser url scheme '{other}'"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| Error::Config(format!("cannot use scheme {scheme} for '{browser}'")))?;

    let (path, query) = match path_and_query.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (path_and_query, None),
    };
    url.set_path(path);
    url.set_query(query);
    Ok(url.to_string())
}
