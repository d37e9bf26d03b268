//! CLI command handling
//!
//! Runs the proxy server or the offline symbol check and formats output.

use std::sync::Arc;

use futures_util::StreamExt;

use crate::commands::Commands;
use crate::common::config::Config;
use crate::common::{logging, Result};
use crate::location::SourceLocation;
use crate::server::ProxyServer;
use crate::store::{DebugStore, HttpLoader, SourceFile};

/// Dispatch a CLI command
pub async fn dispatch(command: Commands) -> Result<()> {
    let mut config = Config::load()?;

    match command {
        Commands::Serve { listen, browser } => {
            let _guard = logging::init_server();
            tracing::info!(
                version = env!("CARGO_PKG_VERSION"),
                pid = std::process::id(),
                "Starting debug proxy"
            );

            if let Some(listen) = listen {
                config.server.listen = listen;
            }
            if let Some(browser) = browser {
                config.server.browser = browser;
            }
            ProxyServer::new(config)?.run().await
        }

        Commands::Symbols { urls, points } => {
            logging::init_cli();

            let loader = Arc::new(HttpLoader::new(&config.store)?);
            let store = DebugStore::new(loader, config.store.symbol_extension.clone());

            let mut sources = store.load(&urls).collect::<Vec<_>>().await;
            if sources.is_empty() {
                println!("No documents found");
                return Ok(());
            }
            sources.sort_by_key(|s| s.id);
            for source in &sources {
                print_source(source, points);
            }
            Ok(())
        }
    }
}

fn print_source(source: &SourceFile, points: bool) {
    println!("{} {}", source.id, source.dotnet_url);
    if let Some(uri) = &source.source_link_uri {
        println!("  source link: {}", uri);
    }
    for method in &source.methods {
        let start = method
            .start
            .as_ref()
            .map(|l| format!("{}:{}", l.line, l.column))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:#010x} {}::{} at {}",
            method.token, method.type_name, method.name, start
        );
        if points {
            for sp in method.visible_points() {
                let location = SourceLocation::at_point(method, sp);
                println!(
                    "      IL_{:04x} -> {}:{}",
                    sp.offset, location.line, location.column
                );
            }
        }
    }
}
