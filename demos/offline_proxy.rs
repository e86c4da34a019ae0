//! Runs the offline router as a local forward proxy.
//!
//! ```text
//! cargo run --example offline_proxy -- [config.toml] [listen-addr]
//! ```
//!
//! Point the browser's HTTP proxy at the listen address (default
//! `127.0.0.1:3128`). Responses are cached under `./offline-cache`.

use std::sync::Arc;

use offline_router::cache::DiskCacheStorage;
use offline_router::fetch::HttpFetcher;
use offline_router::{Server, Worker, WorkerConfig};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,offline_router=debug")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => WorkerConfig::from_file(&path)?,
        None => WorkerConfig::default(),
    };
    let addr = args.next().unwrap_or_else(|| "127.0.0.1:3128".to_owned());

    let storage = DiskCacheStorage::open_root("./offline-cache").await?;
    let worker = Worker::new(config, Arc::new(storage), Arc::new(HttpFetcher::new()?))?;

    // A failed install leaves the worker redundant; requests still pass through.
    match worker.start().await {
        Ok(removed) => info!(removed = ?removed, "worker activated"),
        Err(e) => error!(error = %e, "worker failed to start"),
    }

    let server = Server::bind(&addr).await?;
    server.run(Arc::new(worker)).await?;
    Ok(())
}
