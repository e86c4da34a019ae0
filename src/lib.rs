//! # offline_router
//!
//! Offline-first request routing for a small web application, modeled on a
//! browser service worker. A [`Worker`] precaches the application shell on
//! install, drops stale cache generations on activate, and then answers every
//! intercepted request with one of three strategies:
//!
//! - network-first for the remote availability API,
//! - cache-first with a root-page fallback for page navigations,
//! - cache-first with an icon fallback for everything else.
//!
//! The crate ships a memory and a disk [`cache`] backend, a `reqwest` based
//! [`fetch::HttpFetcher`], and a forward-proxy [`Server`] that hosts the
//! worker so a browser can be pointed at it.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use offline_router::{Server, Worker, WorkerConfig};
//! use offline_router::cache::DiskCacheStorage;
//! use offline_router::fetch::HttpFetcher;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let storage = DiskCacheStorage::open_root("./offline-cache").await?;
//!     let worker = Worker::new(
//!         WorkerConfig::default(),
//!         Arc::new(storage),
//!         Arc::new(HttpFetcher::new()?),
//!     )?;
//!     worker.start().await?;
//!
//!     let server = Server::bind("127.0.0.1:3128").await?;
//!     server.run(Arc::new(worker)).await?;
//!     Ok(())
//! }
//! ```

pub mod background;
pub mod cache;
pub mod config;
pub mod context;
pub mod fetch;
pub mod http;
pub mod lifecycle;
pub mod router;
pub mod server;

pub use background::WaitUntil;
pub use config::{ConfigError, WorkerConfig};
pub use context::FetchEvent;
pub use http::{Destination, Headers, Method, Request, RequestMode, Response, StatusCode};
pub use lifecycle::{LifecycleError, Worker, WorkerState};
pub use router::{RouteError, Router, Strategy};
pub use server::{Server, ServerError};
