//! Network fetch capability.
//!
//! The router never talks to the network directly; it goes through a [`Fetch`]
//! implementation supplied by the host. A fetch *fails* only when no response
//! could be obtained at all (DNS, connect, TLS, timeout). An HTTP error status
//! is still a successful fetch, mirroring browser `fetch()`.

use std::future::Future;
use std::sync::Arc;

use thiserror::Error;

use crate::http::{Request, Response};

mod client;

#[cfg(test)]
pub(crate) mod testing;

pub use client::HttpFetcher;

/// Reasons a network fetch produced no response.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("network error fetching {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("method `{method}` cannot be sent upstream")]
    InvalidMethod { method: String },

    /// For [`Fetch`] implementations that are not backed by `reqwest` and know
    /// up front that no response can be had, e.g. a host that tracks its own
    /// connectivity and is currently offline.
    #[error("{url} is unreachable: {reason}")]
    Unreachable { url: String, reason: String },
}

/// Performs a network request.
pub trait Fetch: Send + Sync + 'static {
    fn fetch(&self, request: Request) -> impl Future<Output = Result<Response, FetchError>> + Send;
}

impl<F: Fetch> Fetch for Arc<F> {
    fn fetch(&self, request: Request) -> impl Future<Output = Result<Response, FetchError>> + Send {
        (**self).fetch(request)
    }
}
