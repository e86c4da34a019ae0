//! Cache store: named, versioned generations of request→response entries.
//!
//! A [`CacheStorage`] owns every generation; a [`Cache`] is a handle onto one
//! of them. Handles are cheap to clone and may outlive a deleted generation,
//! in which case writes fail with [`CacheError::GenerationGone`] and reads miss.
//!
//! Two backends are provided:
//!
//! - [`MemoryCacheStorage`]: process-local, used by tests and short-lived hosts.
//! - [`DiskCacheStorage`]: one directory per generation, survives restarts.
//!
//! Both follow browser cache semantics for what may be stored: only `GET`
//! requests, never partial (`206`) responses.

use std::future::Future;

use thiserror::Error;

use crate::http::{Method, Request, RequestKey, Response, StatusCode};

pub mod disk;
pub mod memory;

#[cfg(test)]
pub(crate) mod testing;

pub use disk::{DiskCache, DiskCacheStorage};
pub use memory::{MemoryCache, MemoryCacheStorage};

/// Errors produced by cache stores.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("only GET requests can be cached, got {method}")]
    UnsupportedMethod { method: Method },

    #[error("partial responses cannot be cached: {url}")]
    PartialContent { url: String },

    #[error("cache generation `{name}` no longer exists")]
    GenerationGone { name: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt cache metadata: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("invalid cache entry {path}: {reason}")]
    InvalidEntry { path: String, reason: String },
}

/// A handle onto one cache generation.
pub trait Cache: Clone + Send + Sync + 'static {
    /// Name of the generation this handle points at.
    fn name(&self) -> &str;

    /// Returns the stored response for `request`, if any.
    ///
    /// Non-`GET` requests never match.
    fn match_request(
        &self,
        request: &Request,
    ) -> impl Future<Output = Result<Option<Response>, CacheError>> + Send;

    /// Stores `response` under `request`, replacing any prior entry for the same key.
    fn put(
        &self,
        request: &Request,
        response: Response,
    ) -> impl Future<Output = Result<(), CacheError>> + Send;

    /// Stores every entry or none of them.
    fn put_all(
        &self,
        entries: Vec<(Request, Response)>,
    ) -> impl Future<Output = Result<(), CacheError>> + Send;

    /// Returns the keys of every entry, oldest first.
    fn keys(&self) -> impl Future<Output = Result<Vec<RequestKey>, CacheError>> + Send;

    /// Removes the entry for `request`. Returns `true` if one existed.
    fn delete(&self, request: &Request) -> impl Future<Output = Result<bool, CacheError>> + Send;
}

/// The set of all generations.
pub trait CacheStorage: Send + Sync + 'static {
    type Cache: Cache;

    /// Opens the named generation, creating it if it does not exist yet.
    fn open(&self, name: &str) -> impl Future<Output = Result<Self::Cache, CacheError>> + Send;

    /// Returns `true` if the named generation exists.
    fn has(&self, name: &str) -> impl Future<Output = Result<bool, CacheError>> + Send;

    /// Returns generation names in creation order.
    fn keys(&self) -> impl Future<Output = Result<Vec<String>, CacheError>> + Send;

    /// Deletes the named generation. Returns `true` if it existed.
    fn delete(&self, name: &str) -> impl Future<Output = Result<bool, CacheError>> + Send;

    /// Searches every generation in creation order and returns the first match.
    ///
    /// Never creates a generation as a side effect.
    fn match_request(
        &self,
        request: &Request,
    ) -> impl Future<Output = Result<Option<Response>, CacheError>> + Send;
}

/// Rejects entries a browser cache would refuse to store.
pub(crate) fn check_storable(request: &Request, response: &Response) -> Result<(), CacheError> {
    if *request.method() != Method::Get {
        return Err(CacheError::UnsupportedMethod {
            method: request.method().clone(),
        });
    }
    if response.status() == StatusCode::PARTIAL_CONTENT {
        return Err(CacheError::PartialContent {
            url: request.url().to_string(),
        });
    }
    Ok(())
}

/// Strips connection-level headers before a response is archived.
pub(crate) fn snapshot(response: Response) -> Response {
    let mut headers = response.headers().clone();
    headers.strip_hop_by_hop();
    response.headers_from(headers)
}
