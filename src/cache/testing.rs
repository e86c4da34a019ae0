//! Failure-injecting [`CacheStorage`] for tests.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use super::{CacheError, CacheStorage, MemoryCache, MemoryCacheStorage};
use crate::http::{Request, Response};

/// In-memory storage whose generation deletes and storage-wide lookups can be
/// switched to fail with an I/O error.
#[derive(Debug, Default)]
pub(crate) struct FlakyStorage {
    inner: MemoryCacheStorage,
    fail_delete: AtomicBool,
    fail_match: AtomicBool,
}

impl FlakyStorage {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn fail_deletes(&self, fail: bool) {
        self.fail_delete.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_lookups(&self, fail: bool) {
        self.fail_match.store(fail, Ordering::SeqCst);
    }
}

fn injected(op: &str) -> CacheError {
    CacheError::Io(io::Error::other(format!("injected {op} failure")))
}

impl CacheStorage for FlakyStorage {
    type Cache = MemoryCache;

    async fn open(&self, name: &str) -> Result<MemoryCache, CacheError> {
        self.inner.open(name).await
    }

    async fn has(&self, name: &str) -> Result<bool, CacheError> {
        self.inner.has(name).await
    }

    async fn keys(&self) -> Result<Vec<String>, CacheError> {
        self.inner.keys().await
    }

    async fn delete(&self, name: &str) -> Result<bool, CacheError> {
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(injected("delete"));
        }
        self.inner.delete(name).await
    }

    async fn match_request(&self, request: &Request) -> Result<Option<Response>, CacheError> {
        if self.fail_match.load(Ordering::SeqCst) {
            return Err(injected("lookup"));
        }
        self.inner.match_request(request).await
    }
}
