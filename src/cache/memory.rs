//! In-process cache store.

use std::sync::Arc;

use tokio::sync::RwLock;

use super::{Cache, CacheError, CacheStorage, check_storable, snapshot};
use crate::http::{Method, Request, RequestKey, Response};

#[derive(Debug, Default)]
struct Generation {
    // Insertion order; a replaced entry moves to the back.
    entries: Vec<(RequestKey, Response)>,
    deleted: bool,
}

impl Generation {
    fn insert(&mut self, key: RequestKey, response: Response) {
        self.entries.retain(|(k, _)| *k != key);
        self.entries.push((key, response));
    }
}

/// Handle onto one in-memory generation.
#[derive(Debug, Clone)]
pub struct MemoryCache {
    name: Arc<str>,
    inner: Arc<RwLock<Generation>>,
}

impl MemoryCache {
    fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            inner: Arc::new(RwLock::new(Generation::default())),
        }
    }

    fn gone(&self) -> CacheError {
        CacheError::GenerationGone {
            name: self.name.to_string(),
        }
    }
}

impl Cache for MemoryCache {
    fn name(&self) -> &str {
        &self.name
    }

    async fn match_request(&self, request: &Request) -> Result<Option<Response>, CacheError> {
        if *request.method() != Method::Get {
            return Ok(None);
        }
        let key = request.key();
        let generation = self.inner.read().await;
        Ok(generation
            .entries
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, response)| response.clone()))
    }

    async fn put(&self, request: &Request, response: Response) -> Result<(), CacheError> {
        check_storable(request, &response)?;
        let mut generation = self.inner.write().await;
        if generation.deleted {
            return Err(self.gone());
        }
        generation.insert(request.key(), snapshot(response));
        Ok(())
    }

    async fn put_all(&self, entries: Vec<(Request, Response)>) -> Result<(), CacheError> {
        for (request, response) in &entries {
            check_storable(request, response)?;
        }
        let mut generation = self.inner.write().await;
        if generation.deleted {
            return Err(self.gone());
        }
        for (request, response) in entries {
            generation.insert(request.key(), snapshot(response));
        }
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<RequestKey>, CacheError> {
        let generation = self.inner.read().await;
        Ok(generation.entries.iter().map(|(k, _)| k.clone()).collect())
    }

    async fn delete(&self, request: &Request) -> Result<bool, CacheError> {
        let key = request.key();
        let mut generation = self.inner.write().await;
        let before = generation.entries.len();
        generation.entries.retain(|(k, _)| *k != key);
        Ok(generation.entries.len() < before)
    }
}

/// All generations, held in memory in creation order.
///
/// Cloning yields another handle onto the same storage.
///
/// # Examples
///
/// ```
/// use offline_router::cache::{Cache, CacheStorage, MemoryCacheStorage};
/// use offline_router::http::{Request, Response, StatusCode};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let storage = MemoryCacheStorage::new();
/// let cache = storage.open("app-v1").await?;
/// let req = Request::get("https://example.com/index.html")?;
/// cache.put(&req, Response::new(StatusCode::OK).body("<h1>hi</h1>")).await?;
///
/// let hit = storage.match_request(&req).await?.unwrap();
/// assert_eq!(hit.bytes().as_ref(), b"<h1>hi</h1>");
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryCacheStorage {
    generations: Arc<RwLock<Vec<MemoryCache>>>,
}

impl MemoryCacheStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheStorage for MemoryCacheStorage {
    type Cache = MemoryCache;

    async fn open(&self, name: &str) -> Result<MemoryCache, CacheError> {
        let mut generations = self.generations.write().await;
        if let Some(existing) = generations.iter().find(|c| &*c.name == name) {
            return Ok(existing.clone());
        }
        let cache = MemoryCache::new(name);
        generations.push(cache.clone());
        Ok(cache)
    }

    async fn has(&self, name: &str) -> Result<bool, CacheError> {
        let generations = self.generations.read().await;
        Ok(generations.iter().any(|c| &*c.name == name))
    }

    async fn keys(&self) -> Result<Vec<String>, CacheError> {
        let generations = self.generations.read().await;
        Ok(generations.iter().map(|c| c.name.to_string()).collect())
    }

    async fn delete(&self, name: &str) -> Result<bool, CacheError> {
        let removed = {
            let mut generations = self.generations.write().await;
            match generations.iter().position(|c| &*c.name == name) {
                Some(pos) => generations.remove(pos),
                None => return Ok(false),
            }
        };
        let mut generation = removed.inner.write().await;
        generation.deleted = true;
        generation.entries.clear();
        Ok(true)
    }

    async fn match_request(&self, request: &Request) -> Result<Option<Response>, CacheError> {
        let generations = self.generations.read().await.clone();
        for cache in generations {
            if let Some(response) = cache.match_request(request).await? {
                return Ok(Some(response));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::StatusCode;

    fn req(url: &str) -> Request {
        Request::get(url).unwrap()
    }

    fn ok(body: &str) -> Response {
        Response::new(StatusCode::OK).body(body.to_owned())
    }

    #[tokio::test]
    async fn open_is_idempotent() {
        let storage = MemoryCacheStorage::new();
        let a = storage.open("v1").await.unwrap();
        a.put(&req("https://x/a"), ok("a")).await.unwrap();
        let b = storage.open("v1").await.unwrap();
        assert!(b.match_request(&req("https://x/a")).await.unwrap().is_some());
        assert_eq!(storage.keys().await.unwrap(), vec!["v1"]);
    }

    #[tokio::test]
    async fn put_replaces_and_moves_to_back() {
        let storage = MemoryCacheStorage::new();
        let cache = storage.open("v1").await.unwrap();
        cache.put(&req("https://x/a"), ok("one")).await.unwrap();
        cache.put(&req("https://x/b"), ok("b")).await.unwrap();
        cache.put(&req("https://x/a"), ok("two")).await.unwrap();

        let keys: Vec<_> = cache
            .keys()
            .await
            .unwrap()
            .into_iter()
            .map(|k| k.url().path().to_owned())
            .collect();
        assert_eq!(keys, vec!["/b", "/a"]);

        let hit = cache.match_request(&req("https://x/a")).await.unwrap().unwrap();
        assert_eq!(hit.bytes().as_ref(), b"two");
    }

    #[tokio::test]
    async fn put_all_is_all_or_nothing() {
        let storage = MemoryCacheStorage::new();
        let cache = storage.open("v1").await.unwrap();
        let post = Request::new(Method::Post, "https://x/api".parse().unwrap());
        let result = cache
            .put_all(vec![(req("https://x/a"), ok("a")), (post, ok("p"))])
            .await;
        assert!(matches!(result, Err(CacheError::UnsupportedMethod { .. })));
        assert!(cache.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn non_get_never_matches() {
        let storage = MemoryCacheStorage::new();
        let cache = storage.open("v1").await.unwrap();
        cache.put(&req("https://x/a"), ok("a")).await.unwrap();
        let head = Request::new(Method::Head, "https://x/a".parse().unwrap());
        assert!(cache.match_request(&head).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_generation_detaches_handles() {
        let storage = MemoryCacheStorage::new();
        let cache = storage.open("v2").await.unwrap();
        cache.put(&req("https://x/a"), ok("a")).await.unwrap();

        assert!(storage.delete("v2").await.unwrap());
        assert!(!storage.delete("v2").await.unwrap());
        assert!(!storage.has("v2").await.unwrap());
        assert!(cache.match_request(&req("https://x/a")).await.unwrap().is_none());
        assert!(matches!(
            cache.put(&req("https://x/b"), ok("b")).await,
            Err(CacheError::GenerationGone { .. })
        ));
    }

    #[tokio::test]
    async fn storage_match_searches_in_creation_order() {
        let storage = MemoryCacheStorage::new();
        let old = storage.open("v1").await.unwrap();
        let new = storage.open("v2").await.unwrap();
        new.put(&req("https://x/a"), ok("new")).await.unwrap();
        old.put(&req("https://x/a"), ok("old")).await.unwrap();

        let hit = storage.match_request(&req("https://x/a")).await.unwrap().unwrap();
        assert_eq!(hit.bytes().as_ref(), b"old");
        assert!(storage.match_request(&req("https://x/z")).await.unwrap().is_none());
        assert_eq!(storage.keys().await.unwrap(), vec!["v1", "v2"]);
    }

    #[tokio::test]
    async fn fragment_does_not_affect_identity() {
        let storage = MemoryCacheStorage::new();
        let cache = storage.open("v1").await.unwrap();
        cache.put(&req("https://x/page#a"), ok("p")).await.unwrap();
        assert!(cache.match_request(&req("https://x/page")).await.unwrap().is_some());
        assert!(cache.delete(&req("https://x/page#b")).await.unwrap());
    }
}
