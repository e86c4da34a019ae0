//! Request routing: classify each intercepted request and answer it from the
//! cache, the network, or a fallback.
//!
//! Classification is order-sensitive; the first matching rule wins:
//!
//! | Rule                                         | Strategy                     |
//! |----------------------------------------------|------------------------------|
//! | host contains the remote-API marker          | [`Strategy::NetworkFirst`]   |
//! | mode `navigate` or destination `document`    | [`Strategy::Navigation`]     |
//! | everything else                              | [`Strategy::CacheFirst`]     |
//!
//! Each strategy touches the network and the cache at most once per request;
//! nothing is retried. Copies written to the cache go through the event's
//! [`WaitUntil`], so the caller's response never waits on a cache write.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::background::WaitUntil;
use crate::cache::{Cache, CacheStorage};
use crate::config::{ConfigError, WorkerConfig};
use crate::fetch::{Fetch, FetchError};
use crate::http::{Destination, Method, Request, Response};

/// How a request is answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    /// Live data: network, then cache on failure.
    NetworkFirst,
    /// Page loads: cache, then network, then the root page.
    Navigation,
    /// Sub-resources: cache, then network, then the icon for images.
    CacheFirst,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NetworkFirst => "network-first",
            Self::Navigation => "navigation",
            Self::CacheFirst => "cache-first",
        })
    }
}

/// A request no strategy could answer.
///
/// The host reports this to the page as a network error.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("{strategy} request for {url} unresolved: {source}")]
    Unresolved {
        url: String,
        strategy: Strategy,
        #[source]
        source: FetchError,
    },
}

/// Applies the routing policy on top of a cache store and a fetcher.
///
/// Reads search every generation in the store; writes go to the current
/// generation only.
pub struct Router<S, F> {
    storage: Arc<S>,
    fetcher: Arc<F>,
    cache_name: Arc<str>,
    api_host_marker: String,
    root_page: Request,
    fallback_icon: Request,
}

impl<S, F> Router<S, F>
where
    S: CacheStorage,
    F: Fetch,
{
    /// Builds a router for the generation and fallbacks named in `config`.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the fallback resources do not resolve
    /// against the configured scope.
    pub fn new(config: &WorkerConfig, storage: Arc<S>, fetcher: Arc<F>) -> Result<Self, ConfigError> {
        Ok(Self {
            storage,
            fetcher,
            cache_name: Arc::from(config.cache_name.as_str()),
            api_host_marker: config.api_host_marker.clone(),
            root_page: Request::new(Method::Get, config.resolve(&config.root_page)?),
            fallback_icon: Request::new(Method::Get, config.resolve(&config.fallback_icon)?),
        })
    }

    /// Name of the generation opportunistic writes go to.
    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    fn is_remote_api(&self, request: &Request) -> bool {
        !self.api_host_marker.is_empty()
            && request
                .url()
                .host_str()
                .is_some_and(|host| host.contains(&self.api_host_marker))
    }

    /// Picks the strategy for `request`.
    pub fn classify(&self, request: &Request) -> Strategy {
        if self.is_remote_api(request) {
            Strategy::NetworkFirst
        } else if request.is_navigation() {
            Strategy::Navigation
        } else {
            Strategy::CacheFirst
        }
    }

    /// Answers `request` with exactly one strategy.
    ///
    /// Background cache writes are registered on `lifetime`.
    ///
    /// # Errors
    ///
    /// [`RouteError::Unresolved`] when the network fails and the strategy has
    /// no cached answer or fallback to offer.
    pub async fn route(&self, request: Request, lifetime: &WaitUntil) -> Result<Response, RouteError> {
        let strategy = self.classify(&request);
        debug!(url = %request.url(), %strategy, "routing request");
        match strategy {
            Strategy::NetworkFirst => self.network_first(request, lifetime).await,
            Strategy::Navigation => self.navigation(request, lifetime).await,
            Strategy::CacheFirst => self.cache_first(request, lifetime).await,
        }
    }

    async fn network_first(&self, request: Request, lifetime: &WaitUntil) -> Result<Response, RouteError> {
        match self.fetcher.fetch(request.clone()).await {
            Ok(response) => {
                if response.is_ok() {
                    self.store_in_background(lifetime, request, response.clone());
                }
                Ok(response)
            }
            Err(source) => {
                info!(url = %request.url(), error = %source, "network failed, trying cache");
                match self.lookup(&request).await {
                    Some(cached) => Ok(cached),
                    None => Err(unresolved(&request, Strategy::NetworkFirst, source)),
                }
            }
        }
    }

    async fn navigation(&self, request: Request, lifetime: &WaitUntil) -> Result<Response, RouteError> {
        if let Some(cached) = self.lookup(&request).await {
            return Ok(cached);
        }
        match self.fetcher.fetch(request.clone()).await {
            Ok(response) => {
                self.store_in_background(lifetime, request, response.clone());
                Ok(response)
            }
            Err(source) => {
                info!(url = %request.url(), error = %source, "offline navigation, serving root page");
                match self.lookup(&self.root_page).await {
                    Some(page) => Ok(page),
                    None => Err(unresolved(&request, Strategy::Navigation, source)),
                }
            }
        }
    }

    async fn cache_first(&self, request: Request, lifetime: &WaitUntil) -> Result<Response, RouteError> {
        if let Some(cached) = self.lookup(&request).await {
            return Ok(cached);
        }
        match self.fetcher.fetch(request.clone()).await {
            Ok(response) => {
                self.store_in_background(lifetime, request, response.clone());
                Ok(response)
            }
            Err(source) => {
                // Only images get a stand-in; other asset types fail as-is.
                if *request.destination() == Destination::Image {
                    if let Some(icon) = self.lookup(&self.fallback_icon).await {
                        return Ok(icon);
                    }
                }
                Err(unresolved(&request, Strategy::CacheFirst, source))
            }
        }
    }

    // A store error on the read path counts as a miss.
    async fn lookup(&self, request: &Request) -> Option<Response> {
        match self.storage.match_request(request).await {
            Ok(hit) => hit,
            Err(e) => {
                warn!(url = %request.url(), error = %e, "cache lookup failed");
                None
            }
        }
    }

    fn store_in_background(&self, lifetime: &WaitUntil, request: Request, response: Response) {
        let storage = Arc::clone(&self.storage);
        let cache_name = Arc::clone(&self.cache_name);
        lifetime.wait_until(async move {
            let result = match storage.open(&cache_name).await {
                Ok(cache) => cache.put(&request, response).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => debug!(url = %request.url(), "cached network response"),
                Err(e) => debug!(url = %request.url(), error = %e, "cache write skipped"),
            }
        });
    }
}

fn unresolved(request: &Request, strategy: Strategy, source: FetchError) -> RouteError {
    warn!(url = %request.url(), %strategy, "request unresolved");
    RouteError::Unresolved {
        url: request.url().to_string(),
        strategy,
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCacheStorage;
    use crate::cache::testing::FlakyStorage;
    use crate::fetch::testing::ScriptedFetch;
    use crate::http::{RequestMode, StatusCode};

    const CACHE: &str = "property-availability-cache-v3";
    const API: &str = "https://script.google.com/macros/s/abc/exec?action=availability";
    const INDEX: &str = "http://localhost:8080/index.html";
    const ICON: &str = "http://localhost:8080/icon.png";

    struct Harness {
        router: Router<MemoryCacheStorage, ScriptedFetch>,
        storage: Arc<MemoryCacheStorage>,
        net: Arc<ScriptedFetch>,
    }

    impl Harness {
        fn new() -> Self {
            let storage = Arc::new(MemoryCacheStorage::new());
            let net = Arc::new(ScriptedFetch::new());
            let router =
                Router::new(&WorkerConfig::default(), Arc::clone(&storage), Arc::clone(&net)).unwrap();
            Self {
                router,
                storage,
                net,
            }
        }

        async fn seed(&self, url: &str, body: &str) {
            let cache = self.storage.open(CACHE).await.unwrap();
            cache
                .put(&get(url), Response::new(StatusCode::OK).body(body.to_owned()))
                .await
                .unwrap();
        }

        async fn cached_body(&self, url: &str) -> Option<Vec<u8>> {
            self.storage
                .match_request(&get(url))
                .await
                .unwrap()
                .map(|r| r.bytes().to_vec())
        }

        async fn route(&self, request: Request) -> Result<Response, RouteError> {
            let lifetime = WaitUntil::new();
            let result = self.router.route(request, &lifetime).await;
            lifetime.settled().await;
            result
        }
    }

    fn get(url: &str) -> Request {
        Request::get(url).unwrap()
    }

    fn navigate(url: &str) -> Request {
        get(url).with_mode(RequestMode::Navigate)
    }

    fn image(url: &str) -> Request {
        get(url).with_destination(Destination::Image)
    }

    // ── Classification ────────────────────────────────────────────────────────

    #[test]
    fn api_marker_wins_over_navigation() {
        let h = Harness::new();
        assert_eq!(h.router.classify(&navigate(API)), Strategy::NetworkFirst);
        assert_eq!(h.router.classify(&get(API)), Strategy::NetworkFirst);
    }

    #[test]
    fn navigation_by_mode_or_destination() {
        let h = Harness::new();
        assert_eq!(h.router.classify(&navigate(INDEX)), Strategy::Navigation);
        let doc = get(INDEX).with_destination(Destination::Document);
        assert_eq!(h.router.classify(&doc), Strategy::Navigation);
    }

    #[test]
    fn everything_else_is_cache_first() {
        let h = Harness::new();
        assert_eq!(h.router.classify(&image(ICON)), Strategy::CacheFirst);
        assert_eq!(
            h.router.classify(&get("http://localhost:8080/manifest.json")),
            Strategy::CacheFirst
        );
        // Marker must be in the host, not the path.
        assert_eq!(
            h.router.classify(&get("http://localhost:8080/script.google.com")),
            Strategy::CacheFirst
        );
    }

    // ── Network-first ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn api_online_returns_live_and_caches_copy() {
        let h = Harness::new();
        h.seed(API, r#"{"status":"stale"}"#).await;
        h.net.serve(API, StatusCode::OK, r#"{"status":"fresh"}"#);

        let res = h.route(get(API)).await.unwrap();
        assert_eq!(res.bytes().as_ref(), br#"{"status":"fresh"}"#);
        assert_eq!(h.net.calls_to(API), 1);
        assert_eq!(h.cached_body(API).await.unwrap(), br#"{"status":"fresh"}"#);
    }

    #[tokio::test]
    async fn api_error_status_returned_but_not_cached() {
        let h = Harness::new();
        h.net.serve(API, StatusCode::INTERNAL_SERVER_ERROR, "quota exceeded");

        let res = h.route(get(API)).await.unwrap();
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(h.cached_body(API).await.is_none());
    }

    #[tokio::test]
    async fn api_offline_serves_cached_copy() {
        let h = Harness::new();
        h.seed(API, r#"{"status":"ok"}"#).await;
        h.net.set_online(false);

        let res = h.route(get(API)).await.unwrap();
        assert_eq!(res.bytes().as_ref(), br#"{"status":"ok"}"#);
    }

    #[tokio::test]
    async fn api_offline_without_copy_fails() {
        let h = Harness::new();
        h.net.set_online(false);

        let err = h.route(get(API)).await.unwrap_err();
        assert!(matches!(
            err,
            RouteError::Unresolved {
                strategy: Strategy::NetworkFirst,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn api_post_is_answered_but_never_cached() {
        let h = Harness::new();
        h.net.serve(API, StatusCode::OK, "saved");
        let post = Request::new(Method::Post, API.parse().unwrap()).with_body("booking");

        let res = h.route(post).await.unwrap();
        assert_eq!(res.bytes().as_ref(), b"saved");
        assert!(h.cached_body(API).await.is_none());
    }

    // ── Navigation ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn navigation_hit_skips_network() {
        let h = Harness::new();
        h.seed("http://localhost:8080/", "<shell>").await;

        let res = h.route(navigate("http://localhost:8080/")).await.unwrap();
        assert_eq!(res.bytes().as_ref(), b"<shell>");
        assert_eq!(h.net.calls(), 0);
    }

    #[tokio::test]
    async fn navigation_miss_fetches_and_stores() {
        let h = Harness::new();
        h.net.serve("http://localhost:8080/about.html", StatusCode::OK, "<about>");

        let res = h.route(navigate("http://localhost:8080/about.html")).await.unwrap();
        assert_eq!(res.bytes().as_ref(), b"<about>");
        assert_eq!(
            h.cached_body("http://localhost:8080/about.html").await.unwrap(),
            b"<about>"
        );
    }

    #[tokio::test]
    async fn navigation_offline_falls_back_to_root_page() {
        let h = Harness::new();
        h.seed(INDEX, "<index>").await;
        h.net.set_online(false);

        let res = h.route(navigate("http://localhost:8080/rooms/12")).await.unwrap();
        assert_eq!(res.bytes().as_ref(), b"<index>");
    }

    #[tokio::test]
    async fn navigation_offline_without_root_page_fails() {
        let h = Harness::new();
        h.net.set_online(false);

        let err = h.route(navigate("http://localhost:8080/rooms/12")).await.unwrap_err();
        assert!(matches!(
            err,
            RouteError::Unresolved {
                strategy: Strategy::Navigation,
                ..
            }
        ));
    }

    // ── Cache-first ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn repeated_static_request_is_served_from_cache() {
        let h = Harness::new();
        let css = "http://localhost:8080/style.css";
        h.net.serve(css, StatusCode::OK, "body{}");

        let first = h.route(get(css)).await.unwrap();
        let second = h.route(get(css)).await.unwrap();
        assert_eq!(first.bytes(), second.bytes());
        assert_eq!(h.net.calls_to(css), 1);
    }

    #[tokio::test]
    async fn cache_hit_returns_stored_bytes_without_network() {
        let h = Harness::new();
        h.seed("http://localhost:8080/manifest.json", "{}").await;

        let res = h.route(get("http://localhost:8080/manifest.json")).await.unwrap();
        assert_eq!(res.bytes().as_ref(), b"{}");
        assert_eq!(h.net.calls(), 0);
    }

    #[tokio::test]
    async fn offline_image_gets_fallback_icon() {
        let h = Harness::new();
        h.seed(ICON, "PNG").await;
        h.net.set_online(false);

        let res = h.route(image("http://localhost:8080/photos/1.jpg")).await.unwrap();
        assert_eq!(res.bytes().as_ref(), b"PNG");
    }

    #[tokio::test]
    async fn offline_image_without_icon_fails() {
        let h = Harness::new();
        h.net.set_online(false);

        let err = h.route(image("http://localhost:8080/photos/1.jpg")).await.unwrap_err();
        assert!(matches!(
            err,
            RouteError::Unresolved {
                strategy: Strategy::CacheFirst,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn icon_fallback_is_image_only() {
        let h = Harness::new();
        h.seed(ICON, "PNG").await;
        h.net.set_online(false);

        let script = get("http://localhost:8080/app.js").with_destination(Destination::Script);
        assert!(h.route(script).await.is_err());
    }

    #[tokio::test]
    async fn uncacheable_response_still_returned() {
        let h = Harness::new();
        let clip = "http://localhost:8080/clip.mp4";
        h.net.serve(clip, StatusCode::PARTIAL_CONTENT, "part");

        let res = h.route(get(clip)).await.unwrap();
        assert_eq!(res.status(), StatusCode::PARTIAL_CONTENT);
        assert!(h.cached_body(clip).await.is_none());
    }

    #[tokio::test]
    async fn failed_lookup_counts_as_miss() {
        let storage = Arc::new(FlakyStorage::new());
        let net = Arc::new(ScriptedFetch::new());
        let router =
            Router::new(&WorkerConfig::default(), Arc::clone(&storage), Arc::clone(&net)).unwrap();
        let script = "http://localhost:8080/app.js";
        storage
            .open(CACHE)
            .await
            .unwrap()
            .put(&get(script), Response::new(StatusCode::OK).body("stale"))
            .await
            .unwrap();
        net.serve(script, StatusCode::OK, "fresh");
        storage.fail_lookups(true);

        let lifetime = WaitUntil::new();
        let res = router.route(get(script), &lifetime).await.unwrap();
        lifetime.settled().await;

        assert_eq!(res.bytes().as_ref(), b"fresh");
        assert_eq!(net.calls_to(script), 1);
    }
}
