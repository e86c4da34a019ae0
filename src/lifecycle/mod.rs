//! Worker lifecycle: install, activate, and fetch handling.
//!
//! ```text
//! Parsed ──install──▶ Installing ──ok──▶ Installed ──activate──▶ Activating ──▶ Activated
//!                          │
//!                          └──err──▶ Redundant
//! ```
//!
//! A successful install skips the waiting phase: the worker may be activated
//! straight away. Activation deletes every generation except the current one
//! and claims control, after which [`Worker::handle_fetch`] routes requests
//! through the [`Router`]. Before that, requests go straight to the network.

use std::fmt;
use std::sync::Arc;

use futures::future::try_join_all;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::cache::{Cache, CacheError, CacheStorage};
use crate::config::{ConfigError, WorkerConfig};
use crate::context::FetchEvent;
use crate::fetch::{Fetch, FetchError};
use crate::http::{Response, StatusCode};
use crate::router::{RouteError, Router};

/// Where a worker is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerState {
    Parsed,
    Installing,
    Installed,
    Activating,
    Activated,
    /// Install failed; the worker will never control requests.
    Redundant,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Parsed => "parsed",
            Self::Installing => "installing",
            Self::Installed => "installed",
            Self::Activating => "activating",
            Self::Activated => "activated",
            Self::Redundant => "redundant",
        })
    }
}

/// Errors from lifecycle transitions.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("cannot {event} a worker in state `{state}`")]
    InvalidState {
        event: &'static str,
        state: WorkerState,
    },

    #[error("static asset fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("static asset {url} answered {status}")]
    BadStatus { url: String, status: StatusCode },

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// One version of the offline worker.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use offline_router::{
///     FetchEvent, Request, Worker, WorkerConfig,
///     cache::MemoryCacheStorage, fetch::HttpFetcher,
/// };
///
/// # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
/// let worker = Worker::new(
///     WorkerConfig::default(),
///     Arc::new(MemoryCacheStorage::new()),
///     Arc::new(HttpFetcher::new()?),
/// )?;
/// worker.start().await?;
///
/// let event = FetchEvent::new(Request::get("http://localhost:8080/")?);
/// let response = worker.handle_fetch(&event).await?;
/// event.settled().await;
/// println!("{}", response.status());
/// # Ok(())
/// # }
/// ```
pub struct Worker<S, F> {
    config: WorkerConfig,
    storage: Arc<S>,
    fetcher: Arc<F>,
    router: Router<S, F>,
    state: RwLock<WorkerState>,
}

impl<S, F> Worker<S, F>
where
    S: CacheStorage,
    F: Fetch,
{
    /// Creates a worker in the [`WorkerState::Parsed`] state.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Config`] if `config` fails validation.
    pub fn new(config: WorkerConfig, storage: Arc<S>, fetcher: Arc<F>) -> Result<Self, LifecycleError> {
        config.validate()?;
        let router = Router::new(&config, Arc::clone(&storage), Arc::clone(&fetcher))?;
        Ok(Self {
            config,
            storage,
            fetcher,
            router,
            state: RwLock::new(WorkerState::Parsed),
        })
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn router(&self) -> &Router<S, F> {
        &self.router
    }

    pub async fn state(&self) -> WorkerState {
        *self.state.read().await
    }

    // Moves `from → to` atomically, or reports the state that blocked it.
    async fn transition(
        &self,
        event: &'static str,
        from: WorkerState,
        to: WorkerState,
    ) -> Result<(), LifecycleError> {
        let mut state = self.state.write().await;
        if *state != from {
            return Err(LifecycleError::InvalidState {
                event,
                state: *state,
            });
        }
        debug!(from = %from, to = %to, "worker state change");
        *state = to;
        Ok(())
    }

    async fn set_state(&self, to: WorkerState) {
        *self.state.write().await = to;
    }

    /// Installs the static assets into the current generation.
    ///
    /// Every asset is fetched; only if all of them answer with a `2xx` status
    /// are they written, in one atomic bulk write. On any failure nothing is
    /// written and the worker becomes [`WorkerState::Redundant`].
    pub async fn install(&self) -> Result<(), LifecycleError> {
        self.transition("install", WorkerState::Parsed, WorkerState::Installing)
            .await?;
        info!(generation = %self.config.cache_name, assets = self.config.static_assets.len(), "installing");

        match self.precache().await {
            Ok(()) => {
                self.set_state(WorkerState::Installed).await;
                info!(generation = %self.config.cache_name, "installed; skipping wait");
                Ok(())
            }
            Err(e) => {
                self.set_state(WorkerState::Redundant).await;
                warn!(generation = %self.config.cache_name, error = %e, "install failed");
                Err(e)
            }
        }
    }

    async fn precache(&self) -> Result<(), LifecycleError> {
        let cache = self.storage.open(&self.config.cache_name).await?;
        let requests = self.config.asset_requests()?;

        let responses = try_join_all(
            requests
                .iter()
                .cloned()
                .map(|request| self.fetcher.fetch(request)),
        )
        .await?;

        for (request, response) in requests.iter().zip(&responses) {
            if !response.is_ok() {
                return Err(LifecycleError::BadStatus {
                    url: request.url().to_string(),
                    status: response.status(),
                });
            }
        }

        cache.put_all(requests.into_iter().zip(responses).collect()).await?;
        Ok(())
    }

    /// Deletes every generation other than the current one and claims control.
    ///
    /// Individual deletion failures are logged and otherwise ignored. Returns
    /// the names of the generations that were removed.
    pub async fn activate(&self) -> Result<Vec<String>, LifecycleError> {
        self.transition("activate", WorkerState::Installed, WorkerState::Activating)
            .await?;

        let names = match self.storage.keys().await {
            Ok(names) => names,
            Err(e) => {
                self.set_state(WorkerState::Installed).await;
                return Err(e.into());
            }
        };

        let mut removed = Vec::new();
        for name in names.into_iter().filter(|n| *n != self.config.cache_name) {
            match self.storage.delete(&name).await {
                Ok(true) => {
                    info!(generation = %name, "deleted stale generation");
                    removed.push(name);
                }
                Ok(false) => {}
                Err(e) => warn!(generation = %name, error = %e, "failed to delete stale generation"),
            }
        }

        self.set_state(WorkerState::Activated).await;
        info!(generation = %self.config.cache_name, "activated; claiming clients");
        Ok(removed)
    }

    /// Installs and immediately activates, as a freshly registered worker would.
    pub async fn start(&self) -> Result<Vec<String>, LifecycleError> {
        self.install().await?;
        self.activate().await
    }

    /// Answers an intercepted request.
    ///
    /// Only an activated worker applies the routing policy; otherwise the
    /// request is passed straight to the network.
    pub async fn handle_fetch(&self, event: &FetchEvent) -> Result<Response, RouteError> {
        let request = event.request().clone();
        if self.state().await != WorkerState::Activated {
            debug!(url = %request.url(), "worker not in control, passing through");
            let url = request.url().to_string();
            let strategy = self.router.classify(&request);
            return self
                .fetcher
                .fetch(request)
                .await
                .map_err(|source| RouteError::Unresolved {
                    url,
                    strategy,
                    source,
                });
        }
        self.router.route(request, event.lifetime()).await
    }
}
