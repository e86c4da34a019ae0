//! Worker configuration: the cache generation tag, the static asset list and
//! the fixed fallback resources.
//!
//! Every field has a default, so an empty TOML document is a valid config:
//!
//! ```toml
//! cache_name = "property-availability-cache-v3"
//! scope = "http://localhost:8080/"
//! static_assets = ["./", "./index.html", "./manifest.json", "./icon.png"]
//! api_host_marker = "script.google.com"
//! root_page = "./index.html"
//! fallback_icon = "./icon.png"
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::http::{Method, Request};

/// Tag of the current cache generation. Bump the version to roll out a new one.
pub const DEFAULT_CACHE_NAME: &str = "property-availability-cache-v3";

/// Host fragment identifying the remote script-execution endpoint.
pub const DEFAULT_API_HOST_MARKER: &str = "script.google.com";

pub const DEFAULT_SCOPE: &str = "http://localhost:8080/";
pub const DEFAULT_ROOT_PAGE: &str = "./index.html";
pub const DEFAULT_FALLBACK_ICON: &str = "./icon.png";
pub const DEFAULT_STATIC_ASSETS: &[&str] = &["./", "./index.html", "./manifest.json", "./icon.png"];

/// Errors produced while loading or validating a [`WorkerConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("cache_name must not be empty")]
    EmptyCacheName,

    #[error("invalid scope `{scope}`: {source}")]
    InvalidScope {
        scope: String,
        #[source]
        source: url::ParseError,
    },

    #[error("scope `{scope}` must be an http(s) URL ending in `/`")]
    ScopeNotDirectory { scope: String },

    #[error("invalid static asset `{asset}`: {source}")]
    InvalidAsset {
        asset: String,
        #[source]
        source: url::ParseError,
    },

    #[error("fallback resource `{resource}` is not in static_assets")]
    MissingFallback { resource: String },
}

/// Settings for one worker version.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerConfig {
    /// Name of the current cache generation.
    pub cache_name: String,
    /// Base URL that relative asset paths resolve against.
    pub scope: String,
    /// Assets installed ahead of first use, in order.
    pub static_assets: Vec<String>,
    /// Requests whose host contains this string are routed network-first.
    pub api_host_marker: String,
    /// Served to navigations that miss the cache while offline.
    pub root_page: String,
    /// Served to image requests that miss the cache while offline.
    pub fallback_icon: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            cache_name: DEFAULT_CACHE_NAME.to_owned(),
            scope: DEFAULT_SCOPE.to_owned(),
            static_assets: DEFAULT_STATIC_ASSETS.iter().map(|s| (*s).to_owned()).collect(),
            api_host_marker: DEFAULT_API_HOST_MARKER.to_owned(),
            root_page: DEFAULT_ROOT_PAGE.to_owned(),
            fallback_icon: DEFAULT_FALLBACK_ICON.to_owned(),
        }
    }
}

impl WorkerConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&source)
    }

    /// Checks the invariants the worker relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache_name.trim().is_empty() {
            return Err(ConfigError::EmptyCacheName);
        }
        self.scope_url()?;
        for asset in &self.static_assets {
            self.resolve(asset)?;
        }
        for resource in [&self.root_page, &self.fallback_icon] {
            if !self.static_assets.contains(resource) {
                return Err(ConfigError::MissingFallback {
                    resource: resource.clone(),
                });
            }
        }
        Ok(())
    }

    /// Parses the scope URL.
    pub fn scope_url(&self) -> Result<Url, ConfigError> {
        let url = Url::parse(&self.scope).map_err(|source| ConfigError::InvalidScope {
            scope: self.scope.clone(),
            source,
        })?;
        if !matches!(url.scheme(), "http" | "https") || !url.path().ends_with('/') {
            return Err(ConfigError::ScopeNotDirectory {
                scope: self.scope.clone(),
            });
        }
        Ok(url)
    }

    /// Resolves a scope-relative path such as `./icon.png` to an absolute URL.
    pub fn resolve(&self, relative: &str) -> Result<Url, ConfigError> {
        self.scope_url()?
            .join(relative)
            .map_err(|source| ConfigError::InvalidAsset {
                asset: relative.to_owned(),
                source,
            })
    }

    /// Builds `GET` requests for every static asset, in list order.
    pub fn asset_requests(&self) -> Result<Vec<Request>, ConfigError> {
        let scope = self.scope_url()?;
        self.static_assets
            .iter()
            .map(|asset| {
                scope
                    .join(asset)
                    .map(|url| Request::new(Method::Get, url))
                    .map_err(|source| ConfigError::InvalidAsset {
                        asset: asset.clone(),
                        source,
                    })
            })
            .collect()
    }
}
