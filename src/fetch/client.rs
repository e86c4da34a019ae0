//! [`Fetch`] over real HTTP using `reqwest`.

use std::time::Duration;

use tracing::debug;

use super::{Fetch, FetchError};
use crate::http::{Headers, Request, Response, StatusCode, headers::is_hop_by_hop};

/// Default per-request timeout for upstream fetches.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Fetches requests from their origin servers.
///
/// Redirects are followed by the client; the final URL is recorded on the
/// response. Compressed bodies are decoded before they reach the router.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    /// Builds a fetcher with the default 30 s timeout.
    pub fn new() -> Result<Self, FetchError> {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(FetchError::Client)?;
        Ok(Self { client })
    }
}

impl Fetch for HttpFetcher {
    async fn fetch(&self, request: Request) -> Result<Response, FetchError> {
        let url = request.url().to_string();
        let method = reqwest::Method::from_bytes(request.method().as_str().as_bytes()).map_err(
            |_| FetchError::InvalidMethod {
                method: request.method().to_string(),
            },
        )?;

        let mut builder = self.client.request(method, request.url().clone());
        for (name, value) in request.headers().iter() {
            // reqwest negotiates and decodes its own content encodings.
            if is_hop_by_hop(name)
                || name.eq_ignore_ascii_case("host")
                || name.eq_ignore_ascii_case("content-length")
                || name.eq_ignore_ascii_case("accept-encoding")
            {
                continue;
            }
            builder = builder.header(name, value);
        }
        if !request.body().is_empty() {
            builder = builder.body(request.body().clone());
        }

        let network_err = |source| FetchError::Network {
            url: url.clone(),
            source,
        };
        let upstream = builder.send().await.map_err(network_err)?;

        let status =
            StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
        let final_url = upstream.url().clone();
        let headers: Headers = upstream
            .headers()
            .iter()
            .filter_map(|(name, value)| Some((name.as_str().to_owned(), value.to_str().ok()?.to_owned())))
            .collect();
        let body = upstream.bytes().await.map_err(network_err)?;

        debug!(url = %url, status = %status, bytes = body.len(), "upstream fetch complete");

        Ok(Response::new(status)
            .headers_from(headers)
            .body_bytes(body)
            .with_url(final_url))
    }
}
