//! HTTP responses: the value returned to the page, archived in cache
//! generations, and serialized back onto the proxy connection.

use bytes::{BufMut, Bytes, BytesMut};
use url::Url;

use super::{Headers, StatusCode, headers::is_hop_by_hop};

/// An HTTP response.
///
/// The body is an immutable [`Bytes`] buffer, so cloning a response yields an
/// independent handle onto the same snapshot. Strategies that both return and
/// archive a response clone it before handing either copy off.
///
/// # Examples
///
/// ```
/// use offline_router::http::{Response, StatusCode};
///
/// let response = Response::new(StatusCode::OK)
///     .header("Content-Type", "application/json")
///     .body(r#"{"status":"ok"}"#);
///
/// let archived = response.clone();
/// assert_eq!(archived.bytes(), response.bytes());
///
/// let bytes = response.into_bytes();
/// let text = std::str::from_utf8(&bytes).unwrap();
/// assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
/// assert!(text.contains("Content-Length: 15\r\n"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    status: StatusCode,
    headers: Headers,
    body: Bytes,
    url: Option<Url>,
    keep_alive: bool,
}

impl Response {
    /// Creates a new response with the given status and an empty body.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Bytes::new(),
            url: None,
            keep_alive: true,
        }
    }

    /// Appends a response header. Multiple calls with the same name are additive.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Replaces the whole header map.
    #[must_use]
    pub fn headers_from(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    /// Sets the response body from a string.
    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Bytes::from(body.into());
        self
    }

    /// Sets the response body from raw bytes.
    #[must_use]
    pub fn body_bytes(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Records the final URL the response was served from.
    #[must_use]
    pub fn with_url(mut self, url: Url) -> Self {
        self.url = Some(url);
        self
    }

    /// Controls whether the `Connection: keep-alive` or `Connection: close` header is written.
    #[must_use]
    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Returns `true` for a `2xx` status.
    pub fn is_ok(&self) -> bool {
        self.status.is_success()
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the body snapshot.
    pub fn bytes(&self) -> &Bytes {
        &self.body
    }

    /// Returns the URL this response was served from, if known.
    pub fn url(&self) -> Option<&Url> {
        self.url.as_ref()
    }

    /// Serializes the response into a `BytesMut` buffer using HTTP/1.1 wire format.
    ///
    /// Framing is always recomputed: hop-by-hop and `Content-Length` headers
    /// carried over from upstream or from the cache are dropped and replaced by
    /// a fresh `Content-Length` and `Connection` pair.
    pub fn into_bytes(self) -> BytesMut {
        let content_length = self.body.len();
        let connection = if self.keep_alive {
            "keep-alive"
        } else {
            "close"
        };

        let estimated_size = 128 + self.headers.len() * 64 + content_length;
        let mut buf = BytesMut::with_capacity(estimated_size);

        let reason = self.status.canonical_reason().unwrap_or("");
        buf.put(format!("HTTP/1.1 {} {}\r\n", self.status.as_u16(), reason).as_bytes());

        for (name, value) in self.headers.iter() {
            if is_hop_by_hop(name) || name.eq_ignore_ascii_case("content-length") {
                continue;
            }
            buf.put(format!("{name}: {value}\r\n").as_bytes());
        }

        if !self.body.is_empty() && !self.headers.contains("content-type") {
            buf.put(&b"Content-Type: application/octet-stream\r\n"[..]);
        }
        buf.put(format!("Connection: {connection}\r\n").as_bytes());
        buf.put(format!("Content-Length: {content_length}\r\n").as_bytes());
        buf.put(&b"\r\n"[..]);

        if !self.body.is_empty() {
            buf.put(self.body);
        }

        buf
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new(StatusCode::OK)
    }
}
