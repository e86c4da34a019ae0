//! Intercepted requests: construction, classification metadata, and parsing
//! off the wire using the [`httparse`] crate.

use std::fmt;

use bytes::Bytes;
use thiserror::Error;
use url::Url;

use super::{Headers, Method};

/// Errors that can occur while building or parsing a request.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request is incomplete, more data needed")]
    Incomplete,

    #[error("HTTP parse error: {0}")]
    Parse(#[from] httparse::Error),

    #[error("missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("invalid request URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

/// How the request was initiated, as reported by `Sec-Fetch-Mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RequestMode {
    /// Top-level page load.
    Navigate,
    SameOrigin,
    #[default]
    NoCors,
    Cors,
    WebSocket,
}

impl RequestMode {
    /// Parses a `Sec-Fetch-Mode` token.
    pub fn from_token(token: &str) -> Option<Self> {
        Some(match token.trim().to_ascii_lowercase().as_str() {
            "navigate" => Self::Navigate,
            "same-origin" => Self::SameOrigin,
            "no-cors" => Self::NoCors,
            "cors" => Self::Cors,
            "websocket" => Self::WebSocket,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Navigate => "navigate",
            Self::SameOrigin => "same-origin",
            Self::NoCors => "no-cors",
            Self::Cors => "cors",
            Self::WebSocket => "websocket",
        }
    }
}

/// What the response will be used for, as reported by `Sec-Fetch-Dest`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum Destination {
    /// `fetch()`/XHR and anything without a more specific consumer.
    #[default]
    Empty,
    Document,
    Iframe,
    Image,
    Script,
    Style,
    Font,
    Manifest,
    Audio,
    Video,
    Worker,
    Other(String),
}

impl Destination {
    /// Parses a `Sec-Fetch-Dest` token. Unknown tokens are kept verbatim.
    pub fn from_token(token: &str) -> Self {
        match token.trim().to_ascii_lowercase().as_str() {
            "" | "empty" => Self::Empty,
            "document" => Self::Document,
            "iframe" => Self::Iframe,
            "image" => Self::Image,
            "script" => Self::Script,
            "style" => Self::Style,
            "font" => Self::Font,
            "manifest" => Self::Manifest,
            "audio" => Self::Audio,
            "video" => Self::Video,
            "worker" => Self::Worker,
            other => Self::Other(other.to_owned()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Empty => "empty",
            Self::Document => "document",
            Self::Iframe => "iframe",
            Self::Image => "image",
            Self::Script => "script",
            Self::Style => "style",
            Self::Font => "font",
            Self::Manifest => "manifest",
            Self::Audio => "audio",
            Self::Video => "video",
            Self::Worker => "worker",
            Self::Other(s) => s.as_str(),
        }
    }
}

/// Identity of a cache entry: method plus URL with the fragment removed.
///
/// Two requests with the same key address the same entry in a generation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
    method: Method,
    url: Url,
}

impl RequestKey {
    pub fn new(method: Method, mut url: Url) -> Self {
        url.set_fragment(None);
        Self { method, url }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

/// An outgoing request intercepted from a controlled page.
///
/// Cloning is cheap: the body is a reference-counted [`Bytes`] buffer.
///
/// # Examples
///
/// ```
/// use offline_router::http::{Destination, Request, RequestMode};
///
/// let req = Request::get("https://example.com/app/#top")
///     .unwrap()
///     .with_mode(RequestMode::Navigate);
///
/// assert!(req.is_navigation());
/// assert_eq!(req.destination(), &Destination::Empty);
/// assert_eq!(req.key().to_string(), "GET https://example.com/app/");
/// ```
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    url: Url,
    /// HTTP minor version: 0 for HTTP/1.0, 1 for HTTP/1.1.
    version: u8,
    headers: Headers,
    mode: RequestMode,
    destination: Destination,
    body: Bytes,
}

impl Request {
    /// Maximum number of headers we support per request.
    const MAX_HEADERS: usize = 64;

    /// Creates a request with no headers, no body and default mode/destination.
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            version: 1,
            headers: Headers::new(),
            mode: RequestMode::default(),
            destination: Destination::default(),
            body: Bytes::new(),
        }
    }

    /// Creates a `GET` request for an absolute URL.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::InvalidUrl`] if `url` is not an absolute URL.
    pub fn get(url: &str) -> Result<Self, RequestError> {
        Ok(Self::new(Method::Get, Url::parse(url)?))
    }

    #[must_use]
    pub fn with_mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub fn with_destination(mut self, destination: Destination) -> Self {
        self.destination = destination;
        self
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Parse a raw HTTP/1.1 proxy request from a byte slice.
    ///
    /// The request target may be absolute-form (`GET http://host/path`),
    /// origin-form with a `Host` header, or authority-form for `CONNECT`.
    /// Mode and destination are taken from `Sec-Fetch-Mode` / `Sec-Fetch-Dest`.
    ///
    /// Returns the parsed `Request` and the byte offset at which the body begins
    /// in `buf`. The body holds at most `Content-Length` bytes of what is
    /// already buffered.
    ///
    /// # Errors
    ///
    /// - [`RequestError::Incomplete`]: more data is needed to complete the request headers.
    /// - [`RequestError::Parse`]: the data is malformed and cannot be parsed.
    /// - [`RequestError::MissingField`]: method, target, version, or `Host` is absent.
    /// - [`RequestError::InvalidUrl`]: the target does not form a valid URL.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), RequestError> {
        let mut headers = [httparse::EMPTY_HEADER; Self::MAX_HEADERS];
        let mut raw_req = httparse::Request::new(&mut headers);

        let body_offset = match raw_req.parse(buf)? {
            httparse::Status::Complete(offset) => offset,
            httparse::Status::Partial => return Err(RequestError::Incomplete),
        };

        let method = Method::from_token(
            raw_req
                .method
                .ok_or(RequestError::MissingField { field: "method" })?,
        );

        let target = raw_req
            .path
            .ok_or(RequestError::MissingField { field: "path" })?;

        let version = raw_req
            .version
            .ok_or(RequestError::MissingField { field: "version" })?;

        let mut header_map = Headers::with_capacity(raw_req.headers.len());
        for header in raw_req.headers.iter() {
            if let Ok(value) = std::str::from_utf8(header.value) {
                header_map.insert(header.name, value);
            }
        }

        let url = resolve_target(&method, target, &header_map)?;

        let mode = header_map
            .get("sec-fetch-mode")
            .and_then(RequestMode::from_token)
            .unwrap_or_default();
        let destination = header_map
            .get("sec-fetch-dest")
            .map(Destination::from_token)
            .unwrap_or_default();

        let content_length = header_map
            .get("content-length")
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        let body_end = body_offset + content_length.min(buf.len() - body_offset);
        let body = Bytes::copy_from_slice(&buf[body_offset..body_end]);

        Ok((
            Self {
                method,
                url,
                version,
                headers: header_map,
                mode,
                destination,
                body,
            },
            body_offset,
        ))
    }

    /// Returns the HTTP method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Returns the absolute request URL.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Returns the HTTP minor version number (0 = HTTP/1.0, 1 = HTTP/1.1).
    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn mode(&self) -> RequestMode {
        self.mode
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Returns the cache identity of this request.
    pub fn key(&self) -> RequestKey {
        RequestKey::new(self.method.clone(), self.url.clone())
    }

    /// Returns `true` for a top-level page load: navigate mode or a document destination.
    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate || self.destination == Destination::Document
    }

    /// Returns `true` if the connection should be kept alive after this request.
    ///
    /// HTTP/1.1 defaults to keep-alive. HTTP/1.0 defaults to close unless
    /// `Connection: keep-alive` is explicitly set. Proxy clients often send
    /// `Proxy-Connection` instead, which is honored the same way.
    pub fn is_keep_alive(&self) -> bool {
        let conn = self
            .headers
            .get("connection")
            .or_else(|| self.headers.get("proxy-connection"));
        match conn {
            Some(conn) => conn.eq_ignore_ascii_case("keep-alive"),
            None => self.version == 1,
        }
    }

    /// Returns the value of the `Content-Length` header parsed as a `usize`, if present.
    pub fn content_length(&self) -> Option<usize> {
        self.headers.get("content-length")?.trim().parse().ok()
    }
}

// Turns a request-target into an absolute URL.
fn resolve_target(method: &Method, target: &str, headers: &Headers) -> Result<Url, RequestError> {
    if *method == Method::Connect {
        return Ok(Url::parse(&format!("https://{target}/"))?);
    }
    if target.starts_with('/') {
        let host = headers
            .get("host")
            .ok_or(RequestError::MissingField { field: "host" })?;
        return Ok(Url::parse(&format!("http://{host}{target}"))?);
    }
    Ok(Url::parse(target)?)
}
