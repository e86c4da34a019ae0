//! Forward HTTP proxy that hosts a [`Worker`].
//!
//! Accepts TCP connections, parses HTTP/1.1 proxy requests, and dispatches each
//! one to the worker as a [`FetchEvent`]. Persistent connections (keep-alive)
//! are supported. Requests the worker cannot resolve are reported to the
//! client as `502 Bad Gateway`, which a browser surfaces as a network error.
//! `CONNECT` tunnels are not supported.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::cache::CacheStorage;
use crate::context::FetchEvent;
use crate::fetch::Fetch;
use crate::http::{
    Method, StatusCode,
    request::{Request, RequestError},
    response::Response,
};
use crate::lifecycle::Worker;

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Maximum size of a complete HTTP request we will buffer before rejecting it (8 MiB).
const MAX_REQUEST_SIZE: usize = 8 * 1024 * 1024;

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 4096;

/// The proxy front end.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use offline_router::{Server, Worker, WorkerConfig};
/// use offline_router::cache::MemoryCacheStorage;
/// use offline_router::fetch::HttpFetcher;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let worker = Worker::new(
///         WorkerConfig::default(),
///         Arc::new(MemoryCacheStorage::new()),
///         Arc::new(HttpFetcher::new()?),
///     )?;
///     worker.start().await?;
///
///     let server = Server::bind("127.0.0.1:3128").await?;
///     server.run(Arc::new(worker)).await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Server {
    /// Binds the server to the given TCP address.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound
    /// (e.g. port already in use, insufficient permissions).
    pub async fn bind(addr: impl AsRef<str>) -> Result<Self, ServerError> {
        let addr = addr.as_ref();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.to_owned(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Starts accepting connections and dispatching requests to `worker`.
    ///
    /// Runs until the process is terminated or an unrecoverable listener
    /// error occurs.
    pub async fn run<S, F>(self, worker: Arc<Worker<S, F>>) -> Result<(), ServerError>
    where
        S: CacheStorage,
        F: Fetch,
    {
        info!(address = %self.local_addr, generation = %worker.config().cache_name, "proxy listening");

        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                    continue;
                }
            };

            debug!(peer = %peer_addr, "connection accepted");
            let worker = Arc::clone(&worker);

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer_addr, worker).await {
                    warn!(peer = %peer_addr, error = %e, "connection closed with error");
                }
            });
        }
    }
}

/// Produces the response for one parsed request.
async fn respond<S, F>(worker: &Worker<S, F>, request: Request) -> Response
where
    S: CacheStorage,
    F: Fetch,
{
    if *request.method() == Method::Connect {
        return Response::new(StatusCode::NOT_IMPLEMENTED)
            .header("Content-Type", "text/plain; charset=utf-8")
            .body("CONNECT tunnels are not supported");
    }

    let event = FetchEvent::new(request);
    let response = match worker.handle_fetch(&event).await {
        Ok(response) => response,
        Err(e) => Response::new(StatusCode::BAD_GATEWAY)
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(e.to_string()),
    };

    // Cache writes already run on their own tasks; this only reports when the
    // event as a whole is finished, without holding up the response.
    let pending = event.lifetime().pending();
    if pending > 0 {
        let lifetime = event.lifetime().clone();
        let url = event.request().url().clone();
        tokio::spawn(async move {
            lifetime.settled().await;
            debug!(url = %url, tasks = pending, "fetch event settled");
        });
    }

    response
}

/// Handles a single TCP connection over its lifetime.
///
/// HTTP/1.1 connections are persistent by default: we loop, reading one
/// request per iteration, until the peer closes the connection or signals
/// `Connection: close`.
async fn handle_connection<S, F>(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    worker: Arc<Worker<S, F>>,
) -> Result<(), std::io::Error>
where
    S: CacheStorage,
    F: Fetch,
{
    let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);

    loop {
        // Only read when the buffer holds no complete request yet.
        let (request, body_offset) = match Request::parse(&buf) {
            Ok(pair) => pair,
            Err(RequestError::Incomplete) => {
                if buf.len() > MAX_REQUEST_SIZE {
                    warn!(peer = %peer_addr, "request too large, sending 413");
                    let response = Response::new(StatusCode::PAYLOAD_TOO_LARGE)
                        .body("Request entity too large")
                        .keep_alive(false);
                    stream.write_all(&response.into_bytes()).await?;
                    break;
                }
                if stream.read_buf(&mut buf).await? == 0 {
                    debug!(peer = %peer_addr, "connection closed by peer");
                    break;
                }
                continue;
            }
            Err(e) => {
                warn!(peer = %peer_addr, error = %e, "bad request, sending 400");
                let response = Response::new(StatusCode::BAD_REQUEST)
                    .body(format!("Bad Request: {e}"))
                    .keep_alive(false);
                stream.write_all(&response.into_bytes()).await?;
                break;
            }
        };

        // Wait for the full body to arrive if Content-Length is set.
        let total_needed = body_offset + request.content_length().unwrap_or(0);
        if total_needed > MAX_REQUEST_SIZE {
            let response = Response::new(StatusCode::PAYLOAD_TOO_LARGE)
                .body("Request entity too large")
                .keep_alive(false);
            stream.write_all(&response.into_bytes()).await?;
            break;
        }
        if buf.len() < total_needed {
            if stream.read_buf(&mut buf).await? == 0 {
                debug!(peer = %peer_addr, "connection closed mid-body");
                break;
            }
            continue;
        }

        let keep_alive = request.is_keep_alive();

        debug!(
            peer = %peer_addr,
            method = %request.method(),
            url = %request.url(),
            mode = request.mode().as_str(),
            destination = request.destination().as_str(),
            "dispatching request"
        );

        let response = respond(&worker, request).await.keep_alive(keep_alive);
        stream.write_all(&response.into_bytes()).await?;
        stream.flush().await?;

        // Drop the consumed request bytes from the buffer.
        let _ = buf.split_to(total_needed);

        if !keep_alive {
            debug!(peer = %peer_addr, "Connection: close, shutting down");
            break;
        }
    }

    Ok(())
}
