//! Per-request event context handed from the host to the worker.

use crate::background::WaitUntil;
use crate::http::Request;

/// One intercepted request.
///
/// The worker answers the event by returning a response; any work it starts
/// that must outlive the response is registered on [`FetchEvent::lifetime`].
#[derive(Debug)]
pub struct FetchEvent {
    request: Request,
    lifetime: WaitUntil,
}

impl FetchEvent {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            lifetime: WaitUntil::new(),
        }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn lifetime(&self) -> &WaitUntil {
        &self.lifetime
    }

    /// Waits until every task registered on this event has finished.
    pub async fn settled(&self) {
        self.lifetime.settled().await;
    }
}
