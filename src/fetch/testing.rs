//! Scripted [`Fetch`] double for tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;

use super::{Fetch, FetchError};
use crate::http::{Request, Response, StatusCode};

#[derive(Debug, Clone)]
enum Reply {
    Respond(StatusCode, Bytes),
    Unreachable,
}

/// Answers from a fixed table. Unknown URLs get `404`; everything fails
/// while the double is offline.
#[derive(Debug)]
pub(crate) struct ScriptedFetch {
    replies: Mutex<HashMap<String, Reply>>,
    online: AtomicBool,
    calls: Mutex<Vec<String>>,
}

impl ScriptedFetch {
    pub(crate) fn new() -> Self {
        Self {
            replies: Mutex::new(HashMap::new()),
            online: AtomicBool::new(true),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn serve(&self, url: &str, status: StatusCode, body: &str) {
        self.replies.lock().unwrap().insert(
            url.to_owned(),
            Reply::Respond(status, Bytes::copy_from_slice(body.as_bytes())),
        );
    }

    pub(crate) fn fail(&self, url: &str) {
        self.replies
            .lock()
            .unwrap()
            .insert(url.to_owned(), Reply::Unreachable);
    }

    pub(crate) fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub(crate) fn calls_to(&self, url: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|u| *u == url).count()
    }
}

impl Fetch for ScriptedFetch {
    async fn fetch(&self, request: Request) -> Result<Response, FetchError> {
        let mut url = request.url().clone();
        url.set_fragment(None);
        let url = url.to_string();
        self.calls.lock().unwrap().push(url.clone());

        if !self.online.load(Ordering::SeqCst) {
            return Err(FetchError::Unreachable {
                url,
                reason: "offline".to_owned(),
            });
        }
        let reply = self.replies.lock().unwrap().get(&url).cloned();
        match reply {
            Some(Reply::Respond(status, body)) => Ok(Response::new(status)
                .body_bytes(body)
                .with_url(request.url().clone())),
            Some(Reply::Unreachable) => Err(FetchError::Unreachable {
                url,
                reason: "connection refused".to_owned(),
            }),
            None => Ok(Response::new(StatusCode::NOT_FOUND)),
        }
    }
}
