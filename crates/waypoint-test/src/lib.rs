//! # Waypoint Test
//!
//! In-memory doubles for the outside capabilities of the offline worker:
//! a scripted [`Fetcher`] and a recording [`Notifier`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use waypoint_core::{Notification, Notifier, OfflineResult};
use waypoint_net::{Fetcher, NetError, Request, Response};

type Handler = Box<dyn Fn(&Request) -> Result<Response, NetError> + Send + Sync>;

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Build a plain response for `request`.
pub fn reply(request: &Request, status: u16, body: impl Into<Bytes>) -> Response {
    Response::new(
        request.url.clone(),
        StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        HeaderMap::new(),
        body.into(),
    )
}

/// A fetcher answering from a closure and recording every request.
pub struct ScriptedFetcher {
    handler: Mutex<Handler>,
    offline: AtomicBool,
    requests: Mutex<Vec<Request>>,
}

impl ScriptedFetcher {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&Request) -> Result<Response, NetError> + Send + Sync + 'static,
    {
        Self {
            handler: Mutex::new(Box::new(handler)),
            offline: AtomicBool::new(false),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// A fetcher that answers every request with `status` and `body`.
    pub fn always(status: u16, body: &'static str) -> Self {
        Self::new(move |request| Ok(reply(request, status, body)))
    }

    /// A fetcher with no network at all.
    pub fn unreachable() -> Self {
        Self::new(|_| Err(NetError::Offline))
    }

    pub fn set_handler<F>(&self, handler: F)
    where
        F: Fn(&Request) -> Result<Response, NetError> + Send + Sync + 'static,
    {
        *guard(&self.handler) = Box::new(handler);
    }

    /// While offline every request fails without reaching the handler.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Requests seen so far, including the ones that failed.
    pub fn requests(&self) -> Vec<Request> {
        guard(&self.requests).clone()
    }

    pub fn request_count(&self) -> usize {
        guard(&self.requests).len()
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        guard(&self.requests).push(request.clone());
        if self.offline.load(Ordering::SeqCst) {
            return Err(NetError::Offline);
        }
        let handler = guard(&self.handler);
        (*handler)(&request)
    }
}

/// A notifier that keeps what it was asked to show.
#[derive(Default)]
pub struct RecordingNotifier {
    shown: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shown(&self) -> Vec<Notification> {
        guard(&self.shown).clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn show(&self, notification: Notification) -> OfflineResult<()> {
        guard(&self.shown).push(notification);
        Ok(())
    }
}
