//! # Waypoint Net
//!
//! Request and response snapshots plus the fetch capability the offline
//! worker runs on.
//!
//! ## Design Goals
//!
//! 1. **Owned snapshots**: responses carry their full body, so cloning one
//!    for the cache is cheap (`Bytes`) and never consumes the live response
//! 2. **Pluggable network**: strategies talk to a [`Fetcher`], never to
//!    reqwest directly
//! 3. **Browser-shaped metadata**: request mode and response type decide
//!    what may be cached

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use serde_json::Value as JsonValue;
use thiserror::Error;
use url::Url;
use waypoint_core::OfflineError;

pub mod fetcher;

pub use fetcher::{Fetcher, HttpFetcher, LoaderConfig};

/// Errors that can occur in networking.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Network unreachable")]
    Offline,

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

impl From<NetError> for OfflineError {
    fn from(err: NetError) -> Self {
        OfflineError::network(err.to_string())
    }
}

/// Unique identifier for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

/// Request mode, as set by the page that issued the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    /// Top-level page navigation.
    Navigate,
    /// Same-origin subresource.
    #[default]
    SameOrigin,
    /// Cross-origin request with CORS.
    Cors,
    /// Cross-origin request without CORS; yields an opaque response.
    NoCors,
}

/// HTTP request.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub mode: RequestMode,
}

impl Request {
    /// Create a GET request.
    pub fn get(url: Url) -> Self {
        Self {
            id: RequestId::new(),
            url,
            method: Method::GET,
            headers: HeaderMap::new(),
            body: None,
            mode: RequestMode::SameOrigin,
        }
    }

    /// Create a page navigation.
    pub fn navigate(url: Url) -> Self {
        Self::get(url).mode(RequestMode::Navigate)
    }

    /// Create a POST request with a JSON body.
    pub fn post_json(url: Url, payload: &JsonValue) -> Result<Self, NetError> {
        let body =
            serde_json::to_vec(payload).map_err(|e| NetError::RequestFailed(e.to_string()))?;
        Ok(Self {
            id: RequestId::new(),
            url,
            method: Method::POST,
            headers: HeaderMap::new(),
            body: Some(Bytes::from(body)),
            mode: RequestMode::SameOrigin,
        }
        .header(CONTENT_TYPE, HeaderValue::from_static("application/json")))
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the request mode.
    pub fn mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
    }

    pub fn is_http(&self) -> bool {
        matches!(self.url.scheme(), "http" | "https")
    }
}

/// How much of a response the worker is allowed to see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseType {
    /// Same-origin response.
    #[default]
    Basic,
    /// Cross-origin response shared via CORS.
    Cors,
    /// Cross-origin response the worker cannot inspect.
    Opaque,
}

/// HTTP response snapshot.
#[derive(Clone)]
pub struct Response {
    pub url: Url,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub response_type: ResponseType,
    /// Whether this came out of a cache instead of the network.
    pub from_cache: bool,
}

impl Response {
    pub fn new(url: Url, status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            url,
            status,
            headers,
            body,
            response_type: ResponseType::Basic,
            from_cache: false,
        }
    }

    /// Create an HTML document response.
    pub fn html(url: Url, body: impl Into<Bytes>) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/html; charset=utf-8"),
        );
        Self::new(url, StatusCode::OK, headers, body.into())
    }

    /// Check if request was successful (2xx).
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    /// Only complete, inspectable 200 responses may be cached.
    pub fn is_cacheable(&self) -> bool {
        self.status == StatusCode::OK && self.response_type != ResponseType::Opaque
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok())
    }

    /// Get the body as text.
    pub fn text(&self) -> Result<String, NetError> {
        String::from_utf8(self.body.to_vec()).map_err(|e| NetError::RequestFailed(e.to_string()))
    }

    /// Get the body as JSON.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, NetError> {
        serde_json::from_slice(&self.body).map_err(|e| NetError::RequestFailed(e.to_string()))
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("url", &self.url.as_str())
            .field("status", &self.status)
            .field("response_type", &self.response_type)
            .field("from_cache", &self.from_cache)
            .field("body_len", &self.body.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder() {
        let url = Url::parse("https://learn.test/api/courses").unwrap();
        let request = Request::get(url.clone()).header(
            HeaderName::from_static("accept"),
            HeaderValue::from_static("application/json"),
        );

        assert_eq!(request.url, url);
        assert_eq!(request.method, Method::GET);
        assert!(request.headers.contains_key("accept"));
        assert!(!request.is_navigation());
    }

    #[test]
    fn test_post_json_sets_content_type() {
        let url = Url::parse("https://learn.test/api/progress").unwrap();
        let request = Request::post_json(url, &serde_json::json!({"lesson": "L1"})).unwrap();

        assert_eq!(request.method, Method::POST);
        assert_eq!(request.headers[CONTENT_TYPE], "application/json");
        assert_eq!(request.body.unwrap(), Bytes::from_static(br#"{"lesson":"L1"}"#));
    }

    #[test]
    fn test_request_id_uniqueness() {
        assert_ne!(RequestId::new(), RequestId::new());
    }

    #[test]
    fn test_is_http() {
        assert!(Request::get(Url::parse("https://learn.test/").unwrap()).is_http());
        assert!(!Request::get(Url::parse("chrome-extension://abc/x.js").unwrap()).is_http());
    }

    #[test]
    fn test_cacheability() {
        let url = Url::parse("https://cdn.test/font.woff2").unwrap();
        let mut response = Response::new(url, StatusCode::OK, HeaderMap::new(), Bytes::new());
        assert!(response.is_cacheable());

        response.response_type = ResponseType::Opaque;
        assert!(!response.is_cacheable());

        response.response_type = ResponseType::Cors;
        response.status = StatusCode::NOT_FOUND;
        assert!(!response.is_cacheable());
    }

    #[test]
    fn test_net_error_converts_to_network_failure() {
        let err: OfflineError = NetError::Offline.into();
        assert!(matches!(err, OfflineError::NetworkFailure(_)));
    }
}
