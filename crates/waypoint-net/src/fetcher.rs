//! The fetch capability and its reqwest-backed implementation.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, info, trace};
use url::Url;
use waypoint_core::WorkerConfig;

use crate::{NetError, Request, RequestMode, Response, ResponseType};

/// Anything that can turn a request into a response.
///
/// A transport failure is an `Err`; an HTTP error status is still an `Ok`
/// response and it is up to the caller to decide what it means.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: Request) -> Result<Response, NetError>;
}

/// Loader configuration.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// User agent string.
    pub user_agent: String,
    /// Time allowed to establish a connection.
    pub connect_timeout: Option<Duration>,
    /// Total time allowed per request.
    pub request_timeout: Option<Duration>,
    /// Maximum redirects.
    pub max_redirects: usize,
    /// Origin the worker is registered for. Cross-origin responses are
    /// typed against it.
    pub origin: Option<Url>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            user_agent: concat!("Waypoint/", env!("CARGO_PKG_VERSION")).to_string(),
            connect_timeout: Some(Duration::from_secs(30)),
            request_timeout: None,
            max_redirects: 10,
            origin: None,
        }
    }
}

impl LoaderConfig {
    pub fn from_worker(config: &WorkerConfig) -> Self {
        Self {
            user_agent: config.user_agent.clone(),
            connect_timeout: config.connect_timeout(),
            origin: Some(config.origin.clone()),
            ..Self::default()
        }
    }

    /// Set the registration origin.
    pub fn origin(mut self, origin: Url) -> Self {
        self.origin = Some(origin);
        self
    }

    /// Set the per-request timeout.
    pub fn request_timeout(mut self, duration: Duration) -> Self {
        self.request_timeout = Some(duration);
        self
    }
}

/// Network fetcher on top of reqwest.
pub struct HttpFetcher {
    client: Client,
    config: LoaderConfig,
}

impl HttpFetcher {
    pub fn new(config: LoaderConfig) -> Result<Self, NetError> {
        let mut builder = Client::builder()
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects));
        if let Some(timeout) = config.connect_timeout {
            builder = builder.connect_timeout(timeout);
        }
        if let Some(timeout) = config.request_timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| NetError::RequestFailed(e.to_string()))?;

        info!(user_agent = %config.user_agent, "HttpFetcher initialized");

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    fn response_type(&self, request: &Request) -> ResponseType {
        let same_origin = self
            .config
            .origin
            .as_ref()
            .map_or(true, |origin| origin.origin() == request.url.origin());
        match (same_origin, request.mode) {
            (true, _) => ResponseType::Basic,
            (false, RequestMode::NoCors) => ResponseType::Opaque,
            (false, _) => ResponseType::Cors,
        }
    }

    fn map_error(&self, err: reqwest::Error) -> NetError {
        if err.is_timeout() {
            NetError::Timeout(
                self.config
                    .request_timeout
                    .or(self.config.connect_timeout)
                    .unwrap_or_default(),
            )
        } else if err.is_connect() {
            NetError::Offline
        } else {
            NetError::HttpError(err)
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        debug!(url = %request.url, method = %request.method, "Fetching resource");

        let response_type = self.response_type(&request);

        let mut req_builder = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone());
        if let Some(body) = request.body {
            req_builder = req_builder.body(body);
        }

        let response = req_builder.send().await.map_err(|e| self.map_error(e))?;

        let status = response.status();
        let headers = response.headers().clone();
        let url = response.url().clone();
        let body = response.bytes().await.map_err(|e| self.map_error(e))?;

        trace!(
            url = %url,
            status = %status,
            response_type = ?response_type,
            body_len = body.len(),
            "Response received"
        );

        Ok(Response {
            url,
            status,
            headers,
            body,
            response_type,
            from_cache: false,
        })
    }
}
