//! Request classification.
//!
//! Only GET requests over http(s) are intercepted. The rest pass straight
//! through to the network and never touch a cache.

use http::Method;
use tracing::trace;
use waypoint_core::WorkerConfig;
use waypoint_net::Request;

/// What kind of resource an intercepted request is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteClass {
    /// REST call under the API prefix.
    Api,
    /// Script, stylesheet, image or font.
    StaticAsset,
    /// Anything else, typically a page.
    Document,
}

/// Caching policy applied to a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    NetworkFirst,
    CacheFirst,
}

/// Which of the generation's caches a route reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSlot {
    Static,
    Runtime,
}

impl RouteClass {
    pub fn strategy(&self) -> Strategy {
        match self {
            RouteClass::StaticAsset => Strategy::CacheFirst,
            RouteClass::Api | RouteClass::Document => Strategy::NetworkFirst,
        }
    }

    pub fn cache_slot(&self) -> CacheSlot {
        match self {
            RouteClass::StaticAsset => CacheSlot::Static,
            RouteClass::Api | RouteClass::Document => CacheSlot::Runtime,
        }
    }

    /// Whether a navigation that misses both network and cache gets the
    /// offline document.
    pub fn offline_fallback(&self) -> bool {
        matches!(self, RouteClass::Document)
    }
}

/// Path-based request router.
#[derive(Debug, Clone)]
pub struct Router {
    api_prefix: String,
    static_suffixes: Vec<String>,
}

impl Router {
    pub fn new(api_prefix: impl Into<String>, static_suffixes: &[String]) -> Self {
        Self {
            api_prefix: api_prefix.into(),
            static_suffixes: static_suffixes
                .iter()
                .map(|s| s.to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn from_config(config: &WorkerConfig) -> Self {
        Self::new(config.api_prefix.clone(), &config.static_suffixes)
    }

    /// Classify a request, or `None` if it must not be intercepted.
    pub fn classify(&self, request: &Request) -> Option<RouteClass> {
        if request.method != Method::GET || !request.is_http() {
            trace!(url = %request.url, method = %request.method, "Passing request through");
            return None;
        }

        let path = request.url.path();
        let class = if path.starts_with(&self.api_prefix) {
            RouteClass::Api
        } else if self.is_static_asset(path) {
            RouteClass::StaticAsset
        } else {
            RouteClass::Document
        };

        trace!(url = %request.url, class = ?class, "Request classified");
        Some(class)
    }

    fn is_static_asset(&self, path: &str) -> bool {
        let path = path.to_ascii_lowercase();
        self.static_suffixes
            .iter()
            .any(|suffix| path.ends_with(suffix.as_str()))
    }
}
