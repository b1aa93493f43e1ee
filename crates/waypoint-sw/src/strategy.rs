//! NetworkFirst and CacheFirst.
//!
//! Cache failures inside a strategy never fail the request: a lookup that
//! errors is a miss and a write that errors is skipped, both with a warning.

use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use tracing::{debug, warn};
use url::Url;
use waypoint_core::OfflineResult;
use waypoint_net::{Fetcher, Request, Response};
use waypoint_store::{Cache, CacheEntry};

use crate::lifetime::EventLifetime;

/// Document served to navigations that reach neither network nor cache.
pub const OFFLINE_DOCUMENT: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>Offline</title>
</head>
<body>
  <main>
    <h1>You are offline</h1>
    <p>This page has not been saved for offline use yet. Lessons you have
    opened before are still available, and your work will be sent once
    you are back online.</p>
  </main>
</body>
</html>
"#;

/// The synthesized offline document for `url`.
pub fn offline_document(url: Url) -> Response {
    Response::html(url, OFFLINE_DOCUMENT)
}

/// Snapshot a live response as a cache entry keyed by `request`.
pub fn to_entry(request: &Request, response: &Response) -> CacheEntry {
    CacheEntry {
        method: request.method.as_str().to_string(),
        url: request.url.to_string(),
        status: response.status.as_u16(),
        headers: response
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect(),
        body: response.body.to_vec(),
        cached_at: Utc::now().timestamp_millis(),
    }
}

/// Rebuild a response from a cache entry.
pub fn from_entry(entry: CacheEntry, request_url: &Url) -> Response {
    let url = Url::parse(&entry.url).unwrap_or_else(|_| request_url.clone());
    let status = StatusCode::from_u16(entry.status).unwrap_or(StatusCode::OK);

    let mut headers = HeaderMap::new();
    for (name, value) in &entry.headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.append(name, value);
        }
    }

    let mut response = Response::new(url, status, headers, Bytes::from(entry.body));
    response.from_cache = true;
    response
}

fn lookup(cache: Option<&Cache>, request: &Request) -> Option<Response> {
    let cache = cache?;
    match cache.match_request(request.method.as_str(), request.url.as_str()) {
        Ok(Some(entry)) => {
            debug!(cache = cache.name(), url = %request.url, "Cache hit");
            Some(from_entry(entry, &request.url))
        }
        Ok(None) => {
            debug!(cache = cache.name(), url = %request.url, "Cache miss");
            None
        }
        Err(e) => {
            warn!(cache = cache.name(), url = %request.url, error = %e, "Cache lookup failed");
            None
        }
    }
}

fn store(cache: &Cache, entry: &CacheEntry) {
    if let Err(e) = cache.put(entry) {
        warn!(cache = cache.name(), url = %entry.url, error = %e, "Cache write skipped");
    }
}

/// Network first, cache as fallback.
///
/// Successful responses are written to `cache` in the background. When the
/// network fails `cache` is consulted, then `precache`; a navigation with
/// nothing cached gets the offline document if `offline_fallback` is set.
pub async fn network_first(
    fetcher: &dyn Fetcher,
    cache: Option<Cache>,
    precache: Option<Cache>,
    request: Request,
    offline_fallback: bool,
    lifetime: &mut EventLifetime,
) -> OfflineResult<Response> {
    match fetcher.fetch(request.clone()).await {
        Ok(response) => {
            if response.is_cacheable() {
                if let Some(cache) = cache {
                    let entry = to_entry(&request, &response);
                    lifetime.wait_until(async move { store(&cache, &entry) });
                }
            }
            Ok(response)
        }
        Err(err) => {
            debug!(url = %request.url, error = %err, "Network failed, trying cache");
            let cached = lookup(cache.as_ref(), &request)
                .or_else(|| lookup(precache.as_ref(), &request));
            if let Some(cached) = cached {
                return Ok(cached);
            }
            if offline_fallback && request.is_navigation() {
                debug!(url = %request.url, "Serving offline document");
                return Ok(offline_document(request.url));
            }
            Err(err.into())
        }
    }
}

/// Cache first, revalidated in the background.
///
/// A hit is returned at once and refreshed from the network on the event
/// lifetime; refresh failures are only logged. A miss goes to the network
/// and a cacheable answer is stored before it is returned.
pub async fn cache_first(
    fetcher: Arc<dyn Fetcher>,
    cache: Option<Cache>,
    request: Request,
    lifetime: &mut EventLifetime,
) -> OfflineResult<Response> {
    if let Some(cached) = lookup(cache.as_ref(), &request) {
        if let Some(cache) = cache {
            lifetime.wait_until(revalidate(fetcher, cache, request));
        }
        return Ok(cached);
    }

    let response = fetcher.fetch(request.clone()).await?;
    if response.is_cacheable() {
        if let Some(cache) = &cache {
            store(cache, &to_entry(&request, &response));
        }
    }
    Ok(response)
}

async fn revalidate(fetcher: Arc<dyn Fetcher>, cache: Cache, request: Request) {
    match fetcher.fetch(request.clone()).await {
        Ok(response) if response.is_cacheable() => {
            store(&cache, &to_entry(&request, &response));
            debug!(cache = cache.name(), url = %request.url, "Revalidated");
        }
        Ok(response) => {
            debug!(url = %request.url, status = %response.status, "Revalidation not cacheable");
        }
        Err(e) => {
            debug!(url = %request.url, error = %e, "Revalidation failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use waypoint_test::{reply, ScriptedFetcher};
    use waypoint_net::{NetError, RequestMode, ResponseType};
    use waypoint_store::CacheStorage;

    fn runtime_cache() -> Cache {
        CacheStorage::in_memory()
            .unwrap()
            .open_cache("runtime-v1")
            .unwrap()
    }

    fn get(url: &str) -> Request {
        Request::get(Url::parse(url).unwrap())
    }

    #[tokio::test]
    async fn test_network_first_stores_in_background() {
        let fetcher = ScriptedFetcher::always(200, r#"{"courses":[]}"#);
        let cache = runtime_cache();
        let mut lifetime = EventLifetime::new("fetch");

        let response = network_first(
            &fetcher,
            Some(cache.clone()),
            None,
            get("https://learn.test/api/courses"),
            false,
            &mut lifetime,
        )
        .await
        .unwrap();
        assert!(!response.from_cache);
        assert_eq!(lifetime.pending(), 1);

        lifetime.settled().await;
        assert!(cache
            .match_request("GET", "https://learn.test/api/courses")
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_network_first_falls_back_to_cache() {
        let fetcher = ScriptedFetcher::always(200, "fresh");
        let cache = runtime_cache();

        let mut lifetime = EventLifetime::new("fetch");
        network_first(&fetcher, Some(cache.clone()), None, get("https://learn.test/api/me"), false, &mut lifetime)
            .await
            .unwrap();
        lifetime.settled().await;

        fetcher.set_offline(true);
        let mut lifetime = EventLifetime::new("fetch");
        let response = network_first(&fetcher, Some(cache), None, get("https://learn.test/api/me"), false, &mut lifetime)
            .await
            .unwrap();

        assert!(response.from_cache);
        assert_eq!(response.body, Bytes::from_static(b"fresh"));
    }

    #[tokio::test]
    async fn test_network_first_propagates_without_cache() {
        let fetcher = ScriptedFetcher::unreachable();
        let mut lifetime = EventLifetime::new("fetch");

        let err = network_first(
            &fetcher,
            Some(runtime_cache()),
            None,
            get("https://learn.test/api/me"),
            false,
            &mut lifetime,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, waypoint_core::OfflineError::NetworkFailure(_)));
    }

    #[tokio::test]
    async fn test_network_first_offline_document_only_for_navigations() {
        let fetcher = ScriptedFetcher::unreachable();
        let url = Url::parse("https://learn.test/courses/rust").unwrap();

        let mut lifetime = EventLifetime::new("fetch");
        let response = network_first(&fetcher, None, None, Request::navigate(url.clone()), true, &mut lifetime)
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert!(response.text().unwrap().contains("You are offline"));

        let mut lifetime = EventLifetime::new("fetch");
        let result = network_first(&fetcher, None, None, Request::get(url), true, &mut lifetime).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_network_first_consults_precache_after_runtime() {
        let storage = CacheStorage::in_memory().unwrap();
        let precache = storage.open_cache("static-v1").unwrap();
        let request = Request::navigate(Url::parse("https://learn.test/index.html").unwrap());
        let shell = reply(&request, 200, "<main>shell</main>");
        precache.put(&to_entry(&request, &shell)).unwrap();

        let fetcher = ScriptedFetcher::unreachable();
        let mut lifetime = EventLifetime::new("fetch");
        let response = network_first(
            &fetcher,
            Some(storage.open_cache("runtime-v1").unwrap()),
            Some(precache),
            request,
            true,
            &mut lifetime,
        )
        .await
        .unwrap();

        assert!(response.from_cache);
        assert_eq!(response.body, Bytes::from_static(b"<main>shell</main>"));
    }

    #[tokio::test]
    async fn test_network_first_returns_error_status_uncached() {
        let fetcher = ScriptedFetcher::always(500, "boom");
        let cache = runtime_cache();
        let mut lifetime = EventLifetime::new("fetch");

        let response = network_first(&fetcher, Some(cache.clone()), None, get("https://learn.test/api/me"), false, &mut lifetime)
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(lifetime.pending(), 0);
        assert!(cache.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_cache_first_miss_then_hit() {
        let fetcher = Arc::new(ScriptedFetcher::always(200, "body { color: teal }"));
        let cache = runtime_cache();

        let mut lifetime = EventLifetime::new("fetch");
        let first = cache_first(fetcher.clone(), Some(cache.clone()), get("https://learn.test/app.css"), &mut lifetime)
            .await
            .unwrap();
        assert!(!first.from_cache);
        assert_eq!(lifetime.pending(), 0);
        assert_eq!(cache.len().unwrap(), 1);

        fetcher.set_offline(true);
        let mut lifetime = EventLifetime::new("fetch");
        let second = cache_first(fetcher.clone(), Some(cache), get("https://learn.test/app.css"), &mut lifetime)
            .await
            .unwrap();
        assert!(second.from_cache);
        assert_eq!(second.body, first.body);

        // The failed refresh is swallowed.
        assert_eq!(lifetime.settled().await, 1);
    }

    #[tokio::test]
    async fn test_cache_first_revalidates_in_background() {
        let fetcher = Arc::new(ScriptedFetcher::always(200, "v1"));
        let cache = runtime_cache();

        let mut lifetime = EventLifetime::new("fetch");
        cache_first(fetcher.clone(), Some(cache.clone()), get("https://learn.test/app.js"), &mut lifetime)
            .await
            .unwrap();

        fetcher.set_handler(|request| Ok(reply(request, 200, "v2")));
        let mut lifetime = EventLifetime::new("fetch");
        let stale = cache_first(fetcher.clone(), Some(cache.clone()), get("https://learn.test/app.js"), &mut lifetime)
            .await
            .unwrap();
        assert_eq!(stale.body, Bytes::from_static(b"v1"));
        lifetime.settled().await;

        let refreshed = cache
            .match_request("GET", "https://learn.test/app.js")
            .unwrap()
            .unwrap();
        assert_eq!(refreshed.body, b"v2".to_vec());
    }

    #[tokio::test]
    async fn test_cache_first_skips_opaque_responses() {
        let fetcher = Arc::new(ScriptedFetcher::new(|request| {
            let mut response = reply(request, 200, "font");
            response.response_type = ResponseType::Opaque;
            Ok(response)
        }));
        let cache = runtime_cache();
        let request = get("https://cdn.test/inter.woff2").mode(RequestMode::NoCors);

        let mut lifetime = EventLifetime::new("fetch");
        let response = cache_first(fetcher, Some(cache.clone()), request, &mut lifetime)
            .await
            .unwrap();

        assert_eq!(response.response_type, ResponseType::Opaque);
        assert!(cache.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_cache_first_miss_offline_propagates() {
        let fetcher: Arc<dyn Fetcher> = Arc::new(ScriptedFetcher::new(|_| {
            Err(NetError::RequestFailed("connection reset".into()))
        }));
        let mut lifetime = EventLifetime::new("fetch");

        let result = cache_first(fetcher, Some(runtime_cache()), get("https://learn.test/app.js"), &mut lifetime).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_entry_round_trip_keeps_headers() {
        let request = get("https://learn.test/app.css#top");
        let mut response = reply(&request, 200, "css");
        response
            .headers
            .insert(http::header::CONTENT_TYPE, HeaderValue::from_static("text/css"));

        let entry = to_entry(&request, &response);
        assert_eq!(entry.status, 200);
        let restored = from_entry(entry, &request.url);

        assert!(restored.from_cache);
        assert_eq!(restored.content_type(), Some("text/css"));
        assert_eq!(restored.body, Bytes::from_static(b"css"));
    }
}
