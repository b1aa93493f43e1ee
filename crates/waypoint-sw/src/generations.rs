//! Versioned response caches.
//!
//! Each worker version owns `static-<version>` (filled at install) and
//! `runtime-<version>` (filled while serving). Activation removes every
//! cache outside the new version's set.

use std::collections::HashSet;

use futures::future::try_join_all;
use tracing::{debug, info, warn};
use url::Url;
use waypoint_core::{OfflineError, OfflineResult, WorkerConfig};
use waypoint_net::{Fetcher, Request};
use waypoint_store::{Cache, CacheStorage};

use crate::strategy::to_entry;

/// The caches belonging to one worker version.
#[derive(Debug, Clone)]
pub struct CacheGenerationManager {
    storage: CacheStorage,
    version: String,
    static_name: String,
    runtime_name: String,
}

impl CacheGenerationManager {
    pub fn new(storage: CacheStorage, config: &WorkerConfig) -> Self {
        Self {
            storage,
            version: config.version.clone(),
            static_name: config.static_cache_name(),
            runtime_name: config.runtime_cache_name(),
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn static_cache_name(&self) -> &str {
        &self.static_name
    }

    pub fn runtime_cache_name(&self) -> &str {
        &self.runtime_name
    }

    /// Names this generation keeps at activation.
    pub fn current_names(&self) -> HashSet<String> {
        [self.static_name.clone(), self.runtime_name.clone()]
            .into_iter()
            .collect()
    }

    pub fn static_cache(&self) -> OfflineResult<Cache> {
        self.storage.open_cache(&self.static_name)
    }

    pub fn runtime_cache(&self) -> OfflineResult<Cache> {
        self.storage.open_cache(&self.runtime_name)
    }

    /// Whether a previous install already filled the static cache.
    pub fn is_precached(&self) -> OfflineResult<bool> {
        if !self.storage.has(&self.static_name)? {
            return Ok(false);
        }
        Ok(!self.static_cache()?.is_empty()?)
    }

    /// Fetch every manifest entry and store them in the static cache.
    ///
    /// All-or-nothing: if any entry fails to fetch or is not cacheable,
    /// nothing is written and `InstallAbort` names the offending URL.
    pub async fn precache(&self, fetcher: &dyn Fetcher, manifest: &[Url]) -> OfflineResult<usize> {
        info!(version = %self.version, entries = manifest.len(), "Precaching");

        let entries = try_join_all(manifest.iter().map(|url| async move {
            let request = Request::get(url.clone());
            let response = fetcher
                .fetch(request.clone())
                .await
                .map_err(|e| OfflineError::install_abort(url.as_str(), e.to_string()))?;
            if !response.is_cacheable() {
                return Err(OfflineError::install_abort(
                    url.as_str(),
                    format!("response is not cacheable (status {})", response.status),
                ));
            }
            debug!(url = %url, bytes = response.body.len(), "Precache entry fetched");
            Ok(to_entry(&request, &response))
        }))
        .await?;

        let stored = self.static_cache()?.put_all(&entries)?;
        info!(version = %self.version, stored, cache = %self.static_name, "Precache complete");
        Ok(stored)
    }

    /// Delete every persisted cache whose name is not in `keep`.
    pub fn cleanup_stale_caches(&self, keep: &HashSet<String>) -> OfflineResult<Vec<String>> {
        let mut deleted = Vec::new();
        for name in self.storage.keys()? {
            if keep.contains(&name) {
                continue;
            }
            if self.storage.delete(&name)? {
                info!(cache = %name, "Deleted stale cache");
                deleted.push(name);
            } else {
                warn!(cache = %name, "Stale cache vanished before deletion");
            }
        }
        Ok(deleted)
    }
}
