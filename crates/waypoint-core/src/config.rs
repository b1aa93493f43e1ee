//! Worker configuration

use crate::error::{OfflineError, OfflineResult};
use crate::types::QueueKind;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Offline worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Generation version; cache names are derived from it
    pub version: String,

    /// Directory holding the durable store and the cache storage
    pub data_dir: PathBuf,

    /// Origin the worker is registered for
    pub origin: Url,

    /// Path prefix of the REST API
    pub api_prefix: String,

    /// File suffixes treated as static assets
    pub static_suffixes: Vec<String>,

    /// Assets fetched at install time, relative to `origin`
    pub precache_manifest: Vec<String>,

    /// Endpoint receiving queued submissions
    pub submission_endpoint: String,

    /// Endpoint receiving queued progress updates
    pub progress_endpoint: String,

    /// Endpoint reporting the unread notification count
    pub notifications_endpoint: String,

    /// Connection-layer timeout in seconds
    pub connect_timeout_secs: Option<u64>,

    /// User agent for outgoing requests
    pub user_agent: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            version: "v1".to_string(),
            data_dir: dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("waypoint"),
            origin: Url::parse("http://localhost:3000/").expect("static origin is valid"),
            api_prefix: "/api/".to_string(),
            static_suffixes: [
                ".js", ".css", ".png", ".jpg", ".jpeg", ".gif", ".svg", ".webp", ".ico", ".woff",
                ".woff2", ".ttf", ".otf",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            precache_manifest: vec![
                "/".to_string(),
                "/index.html".to_string(),
                "/manifest.json".to_string(),
            ],
            submission_endpoint: "/api/submissions".to_string(),
            progress_endpoint: "/api/progress".to_string(),
            notifications_endpoint: "/api/notifications/unread-count".to_string(),
            connect_timeout_secs: Some(30),
            user_agent: format!("Waypoint-Offline/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl WorkerConfig {
    /// Load configuration from a JSON file; absent fields keep their defaults.
    pub fn load(path: &Path) -> OfflineResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: WorkerConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that every endpoint resolves against the origin.
    pub fn validate(&self) -> OfflineResult<()> {
        if self.version.trim().is_empty() {
            return Err(OfflineError::config("version must not be empty"));
        }
        if !self.api_prefix.starts_with('/') {
            return Err(OfflineError::config(format!(
                "api_prefix must start with '/': {}",
                self.api_prefix
            )));
        }
        for endpoint in [
            &self.submission_endpoint,
            &self.progress_endpoint,
            &self.notifications_endpoint,
        ] {
            self.resolve(endpoint)?;
        }
        for entry in &self.precache_manifest {
            self.resolve(entry)?;
        }
        Ok(())
    }

    /// Resolve a path or absolute URL against the origin.
    pub fn resolve(&self, path_or_url: &str) -> OfflineResult<Url> {
        Ok(self.origin.join(path_or_url)?)
    }

    /// Endpoint a queue drains to.
    pub fn endpoint_for(&self, kind: QueueKind) -> OfflineResult<Url> {
        match kind {
            QueueKind::Submission => self.resolve(&self.submission_endpoint),
            QueueKind::Progress => self.resolve(&self.progress_endpoint),
        }
    }

    /// Manifest entries as absolute URLs.
    pub fn manifest_urls(&self) -> OfflineResult<Vec<Url>> {
        self.precache_manifest
            .iter()
            .map(|entry| self.resolve(entry))
            .collect()
    }

    pub fn static_cache_name(&self) -> String {
        format!("static-{}", self.version)
    }

    pub fn runtime_cache_name(&self) -> String {
        format!("runtime-{}", self.version)
    }

    /// Cache names that survive activation of this generation.
    pub fn current_cache_names(&self) -> HashSet<String> {
        [self.static_cache_name(), self.runtime_cache_name()]
            .into_iter()
            .collect()
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_secs.map(Duration::from_secs)
    }

    pub fn durable_store_path(&self) -> PathBuf {
        self.data_dir.join("offline.sqlite3")
    }

    pub fn cache_storage_path(&self) -> PathBuf {
        self.data_dir.join("caches.sqlite3")
    }
}
