//! # Waypoint Offline Worker
//!
//! The request-intercepting background worker of the Waypoint learning
//! platform.
//!
//! ## Features
//!
//! - **Routing**: API calls network-first, static assets cache-first, pages
//!   network-first with an offline document
//! - **Generations**: versioned precache and runtime caches, stale ones
//!   evicted on activation
//! - **Sync**: queued submissions and progress replayed on reconnect
//! - **Lifecycle**: install, wait, activate, with a small command protocol
//!   for the host page
//!
//! ## Architecture
//!
//! ```text
//! OfflineWorker
//!     ├── LifecycleController (installing / waiting / active)
//!     ├── Router ── NetworkFirst / CacheFirst
//!     ├── CacheGenerationManager ── CacheStorage (static-vN, runtime-vN)
//!     ├── SyncCoordinator ── DurableStore (submissionsQueue, progressQueue)
//!     └── NotificationDispatcher ── Notifier
//! ```

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use waypoint_core::{
    OfflineError, OfflineResult, QueueKind, WorkerConfig, CHECK_NOTIFICATIONS_TAG,
};
use waypoint_net::{Fetcher, Request, Response};
use waypoint_store::{Cache, CacheStorage, DurableStore, StoreName};

pub mod bridge;
pub mod generations;
pub mod lifecycle;
pub mod lifetime;
pub mod notify;
pub mod router;
pub mod strategy;
pub mod sync;

pub use bridge::{CommandOutcome, HostCommand};
pub use generations::CacheGenerationManager;
pub use lifecycle::{
    ActivationReport, InstallProgress, LifecycleController, LifecycleEvent, ReloadGuard,
    WorkerGeneration, WorkerState,
};
pub use lifetime::{EventLifetime, EventOutcome};
pub use notify::{LogNotifier, NotificationDispatcher, UnreadSummary};
pub use router::{CacheSlot, RouteClass, Router, Strategy};
pub use sync::{SyncCoordinator, SyncReport};
pub use waypoint_core::{Notification, Notifier};

/// How an install ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum InstallOutcome {
    /// First generation: activated straight away.
    Activated(ActivationReport),
    /// Installed behind an active predecessor.
    Waiting { version: String },
    /// A newer install took over while this one was precaching.
    Superseded { version: String },
}

/// What a reconnect tag did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Drained(SyncReport),
    Polled(Option<Notification>),
    Ignored,
}

/// Snapshot of the worker for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub active: Option<String>,
    pub waiting: Option<String>,
    pub installing: Option<String>,
    pub caches: Vec<String>,
    pub pending_submissions: Option<usize>,
    pub pending_progress: Option<usize>,
    pub cached_lessons: Option<usize>,
}

/// The offline worker: one registration and its generations.
pub struct OfflineWorker {
    config: WorkerConfig,
    fetcher: Arc<dyn Fetcher>,
    store: Arc<DurableStore>,
    caches: CacheStorage,
    router: Router,
    sync: SyncCoordinator,
    notifications: NotificationDispatcher,
    lifecycle: Mutex<LifecycleController>,
}

impl OfflineWorker {
    /// Create a worker storing its data under `config.data_dir`.
    ///
    /// An unusable durable store only costs durability. If the cache
    /// database cannot be opened the worker runs on in-memory caches.
    pub fn new(
        config: WorkerConfig,
        fetcher: Arc<dyn Fetcher>,
        notifier: Arc<dyn Notifier>,
    ) -> OfflineResult<(Self, mpsc::UnboundedReceiver<LifecycleEvent>)> {
        let store = DurableStore::new(config.durable_store_path());
        if let Err(e) = store.open() {
            warn!(error = %e, "Durable store unavailable, continuing without durability");
        }

        let caches = match CacheStorage::open(config.cache_storage_path()) {
            Ok(caches) => caches,
            Err(e) => {
                warn!(error = %e, "Cache storage unavailable, using in-memory caches");
                CacheStorage::in_memory()?
            }
        };

        Self::with_stores(config, fetcher, notifier, store, caches)
    }

    /// Create a worker over in-memory stores.
    pub fn in_memory(
        config: WorkerConfig,
        fetcher: Arc<dyn Fetcher>,
        notifier: Arc<dyn Notifier>,
    ) -> OfflineResult<(Self, mpsc::UnboundedReceiver<LifecycleEvent>)> {
        Self::with_stores(
            config,
            fetcher,
            notifier,
            DurableStore::in_memory(),
            CacheStorage::in_memory()?,
        )
    }

    /// Create a worker over the given stores. The generation recorded as
    /// active by an earlier process is active again if its precache survived.
    pub fn with_stores(
        config: WorkerConfig,
        fetcher: Arc<dyn Fetcher>,
        notifier: Arc<dyn Notifier>,
        store: DurableStore,
        caches: CacheStorage,
    ) -> OfflineResult<(Self, mpsc::UnboundedReceiver<LifecycleEvent>)> {
        config.validate()?;

        let store = Arc::new(store);
        let sync = SyncCoordinator::new(Arc::clone(&store), Arc::clone(&fetcher), &config)?;
        let notifications = NotificationDispatcher::new(Arc::clone(&fetcher), notifier, &config)?;
        let (mut lifecycle, events) = LifecycleController::new();
        restore_registration(&caches, &config, &mut lifecycle);

        let worker = Self {
            router: Router::from_config(&config),
            config,
            fetcher,
            store,
            caches,
            sync,
            notifications,
            lifecycle: Mutex::new(lifecycle),
        };
        Ok((worker, events))
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn store(&self) -> &DurableStore {
        &self.store
    }

    pub fn caches(&self) -> &CacheStorage {
        &self.caches
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    fn generation(&self, version: &str) -> CacheGenerationManager {
        generation_for(&self.caches, &self.config, version)
    }

    pub async fn active_version(&self) -> Option<String> {
        self.lifecycle.lock().await.active_version().map(str::to_string)
    }

    // ==================== Lifecycle ====================

    /// Install the configured version.
    pub async fn handle_install(&self) -> OfflineResult<InstallOutcome> {
        let version = self.config.version.clone();
        self.install_version(&version).await
    }

    /// Install a newer version next to the current one.
    pub async fn handle_update(&self, version: &str) -> OfflineResult<InstallOutcome> {
        self.install_version(version).await
    }

    async fn install_version(&self, version: &str) -> OfflineResult<InstallOutcome> {
        let id = self.lifecycle.lock().await.begin_install(version);

        let generation = self.generation(version);
        let precached = match self.config.manifest_urls() {
            Ok(manifest) => generation.precache(self.fetcher.as_ref(), &manifest).await,
            Err(e) => Err(e),
        };
        if let Err(e) = precached {
            self.lifecycle.lock().await.install_failed(id, &e.to_string());
            return Err(e);
        }

        let mut lifecycle = self.lifecycle.lock().await;
        match lifecycle.install_complete(id) {
            InstallProgress::ActivateNow => match self.activate_waiting(&mut lifecycle) {
                Some(report) => Ok(InstallOutcome::Activated(report)),
                None => Err(OfflineError::install_abort(version, "generation vanished before activation")),
            },
            InstallProgress::Wait => Ok(InstallOutcome::Waiting {
                version: version.to_string(),
            }),
            InstallProgress::Superseded => Ok(InstallOutcome::Superseded {
                version: version.to_string(),
            }),
        }
    }

    /// Pick up the configured version after a restart, if a previous run
    /// already precached it. With nothing active it activates right away;
    /// behind an active generation it waits like a fresh install.
    pub async fn resume(&self) -> OfflineResult<Option<InstallOutcome>> {
        let version = self.config.version.clone();
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.active_version() == Some(version.as_str())
            || lifecycle.waiting_version() == Some(version.as_str())
        {
            return Ok(None);
        }
        if !self.generation(&version).is_precached()? {
            debug!(version = %version, "Nothing precached to resume");
            return Ok(None);
        }
        match lifecycle.adopt_installed(&version) {
            InstallProgress::ActivateNow => {
                Ok(self.activate_waiting(&mut lifecycle).map(InstallOutcome::Activated))
            }
            InstallProgress::Wait | InstallProgress::Superseded => {
                Ok(Some(InstallOutcome::Waiting { version }))
            }
        }
    }

    /// Activate the waiting generation now.
    pub async fn skip_waiting(&self) -> Option<ActivationReport> {
        let mut lifecycle = self.lifecycle.lock().await;
        self.activate_waiting(&mut lifecycle)
    }

    /// A page finished loading. Activates a waiting generation when no
    /// older page is still open.
    pub async fn page_load_cycle(&self) -> Option<ActivationReport> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.page_load_cycle() {
            self.activate_waiting(&mut lifecycle)
        } else {
            None
        }
    }

    pub async fn page_closed(&self) {
        self.lifecycle.lock().await.page_closed();
    }

    /// Host-side reload decision for a controller change.
    pub async fn observe_controller_change(&self) -> bool {
        self.lifecycle
            .lock()
            .await
            .reload_guard()
            .observe_controller_change()
    }

    fn activate_waiting(&self, lifecycle: &mut LifecycleController) -> Option<ActivationReport> {
        let version = lifecycle.begin_activation()?;
        let generation = self.generation(&version);

        let deleted_caches = match generation.cleanup_stale_caches(&generation.current_names()) {
            Ok(deleted) => deleted,
            Err(e) => {
                warn!(version = %version, error = %e, "Stale cache cleanup failed");
                Vec::new()
            }
        };
        self.notifications.reset();
        lifecycle.finish_activation();
        if let Err(e) = self.caches.record_activation(&version) {
            warn!(version = %version, error = %e, "Could not record activation");
        }

        Some(ActivationReport {
            version,
            deleted_caches,
        })
    }

    // ==================== Events ====================

    /// Intercept a request.
    ///
    /// The response is available right away; cache writes and
    /// revalidations it started are in the returned lifetime.
    pub async fn handle_fetch(&self, request: Request) -> EventOutcome<OfflineResult<Response>> {
        let mut lifetime = EventLifetime::new("fetch");
        let result = self.route(request, &mut lifetime).await;
        EventOutcome::new(result, lifetime)
    }

    async fn route(&self, request: Request, lifetime: &mut EventLifetime) -> OfflineResult<Response> {
        let Some(class) = self.router.classify(&request) else {
            return Ok(self.fetcher.fetch(request).await?);
        };
        let Some(version) = self.active_version().await else {
            debug!(url = %request.url, "No active generation, passing through");
            return Ok(self.fetcher.fetch(request).await?);
        };

        let generation = self.generation(&version);
        let cache = self.open_slot(&generation, class.cache_slot());
        debug!(url = %request.url, class = ?class, version = %version, "Routing request");

        match class.strategy() {
            Strategy::CacheFirst => {
                strategy::cache_first(Arc::clone(&self.fetcher), cache, request, lifetime).await
            }
            Strategy::NetworkFirst => {
                let precache = if class.offline_fallback() {
                    self.open_slot(&generation, CacheSlot::Static)
                } else {
                    None
                };
                strategy::network_first(
                    self.fetcher.as_ref(),
                    cache,
                    precache,
                    request,
                    class.offline_fallback(),
                    lifetime,
                )
                .await
            }
        }
    }

    fn open_slot(&self, generation: &CacheGenerationManager, slot: CacheSlot) -> Option<Cache> {
        let opened = match slot {
            CacheSlot::Static => generation.static_cache(),
            CacheSlot::Runtime => generation.runtime_cache(),
        };
        opened
            .map_err(|e| warn!(slot = ?slot, error = %e, "Cache unavailable, going without"))
            .ok()
    }

    /// Handle a reconnect tag.
    pub async fn handle_sync(&self, tag: &str) -> SyncOutcome {
        if tag == CHECK_NOTIFICATIONS_TAG {
            return SyncOutcome::Polled(self.notifications.poll().await);
        }
        match self.sync.drain(tag).await {
            Some(report) => SyncOutcome::Drained(report),
            None => SyncOutcome::Ignored,
        }
    }

    /// Handle a message posted by the host page.
    pub async fn handle_message(&self, message: &JsonValue) -> CommandOutcome {
        let Some(command) = HostCommand::from_value(message) else {
            return CommandOutcome::Ignored;
        };
        match command {
            HostCommand::SkipWaiting => match self.skip_waiting().await {
                Some(report) => CommandOutcome::Activated(report),
                None => CommandOutcome::NothingWaiting,
            },
            HostCommand::CacheLessons { lessons } => match self.store.upsert_lessons(&lessons) {
                Ok(count) => {
                    info!(count, "Lessons cached");
                    CommandOutcome::LessonsCached { count }
                }
                Err(e) => {
                    warn!(error = %e, "Could not cache lessons");
                    CommandOutcome::StorageUnavailable
                }
            },
        }
    }

    // ==================== Diagnostics ====================

    pub async fn status(&self) -> WorkerStatus {
        let (active, waiting, installing) = {
            let lifecycle = self.lifecycle.lock().await;
            (
                lifecycle.active_version().map(str::to_string),
                lifecycle.waiting_version().map(str::to_string),
                lifecycle.installing_version().map(str::to_string),
            )
        };
        let caches = self.caches.keys().unwrap_or_else(|e| {
            warn!(error = %e, "Cannot list caches");
            Vec::new()
        });

        WorkerStatus {
            active,
            waiting,
            installing,
            caches,
            pending_submissions: self.store.count(StoreName::for_queue(QueueKind::Submission)).ok(),
            pending_progress: self.store.count(StoreName::for_queue(QueueKind::Progress)).ok(),
            cached_lessons: self.store.count(StoreName::LessonCache).ok(),
        }
    }
}

fn generation_for(
    caches: &CacheStorage,
    config: &WorkerConfig,
    version: &str,
) -> CacheGenerationManager {
    let config = WorkerConfig {
        version: version.to_string(),
        ..config.clone()
    };
    CacheGenerationManager::new(caches.clone(), &config)
}

/// Reinstate the generation an earlier process recorded as active.
fn restore_registration(
    caches: &CacheStorage,
    config: &WorkerConfig,
    lifecycle: &mut LifecycleController,
) {
    let version = match caches.active_generation() {
        Ok(Some(version)) => version,
        Ok(None) => return,
        Err(e) => {
            warn!(error = %e, "Cannot read registration, starting without an active generation");
            return;
        }
    };
    match generation_for(caches, config, &version).is_precached() {
        Ok(true) => lifecycle.restore_active(&version),
        Ok(false) => warn!(
            version = %version,
            "Recorded generation lost its precache, not restoring"
        ),
        Err(e) => warn!(version = %version, error = %e, "Cannot inspect recorded generation"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;
    use waypoint_test::{RecordingNotifier, ScriptedFetcher};

    fn config() -> WorkerConfig {
        WorkerConfig {
            origin: Url::parse("https://learn.test/").unwrap(),
            ..WorkerConfig::default()
        }
    }

    fn worker(fetcher: Arc<ScriptedFetcher>) -> OfflineWorker {
        OfflineWorker::in_memory(config(), fetcher, Arc::new(RecordingNotifier::new()))
            .unwrap()
            .0
    }

    #[tokio::test]
    async fn test_fetch_passes_through_before_activation() {
        let fetcher = Arc::new(ScriptedFetcher::always(200, "body"));
        let worker = worker(fetcher.clone());
        let url = Url::parse("https://learn.test/app.js").unwrap();

        let response = worker.handle_fetch(Request::get(url)).await.settle().await.unwrap();

        assert!(!response.from_cache);
        assert!(worker.caches().keys().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_status_reports_queues() {
        let fetcher = Arc::new(ScriptedFetcher::always(200, "ok"));
        let worker = worker(fetcher);
        worker
            .store()
            .enqueue(QueueKind::Progress, &serde_json::json!({"step": 1}))
            .unwrap();

        worker.handle_install().await.unwrap();
        let status = worker.status().await;

        assert_eq!(status.active.as_deref(), Some("v1"));
        assert_eq!(status.pending_progress, Some(1));
        assert_eq!(status.pending_submissions, Some(0));
        assert_eq!(status.cached_lessons, Some(0));
        assert_eq!(status.caches, vec!["static-v1".to_string()]);
    }

    fn worker_over(
        caches: &CacheStorage,
        version: &str,
        fetcher: Arc<ScriptedFetcher>,
    ) -> OfflineWorker {
        let config = WorkerConfig {
            version: version.to_string(),
            ..config()
        };
        OfflineWorker::with_stores(
            config,
            fetcher,
            Arc::new(RecordingNotifier::new()),
            DurableStore::in_memory(),
            caches.clone(),
        )
        .unwrap()
        .0
    }

    #[tokio::test]
    async fn test_resume_adopts_precached_generation() {
        let fetcher = Arc::new(ScriptedFetcher::always(200, "ok"));
        let caches = CacheStorage::in_memory().unwrap();
        generation_for(&caches, &config(), "v1")
            .precache(fetcher.as_ref(), &config().manifest_urls().unwrap())
            .await
            .unwrap();

        let worker = worker_over(&caches, "v1", fetcher);
        assert!(worker.active_version().await.is_none());

        let Some(InstallOutcome::Activated(report)) = worker.resume().await.unwrap() else {
            panic!("nothing active, the precached generation should activate");
        };
        assert_eq!(report.version, "v1");
        assert_eq!(worker.active_version().await.as_deref(), Some("v1"));
        assert_eq!(caches.active_generation().unwrap().as_deref(), Some("v1"));
        assert!(worker.resume().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_restart_keeps_previous_generation_active() {
        let fetcher = Arc::new(ScriptedFetcher::always(200, "ok"));
        let caches = CacheStorage::in_memory().unwrap();
        worker_over(&caches, "v1", fetcher.clone())
            .handle_install()
            .await
            .unwrap();

        let updated = worker_over(&caches, "v2", fetcher.clone());
        assert_eq!(updated.active_version().await.as_deref(), Some("v1"));
        assert!(updated.resume().await.unwrap().is_none());

        let outcome = updated.handle_install().await.unwrap();
        assert_eq!(outcome, InstallOutcome::Waiting { version: "v2".into() });
        assert_eq!(updated.active_version().await.as_deref(), Some("v1"));
        assert!(caches.has("static-v1").unwrap());

        // Another restart: v2 is precached but only v1 was ever activated.
        let restarted = worker_over(&caches, "v2", fetcher);
        assert_eq!(restarted.active_version().await.as_deref(), Some("v1"));
        assert_eq!(
            restarted.resume().await.unwrap(),
            Some(InstallOutcome::Waiting { version: "v2".into() })
        );

        let report = restarted.skip_waiting().await.unwrap();
        assert_eq!(report.deleted_caches, vec!["static-v1".to_string()]);
        assert_eq!(caches.active_generation().unwrap().as_deref(), Some("v2"));
    }

    #[tokio::test]
    async fn test_recorded_generation_without_precache_is_not_restored() {
        let caches = CacheStorage::in_memory().unwrap();
        caches.record_activation("v1").unwrap();

        let worker = worker_over(&caches, "v1", Arc::new(ScriptedFetcher::always(200, "ok")));
        assert!(worker.active_version().await.is_none());
    }

    #[tokio::test]
    async fn test_resume_without_precache() {
        let worker = worker(Arc::new(ScriptedFetcher::always(200, "ok")));
        assert!(worker.resume().await.unwrap().is_none());
        assert!(worker.active_version().await.is_none());
    }

    #[tokio::test]
    async fn test_notification_tag_polls() {
        let fetcher = Arc::new(ScriptedFetcher::always(200, r#"{"unreadCount": 2}"#));
        let worker = worker(fetcher);

        match worker.handle_sync(CHECK_NOTIFICATIONS_TAG).await {
            SyncOutcome::Polled(Some(notification)) => {
                assert_eq!(notification.body, "You have 2 unread notifications")
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(worker.handle_sync("sync-unknown").await, SyncOutcome::Ignored);
    }
}
