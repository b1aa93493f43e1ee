//! Replay of queued writes on reconnect.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};
use url::Url;
use waypoint_core::{OfflineError, OfflineResult, PendingOperation, QueueKind, WorkerConfig};
use waypoint_net::{Fetcher, Request};
use waypoint_store::DurableStore;

/// What a single drain pass did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub kind: QueueKind,
    /// Records read from the queue at the start of the pass.
    pub attempted: usize,
    /// Acknowledged by the server and removed.
    pub delivered: Vec<i64>,
    /// Kept for the next pass.
    pub failed: Vec<i64>,
}

impl SyncReport {
    fn empty(kind: QueueKind) -> Self {
        Self {
            kind,
            attempted: 0,
            delivered: Vec::new(),
            failed: Vec::new(),
        }
    }

    /// Whether every attempted record was delivered.
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Drains the durable queues against their endpoints.
pub struct SyncCoordinator {
    store: Arc<DurableStore>,
    fetcher: Arc<dyn Fetcher>,
    submission_endpoint: Url,
    progress_endpoint: Url,
}

impl SyncCoordinator {
    pub fn new(
        store: Arc<DurableStore>,
        fetcher: Arc<dyn Fetcher>,
        config: &WorkerConfig,
    ) -> OfflineResult<Self> {
        Ok(Self {
            store,
            fetcher,
            submission_endpoint: config.endpoint_for(QueueKind::Submission)?,
            progress_endpoint: config.endpoint_for(QueueKind::Progress)?,
        })
    }

    pub fn endpoint(&self, kind: QueueKind) -> &Url {
        match kind {
            QueueKind::Submission => &self.submission_endpoint,
            QueueKind::Progress => &self.progress_endpoint,
        }
    }

    /// Handle a reconnect tag. Tags that name no queue are ignored.
    pub async fn drain(&self, tag: &str) -> Option<SyncReport> {
        match QueueKind::from_sync_tag(tag) {
            Some(kind) => Some(self.drain_queue(kind).await),
            None => {
                debug!(tag, "Ignoring unknown sync tag");
                None
            }
        }
    }

    /// One pass over a queue, oldest record first.
    ///
    /// Each record is posted on its own and removed only when the server
    /// answers 2xx. Failures are kept and the pass moves on.
    pub async fn drain_queue(&self, kind: QueueKind) -> SyncReport {
        let mut report = SyncReport::empty(kind);

        let pending = match self.store.pending(kind) {
            Ok(pending) => pending,
            Err(e) => {
                warn!(queue = %kind, error = %e, "Queue unavailable, skipping sync");
                return report;
            }
        };
        report.attempted = pending.len();
        if pending.is_empty() {
            debug!(queue = %kind, "Nothing to sync");
            return report;
        }

        for operation in &pending {
            match self.deliver(operation).await {
                Ok(()) => {
                    if let Err(e) = self.store.remove_pending(kind, operation.id) {
                        warn!(queue = %kind, id = operation.id, error = %e, "Delivered record could not be removed");
                    }
                    report.delivered.push(operation.id);
                }
                Err(e) => {
                    warn!(queue = %kind, id = operation.id, error = %e, category = e.category(), "Record kept for next sync");
                    report.failed.push(operation.id);
                }
            }
        }

        info!(
            queue = %kind,
            attempted = report.attempted,
            delivered = report.delivered.len(),
            failed = report.failed.len(),
            "Sync pass finished"
        );
        report
    }

    async fn deliver(&self, operation: &PendingOperation) -> OfflineResult<()> {
        let drain_failure = |reason: String| OfflineError::SyncDrainFailure {
            id: operation.id,
            reason,
        };

        let request = Request::post_json(self.endpoint(operation.kind).clone(), &operation.payload)
            .map_err(|e| drain_failure(e.to_string()))?;
        let response = self
            .fetcher
            .fetch(request)
            .await
            .map_err(|e| drain_failure(e.to_string()))?;

        if !response.ok() {
            return Err(drain_failure(format!("server answered {}", response.status)));
        }
        debug!(id = operation.id, status = %response.status, "Record delivered");
        Ok(())
    }
}
