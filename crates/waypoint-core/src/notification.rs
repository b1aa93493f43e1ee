//! Platform notification display.

use async_trait::async_trait;

use crate::OfflineResult;

/// A notification to show to the learner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub title: String,
    pub body: String,
    /// Replaces an earlier notification with the same tag.
    pub tag: String,
}

/// Shows notifications on the host platform.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn show(&self, notification: Notification) -> OfflineResult<()>;
}
