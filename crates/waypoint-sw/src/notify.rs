//! Unread-notification polling.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, warn};
use url::Url;
use waypoint_core::{
    Notification, Notifier, OfflineResult, WorkerConfig, CHECK_NOTIFICATIONS_TAG,
};
use waypoint_net::{Fetcher, Request};

/// Body of the unread-count endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnreadSummary {
    pub unread_count: u64,
    #[serde(default)]
    pub latest_title: Option<String>,
}

fn notification_for(summary: &UnreadSummary) -> Notification {
    let title = summary
        .latest_title
        .clone()
        .unwrap_or_else(|| "New notifications".to_string());
    let body = match summary.unread_count {
        1 => "You have 1 unread notification".to_string(),
        n => format!("You have {} unread notifications", n),
    };
    Notification {
        title,
        body,
        tag: CHECK_NOTIFICATIONS_TAG.to_string(),
    }
}

/// A notifier that writes notifications to the log.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn show(&self, notification: Notification) -> OfflineResult<()> {
        info!(title = %notification.title, body = %notification.body, "Notification");
        Ok(())
    }
}

/// Polls the unread count and shows at most one notification per poll.
pub struct NotificationDispatcher {
    fetcher: Arc<dyn Fetcher>,
    notifier: Arc<dyn Notifier>,
    endpoint: Url,
    previous: AtomicU64,
}

impl NotificationDispatcher {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        notifier: Arc<dyn Notifier>,
        config: &WorkerConfig,
    ) -> OfflineResult<Self> {
        Ok(Self {
            fetcher,
            notifier,
            endpoint: config.resolve(&config.notifications_endpoint)?,
            previous: AtomicU64::new(0),
        })
    }

    /// Count seen by the last successful poll.
    pub fn previous_count(&self) -> u64 {
        self.previous.load(Ordering::SeqCst)
    }

    /// Forget the last count, so the next non-zero poll notifies.
    pub fn reset(&self) {
        self.previous.store(0, Ordering::SeqCst);
    }

    /// Poll once. Returns the notification shown, if any.
    ///
    /// Failures are logged and otherwise ignored; the previous count only
    /// moves on a successful poll.
    pub async fn poll(&self) -> Option<Notification> {
        let summary = self.fetch_summary().await?;
        let previous = self.previous.swap(summary.unread_count, Ordering::SeqCst);

        if summary.unread_count <= previous {
            debug!(unread = summary.unread_count, previous, "No new notifications");
            return None;
        }

        let notification = notification_for(&summary);
        if let Err(e) = self.notifier.show(notification.clone()).await {
            warn!(error = %e, "Failed to show notification");
            return None;
        }
        info!(unread = summary.unread_count, previous, "Notification shown");
        Some(notification)
    }

    async fn fetch_summary(&self) -> Option<UnreadSummary> {
        let response = match self.fetcher.fetch(Request::get(self.endpoint.clone())).await {
            Ok(response) => response,
            Err(e) => {
                debug!(error = %e, "Notification poll failed");
                return None;
            }
        };
        if !response.ok() {
            debug!(status = %response.status, "Notification poll rejected");
            return None;
        }
        match response.json::<UnreadSummary>() {
            Ok(summary) => Some(summary),
            Err(e) => {
                warn!(error = %e, "Malformed unread summary");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use waypoint_test::{reply, RecordingNotifier, ScriptedFetcher};
    use std::sync::Mutex;

    fn dispatcher(
        counts: Arc<Mutex<u64>>,
    ) -> (NotificationDispatcher, Arc<RecordingNotifier>, Arc<ScriptedFetcher>) {
        let fetcher = Arc::new(ScriptedFetcher::new(move |request| {
            let n = *counts.lock().unwrap();
            let body = format!(r#"{{"unreadCount": {n}, "latestTitle": "Quiz graded"}}"#);
            Ok(reply(request, 200, body))
        }));
        let notifier = Arc::new(RecordingNotifier::new());
        let config = WorkerConfig {
            origin: Url::parse("https://learn.test/").unwrap(),
            ..WorkerConfig::default()
        };
        let dispatcher = NotificationDispatcher::new(fetcher.clone(), notifier.clone(), &config).unwrap();
        (dispatcher, notifier, fetcher)
    }

    #[test]
    fn test_summary_parsing() {
        let summary: UnreadSummary = serde_json::from_str(r#"{"unreadCount": 4}"#).unwrap();
        assert_eq!(summary.unread_count, 4);
        assert_eq!(summary.latest_title, None);
    }

    #[tokio::test]
    async fn test_one_notification_per_poll() {
        let counts = Arc::new(Mutex::new(5));
        let (dispatcher, notifier, fetcher) = dispatcher(counts.clone());

        let shown = dispatcher.poll().await.unwrap();
        assert_eq!(shown.title, "Quiz graded");
        assert_eq!(shown.body, "You have 5 unread notifications");
        assert_eq!(notifier.shown().len(), 1);
        assert_eq!(
            fetcher.requests()[0].url.as_str(),
            "https://learn.test/api/notifications/unread-count"
        );

        // Same count: nothing new.
        assert!(dispatcher.poll().await.is_none());

        *counts.lock().unwrap() = 9;
        assert!(dispatcher.poll().await.is_some());
        assert_eq!(notifier.shown().len(), 2);
    }

    #[tokio::test]
    async fn test_count_going_down_is_tracked() {
        let counts = Arc::new(Mutex::new(3));
        let (dispatcher, notifier, _) = dispatcher(counts.clone());

        dispatcher.poll().await;
        *counts.lock().unwrap() = 1;
        assert!(dispatcher.poll().await.is_none());
        assert_eq!(dispatcher.previous_count(), 1);

        *counts.lock().unwrap() = 2;
        assert!(dispatcher.poll().await.is_some());
        assert_eq!(notifier.shown().len(), 2);
    }

    #[tokio::test]
    async fn test_reset_rearms_notification() {
        let counts = Arc::new(Mutex::new(2));
        let (dispatcher, notifier, _) = dispatcher(counts);

        dispatcher.poll().await;
        dispatcher.reset();
        assert_eq!(dispatcher.previous_count(), 0);
        dispatcher.poll().await;

        assert_eq!(notifier.shown().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_poll_keeps_previous_count() {
        let counts = Arc::new(Mutex::new(2));
        let (dispatcher, notifier, fetcher) = dispatcher(counts);

        dispatcher.poll().await;
        fetcher.set_offline(true);
        assert!(dispatcher.poll().await.is_none());
        assert_eq!(dispatcher.previous_count(), 2);
        assert_eq!(notifier.shown().len(), 1);
    }
}
