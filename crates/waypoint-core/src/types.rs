//! Common types shared by the store, the worker and the CLI

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::str::FromStr;

/// Reconnect tag that drains the submissions queue
pub const SYNC_SUBMISSIONS_TAG: &str = "sync-submissions";

/// Reconnect tag that drains the progress queue
pub const SYNC_PROGRESS_TAG: &str = "sync-progress";

/// Reconnect tag that polls the unread notification count
pub const CHECK_NOTIFICATIONS_TAG: &str = "check-notifications";

/// Category of a pending write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    Submission,
    Progress,
}

impl QueueKind {
    pub const ALL: [QueueKind; 2] = [QueueKind::Submission, QueueKind::Progress];

    /// Reconnect tag bound to this queue
    pub fn sync_tag(&self) -> &'static str {
        match self {
            QueueKind::Submission => SYNC_SUBMISSIONS_TAG,
            QueueKind::Progress => SYNC_PROGRESS_TAG,
        }
    }

    /// Resolve the queue a reconnect tag refers to
    pub fn from_sync_tag(tag: &str) -> Option<Self> {
        match tag {
            SYNC_SUBMISSIONS_TAG => Some(QueueKind::Submission),
            SYNC_PROGRESS_TAG => Some(QueueKind::Progress),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueKind::Submission => "submission",
            QueueKind::Progress => "progress",
        }
    }
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "submission" | "submissions" => Ok(QueueKind::Submission),
            "progress" => Ok(QueueKind::Progress),
            other => Err(format!("unknown queue kind: {}", other)),
        }
    }
}

/// A write that failed while offline and waits for the next reconnect
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
    /// Assigned at enqueue time, strictly increasing per queue
    pub id: i64,
    pub kind: QueueKind,
    /// Request body; its schema belongs to the server
    pub payload: JsonValue,
}

/// A lesson pushed by the host page for offline reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedLesson {
    pub id: String,
    pub payload: JsonValue,
}

impl CachedLesson {
    pub fn new(id: impl Into<String>, payload: JsonValue) -> Self {
        Self {
            id: id.into(),
            payload,
        }
    }
}
