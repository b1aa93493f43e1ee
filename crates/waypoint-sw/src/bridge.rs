//! Commands posted by the host page.
//!
//! Wire format is JSON tagged by `type`:
//!
//! ```json
//! {"type": "SKIP_WAITING"}
//! {"type": "CACHE_LESSONS", "lessons": [{"id": "L1", "payload": {}}]}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::debug;
use waypoint_core::CachedLesson;

use crate::lifecycle::ActivationReport;

/// A command from the host page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HostCommand {
    /// Activate the waiting generation now.
    SkipWaiting,
    /// Store lessons for offline reading.
    CacheLessons { lessons: Vec<CachedLesson> },
}

impl HostCommand {
    /// Parse a posted message. Anything unrecognized yields `None`.
    pub fn from_value(message: &JsonValue) -> Option<Self> {
        match serde_json::from_value(message.clone()) {
            Ok(command) => Some(command),
            Err(e) => {
                debug!(error = %e, message = %message, "Ignoring host message");
                None
            }
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match serde_json::from_str::<JsonValue>(raw) {
            Ok(value) => Self::from_value(&value),
            Err(e) => {
                debug!(error = %e, "Ignoring host message that is not JSON");
                None
            }
        }
    }
}

/// What handling a host message did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CommandOutcome {
    Activated(ActivationReport),
    NothingWaiting,
    LessonsCached { count: usize },
    /// The durable store was unavailable; the lessons were dropped.
    StorageUnavailable,
    Ignored,
}
