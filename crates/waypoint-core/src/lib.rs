//! Waypoint Core Library
//!
//! Shared types, errors, configuration, logging setup and the notifier
//! capability for the Waypoint offline layer.

pub mod config;
pub mod error;
pub mod logging;
pub mod notification;
pub mod types;

pub use config::WorkerConfig;
pub use error::{OfflineError, OfflineResult};
pub use logging::{init_logging, LogConfig, LogFormat};
pub use notification::{Notification, Notifier};
pub use types::{
    CachedLesson, PendingOperation, QueueKind, CHECK_NOTIFICATIONS_TAG, SYNC_PROGRESS_TAG,
    SYNC_SUBMISSIONS_TAG,
};
