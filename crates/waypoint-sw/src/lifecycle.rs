//! Worker generations and their install/activate transitions.
//!
//! ```text
//! Registration
//!     ├── installing (WorkerGeneration)
//!     ├── waiting    (WorkerGeneration)
//!     └── active     (WorkerGeneration)
//! ```
//!
//! The controller only tracks state and publishes events. Precaching and
//! stale-cache cleanup are driven by the worker around these transitions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Unique identifier for a worker generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GenerationId(u64);

impl GenerationId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Worker generation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Known but not yet installing.
    #[default]
    Parsed,
    /// Precaching.
    Installing,
    /// Installed and waiting for activation.
    Installed,
    /// Evicting stale caches.
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Failed to install or replaced by a newer generation.
    Redundant,
}

/// One installed version of the worker.
#[derive(Debug, Clone)]
pub struct WorkerGeneration {
    pub id: GenerationId,
    pub version: String,
    pub state: WorkerState,
    /// Why the install failed, if it did.
    pub error: Option<String>,
    pub state_changed_at: Instant,
}

impl WorkerGeneration {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            id: GenerationId::new(),
            version: version.into(),
            state: WorkerState::Parsed,
            error: None,
            state_changed_at: Instant::now(),
        }
    }

    pub fn set_state(&mut self, state: WorkerState) {
        debug!(version = %self.version, from = ?self.state, to = ?state, "Generation state change");
        self.state = state;
        self.state_changed_at = Instant::now();
    }

    pub fn is_active(&self) -> bool {
        self.state == WorkerState::Activated
    }

    pub fn is_redundant(&self) -> bool {
        self.state == WorkerState::Redundant
    }
}

/// Events published to the host page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    Installing { version: String },
    Waiting { version: String },
    Active { version: String },
    ControllerChange { version: String },
    Redundant { version: String },
}

/// Result of a finished activation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivationReport {
    pub version: String,
    pub deleted_caches: Vec<String>,
}

/// What to do once a generation finished precaching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallProgress {
    /// Nothing is active yet; activate right away.
    ActivateNow,
    /// A predecessor is active; wait for skip-waiting or a page-load cycle.
    Wait,
    /// A newer install replaced this one while it was precaching.
    Superseded,
}

/// Host-side guard reloading the page once per controller change.
#[derive(Debug, Default)]
pub struct ReloadGuard {
    fired: bool,
}

impl ReloadGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` for the first controller change of a page session.
    pub fn observe_controller_change(&mut self) -> bool {
        if self.fired {
            debug!("Reload already triggered for this page");
            return false;
        }
        self.fired = true;
        true
    }

    /// A fresh page load re-arms the guard.
    pub fn page_loaded(&mut self) {
        self.fired = false;
    }

    pub fn has_fired(&self) -> bool {
        self.fired
    }
}

/// The generation slots of a registration.
#[derive(Debug, Default)]
pub struct Registration {
    pub installing: Option<WorkerGeneration>,
    pub waiting: Option<WorkerGeneration>,
    pub active: Option<WorkerGeneration>,
}

/// Drives generations through their states and publishes the transitions.
pub struct LifecycleController {
    registration: Registration,
    reload_guard: ReloadGuard,
    open_pages: usize,
    event_tx: mpsc::UnboundedSender<LifecycleEvent>,
}

impl LifecycleController {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<LifecycleEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            Self {
                registration: Registration::default(),
                reload_guard: ReloadGuard::new(),
                open_pages: 0,
                event_tx,
            },
            event_rx,
        )
    }

    fn emit(&self, event: LifecycleEvent) {
        if self.event_tx.send(event).is_err() {
            debug!("No listener for lifecycle events");
        }
    }

    fn retire(&self, generation: &mut WorkerGeneration) {
        generation.set_state(WorkerState::Redundant);
        self.emit(LifecycleEvent::Redundant {
            version: generation.version.clone(),
        });
    }

    pub fn registration(&self) -> &Registration {
        &self.registration
    }

    pub fn active_version(&self) -> Option<&str> {
        self.registration.active.as_ref().map(|g| g.version.as_str())
    }

    pub fn waiting_version(&self) -> Option<&str> {
        self.registration.waiting.as_ref().map(|g| g.version.as_str())
    }

    pub fn installing_version(&self) -> Option<&str> {
        self.registration
            .installing
            .as_ref()
            .map(|g| g.version.as_str())
    }

    /// Start installing `version`. An install already in flight is retired.
    pub fn begin_install(&mut self, version: &str) -> GenerationId {
        let mut generation = WorkerGeneration::new(version);
        generation.set_state(WorkerState::Installing);
        let id = generation.id;

        if let Some(mut previous) = self.registration.installing.replace(generation) {
            warn!(version = %previous.version, "Install superseded");
            self.retire(&mut previous);
        }

        info!(version, "Installing");
        self.emit(LifecycleEvent::Installing {
            version: version.to_string(),
        });
        id
    }

    /// Precache for `id` failed; the generation becomes redundant and the
    /// active one stays in charge.
    pub fn install_failed(&mut self, id: GenerationId, reason: &str) {
        let Some(installing) = self.registration.installing.as_ref() else {
            return;
        };
        if installing.id != id {
            return;
        }
        if let Some(mut generation) = self.registration.installing.take() {
            warn!(version = %generation.version, reason, "Install failed");
            generation.error = Some(reason.to_string());
            self.retire(&mut generation);
        }
    }

    /// Precache for `id` succeeded; move it to the waiting slot.
    pub fn install_complete(&mut self, id: GenerationId) -> InstallProgress {
        let is_current = self
            .registration
            .installing
            .as_ref()
            .is_some_and(|g| g.id == id);
        if !is_current {
            return InstallProgress::Superseded;
        }
        let Some(generation) = self.registration.installing.take() else {
            return InstallProgress::Superseded;
        };

        self.park_installed(generation)
    }

    /// Register a generation precached by an earlier process, as if its
    /// install had just completed.
    pub fn adopt_installed(&mut self, version: &str) -> InstallProgress {
        self.park_installed(WorkerGeneration::new(version))
    }

    fn park_installed(&mut self, mut generation: WorkerGeneration) -> InstallProgress {
        generation.set_state(WorkerState::Installed);
        let version = generation.version.clone();
        if let Some(mut older) = self.registration.waiting.replace(generation) {
            self.retire(&mut older);
        }

        if self.registration.active.is_none() {
            InstallProgress::ActivateNow
        } else {
            info!(version = %version, "Installed, waiting for activation");
            self.emit(LifecycleEvent::Waiting { version });
            InstallProgress::Wait
        }
    }

    /// Put back the generation an earlier process left active. Pages it
    /// controls are already controlled, so no events are published.
    pub fn restore_active(&mut self, version: &str) {
        let mut generation = WorkerGeneration::new(version);
        generation.set_state(WorkerState::Activated);
        info!(version, "Restored active generation");
        self.registration.active = Some(generation);
    }

    /// Move the waiting generation to `Activating`. Returns its version, or
    /// `None` if nothing is waiting.
    pub fn begin_activation(&mut self) -> Option<String> {
        let generation = self.registration.waiting.as_mut()?;
        generation.set_state(WorkerState::Activating);
        Some(generation.version.clone())
    }

    /// Finish activating: the old active generation is retired, the new one
    /// claims every open page and a single controller change is published.
    pub fn finish_activation(&mut self) {
        let Some(mut generation) = self.registration.waiting.take() else {
            return;
        };
        if let Some(mut old) = self.registration.active.take() {
            self.retire(&mut old);
        }

        generation.set_state(WorkerState::Activated);
        let version = generation.version.clone();
        self.registration.active = Some(generation);

        info!(version = %version, open_pages = self.open_pages, "Activated");
        self.emit(LifecycleEvent::Active {
            version: version.clone(),
        });
        self.emit(LifecycleEvent::ControllerChange { version });
    }

    /// A page finished loading. Returns `true` when a waiting generation
    /// may now activate because no older page is still open.
    pub fn page_load_cycle(&mut self) -> bool {
        self.reload_guard.page_loaded();
        let ready = self.open_pages == 0 && self.registration.waiting.is_some();
        self.open_pages += 1;
        ready
    }

    /// A controlled page was closed.
    pub fn page_closed(&mut self) {
        self.open_pages = self.open_pages.saturating_sub(1);
    }

    pub fn open_pages(&self) -> usize {
        self.open_pages
    }

    pub fn reload_guard(&mut self) -> &mut ReloadGuard {
        &mut self.reload_guard
    }
}
