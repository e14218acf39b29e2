// Task Coordination
// Pause gate, in-flight task registry and progress handles for running modules

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;

/// Shared pause flag
///
/// Breakpoints and explicit pauses both close the gate. Running work waits
/// at its next checkpoint; the scheduler waits before starting new units.
#[derive(Debug, Clone)]
pub struct PauseGate {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new()
    }
}

impl PauseGate {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Close the gate; returns false when it was already closed
    pub fn pause(&self) -> bool {
        self.tx.send_if_modified(|paused| {
            let changed = !*paused;
            *paused = true;
            changed
        })
    }

    /// Open the gate; returns false when it was already open
    pub fn resume(&self) -> bool {
        self.tx.send_if_modified(|paused| {
            let changed = *paused;
            *paused = false;
            changed
        })
    }

    pub fn is_paused(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the gate is open; returns immediately when not paused
    pub async fn wait_until_resumed(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this cannot fail
        let _ = rx.wait_for(|paused| !*paused).await;
    }
}

/// Receives progress reported by running work
pub trait ProgressSink: Send + Sync {
    fn record_progress(&self, unit_id: &str, percent: u8);
}

/// Bookkeeping for one in-flight unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskInfo {
    pub progress: u8,
    pub suspended: bool,
}

/// Registry of units currently executing
#[derive(Debug, Clone, Default)]
pub struct TaskCoordinator {
    tasks: Arc<Mutex<BTreeMap<String, TaskInfo>>>,
}

impl TaskCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a unit and hand out its progress handle
    ///
    /// `start` is the progress already recorded for the unit; work picks up
    /// from there.
    pub fn register(
        &self,
        unit_id: impl Into<String>,
        start: u8,
        gate: PauseGate,
        sink: Arc<dyn ProgressSink>,
    ) -> ProgressHandle {
        let unit_id = unit_id.into();
        self.tasks.lock().insert(
            unit_id.clone(),
            TaskInfo {
                progress: start.min(100),
                suspended: false,
            },
        );
        ProgressHandle {
            unit_id,
            coordinator: self.clone(),
            gate,
            sink,
        }
    }

    pub fn get(&self, unit_id: &str) -> Option<TaskInfo> {
        self.tasks.lock().get(unit_id).copied()
    }

    /// Ids and state of every in-flight unit
    pub fn in_flight(&self) -> Vec<(String, TaskInfo)> {
        self.tasks
            .lock()
            .iter()
            .map(|(id, info)| (id.clone(), *info))
            .collect()
    }

    /// Units currently held at a checkpoint
    pub fn suspended(&self) -> Vec<String> {
        self.tasks
            .lock()
            .iter()
            .filter(|(_, info)| info.suspended)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }

    fn update(&self, unit_id: &str, f: impl FnOnce(&mut TaskInfo)) {
        if let Some(info) = self.tasks.lock().get_mut(unit_id) {
            f(info);
        }
    }

    fn remove(&self, unit_id: &str) {
        self.tasks.lock().remove(unit_id);
    }
}

/// Handle given to running work for reporting progress and honoring pauses
///
/// Dropping the handle removes the unit from the coordinator.
pub struct ProgressHandle {
    unit_id: String,
    coordinator: TaskCoordinator,
    gate: PauseGate,
    sink: Arc<dyn ProgressSink>,
}

impl ProgressHandle {
    pub fn unit_id(&self) -> &str {
        &self.unit_id
    }

    /// Last recorded progress, 0-100
    pub fn current(&self) -> u8 {
        self.coordinator
            .get(&self.unit_id)
            .map(|info| info.progress)
            .unwrap_or(0)
    }

    /// Record progress; values never decrease and are capped at 100
    pub fn report(&self, percent: u8) {
        let percent = percent.min(100);
        if percent <= self.current() {
            return;
        }
        self.coordinator
            .update(&self.unit_id, |info| info.progress = percent);
        self.sink.record_progress(&self.unit_id, percent);
    }

    pub fn is_paused(&self) -> bool {
        self.gate.is_paused()
    }

    /// Suspend here while paused; progress is kept across the suspension
    pub async fn checkpoint(&self) {
        if !self.is_paused() {
            return;
        }
        self.coordinator
            .update(&self.unit_id, |info| info.suspended = true);
        self.gate.wait_until_resumed().await;
        self.coordinator
            .update(&self.unit_id, |info| info.suspended = false);
    }
}

impl Drop for ProgressHandle {
    fn drop(&mut self) {
        self.coordinator.remove(&self.unit_id);
    }
}

impl std::fmt::Debug for ProgressHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressHandle")
            .field("unit_id", &self.unit_id)
            .field("progress", &self.current())
            .finish()
    }
}
