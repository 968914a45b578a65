//! Background tamper detectors and their lifecycle.
//!
//! [`start_monitors`] spawns the snapshot auditor and the change-stream watcher, each
//! behind a [`DetectorHandle`] that owns its cancellation token and task.

pub mod auditor;
pub mod log_probe;
pub mod snapshot;
pub mod state;
pub mod watcher;

pub use auditor::{CycleOutcome, SnapshotAuditor};
pub use log_probe::{LogBaseline, LogProbe, LogVerdict};
pub use snapshot::{Snapshot, SnapshotChanges};
pub use state::DetectorState;
pub use watcher::{
    ChangeEvent, ChangeSource, ChangeStream, ChangeWatcher, MalformedChange, RowEvent, RowOperation,
    SqliteChangeSource,
};

use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::alerts::AlertRecorder;
use crate::config::AppConfig;
use crate::database::Database;
use crate::error::MonitorError;
use crate::ledger::Ledger;

/// A running detector task.
pub struct DetectorHandle {
    name: &'static str,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl DetectorHandle {
    /// Spawn `run` with a fresh cancellation token.
    pub fn spawn<F, Fut>(name: &'static str, run: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run(shutdown.clone()));
        debug!(detector = %name, "Spawned detector");
        Self {
            name,
            shutdown,
            task,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Ask the detector to stop after its current unit of work.
    pub fn cancel(&self) {
        self.shutdown.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancel and wait for the task to exit.
    pub async fn stop(self) -> Result<(), MonitorError> {
        self.shutdown.cancel();
        self.task.await.map_err(|e| {
            error!(detector = %self.name, "Detector task failed: {}", e);
            MonitorError::TaskError(format!("{} detector: {}", self.name, e))
        })?;
        info!(detector = %self.name, "Detector stopped");
        Ok(())
    }
}

/// Detectors started for one serving process.
#[derive(Default)]
pub struct Monitors {
    handles: Vec<DetectorHandle>,
}

impl Monitors {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.handles.iter().map(DetectorHandle::name).collect()
    }

    /// Stop every detector, reporting the first failure after all have been awaited.
    pub async fn stop_all(self) -> Result<(), MonitorError> {
        for handle in &self.handles {
            handle.cancel();
        }
        let mut first_error = None;
        for handle in self.handles {
            if let Err(e) = handle.stop().await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Start the detectors enabled in `config`.
pub fn start_monitors(
    config: &AppConfig,
    database: Database,
    ledger: Ledger,
    recorder: AlertRecorder,
) -> Monitors {
    let mut monitors = Monitors::default();

    if config.monitor.enabled {
        let auditor = SnapshotAuditor::new(
            database.clone(),
            ledger,
            recorder.clone(),
            config.monitor.clone(),
        );
        monitors
            .handles
            .push(DetectorHandle::spawn("snapshot-auditor", move |shutdown| auditor.run(shutdown)));
    }

    if config.watcher.enabled {
        let source = Arc::new(SqliteChangeSource::new(database, &config.watcher));
        let watcher = ChangeWatcher::new(source, recorder, config.watcher.reconnect_backoff());
        monitors
            .handles
            .push(DetectorHandle::spawn("change-watcher", move |shutdown| watcher.run(shutdown)));
    }

    info!("Started {} detector(s): {:?}", monitors.len(), monitors.names());
    monitors
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_handle_stop_waits_for_task() {
        let handle = DetectorHandle::spawn("test", |shutdown| async move {
            shutdown.cancelled().await;
        });
        assert!(!handle.is_finished());
        tokio::time::timeout(Duration::from_secs(2), handle.stop())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_panicking_task_reported() {
        let handle = DetectorHandle::spawn("boom", |_| async move {
            panic!("detector crashed");
        });
        assert!(matches!(handle.stop().await, Err(MonitorError::TaskError(_))));
    }
}
