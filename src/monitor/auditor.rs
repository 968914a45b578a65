//! Snapshot Auditor
//!
//! Periodically captures the vote and voter tables, compares them with the previous cycle
//! and raises alerts for rows that were altered or dropped. New votes are cross-checked
//! against the hash chain.

use chrono::Utc;
use std::collections::BTreeSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::alerts::{AlertRecorder, AlertSource};
use crate::config::MonitorConfig;
use crate::database::Database;
use crate::error::MonitorError;
use crate::ledger::Ledger;
use crate::monitor::log_probe::LogProbe;
use crate::monitor::snapshot::Snapshot;
use crate::monitor::state::DetectorState;

/// What one audit cycle saw and did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleOutcome {
    pub snapshot_hash: String,
    pub snapshot_changed: bool,
    pub alerts_raised: usize,
}

pub struct SnapshotAuditor {
    database: Database,
    ledger: Ledger,
    recorder: AlertRecorder,
    config: MonitorConfig,
    log_probe: Option<LogProbe>,
    state: DetectorState,
}

impl SnapshotAuditor {
    pub fn new(database: Database, ledger: Ledger, recorder: AlertRecorder, config: MonitorConfig) -> Self {
        let log_probe = config.log_glob.clone().map(LogProbe::new);
        Self {
            database,
            ledger,
            recorder,
            config,
            log_probe,
            state: DetectorState::default(),
        }
    }

    pub fn state(&self) -> &DetectorState {
        &self.state
    }

    /// Reload the persisted state from `monitor.state_file`.
    pub async fn load_state(&mut self) {
        self.state = DetectorState::load(&self.config.state_file).await;
    }

    /// Poll until `shutdown` fires. A cycle that already started always completes.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(
            "Snapshot auditor started (every {}s, state {:?})",
            self.config.poll_interval_secs, self.config.state_file
        );
        self.load_state().await;

        loop {
            match self.run_cycle().await {
                Ok(outcome) if outcome.alerts_raised > 0 => warn!(
                    "Audit cycle raised {} alert(s), snapshot {}",
                    outcome.alerts_raised, outcome.snapshot_hash
                ),
                Ok(outcome) => debug!("Audit cycle clean, snapshot {}", outcome.snapshot_hash),
                Err(e) => e.log_failure("Audit cycle failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
                _ = shutdown.cancelled() => {
                    info!("Snapshot auditor received shutdown signal");
                    break;
                }
            }
        }

        info!("Snapshot auditor stopped");
    }

    pub async fn run_cycle(&mut self) -> Result<CycleOutcome, MonitorError> {
        let current = Snapshot::capture(&self.database).await?;
        let current_hash = current.hash()?;
        let mut alerts_raised = 0;

        let snapshot_changed = matches!(
            &self.state.last_snapshot_hash,
            Some(previous) if *previous != current_hash
        );
        if snapshot_changed {
            alerts_raised += self.compare(&current).await;
        }

        alerts_raised += self.probe_log().await;

        self.state.last_snapshot_hash = Some(current_hash.clone());
        self.state.last_snapshot = Some(current);
        self.state.last_checked_at = Some(Utc::now());
        if let Err(e) = self.state.save(&self.config.state_file).await {
            warn!("Failed to persist detector state, keeping it in memory: {}", e);
        }

        Ok(CycleOutcome {
            snapshot_hash: current_hash,
            snapshot_changed,
            alerts_raised,
        })
    }

    /// Alerts for the difference between the stored snapshot and `current`. Failures here
    /// are logged so the cycle still records `current` and does not repeat the alerts.
    async fn compare(&self, current: &Snapshot) -> usize {
        let Some(previous) = &self.state.last_snapshot else {
            self.recorder
                .raise(
                    AlertSource::Snapshot,
                    "Database snapshot hash changed and no previous snapshot is available",
                    "",
                )
                .await;
            return 1;
        };

        let changes = previous.changes(current);
        let mut raised = 0;

        if changes.has_mutations() {
            let diff = previous.diff(current).unwrap_or_else(|e| {
                warn!("Failed to render snapshot diff: {}", e);
                String::new()
            });
            let reason = format!("Unauthorized modification detected: {}", changes.describe());
            self.recorder.raise(AlertSource::Snapshot, &reason, &diff).await;
            raised += 1;
        }

        let added: BTreeSet<i64> = changes.added_vote_ids().into_iter().collect();
        if !added.is_empty() {
            let report = match self.ledger.verify_all().await {
                Ok(report) => report,
                Err(e) => {
                    e.log_failure("Chain check of new votes failed");
                    return raised;
                }
            };
            let forged: Vec<i64> = report
                .tampered
                .iter()
                .copied()
                .filter(|id| added.contains(id))
                .collect();
            if forged.is_empty() {
                debug!("{} new vote(s) extend the chain correctly", added.len());
            } else {
                let reason = format!("New votes do not extend the hash chain: {:?}", forged);
                self.recorder
                    .raise(AlertSource::Chain, &reason, &report.summary())
                    .await;
                raised += 1;
            }
        }

        raised
    }

    async fn probe_log(&mut self) -> usize {
        let Some(probe) = &self.log_probe else {
            return 0;
        };

        let previous = self.state.log_baseline();
        match probe.observe(previous.as_ref()).await {
            Ok(observation) => {
                let suspicious = observation.verdict.is_suspicious();
                if suspicious {
                    let detail = format!(
                        "{:?}: previously {} bytes with sha256 {}, now {} bytes with sha256 {}",
                        observation.baseline.path,
                        previous.as_ref().map(|b| b.len).unwrap_or_default(),
                        previous.as_ref().map(|b| b.hash.as_str()).unwrap_or_default(),
                        observation.baseline.len,
                        observation.baseline.hash
                    );
                    self.recorder
                        .raise(AlertSource::Log, "Raw change log content changed", &detail)
                        .await;
                }
                self.state.set_log_baseline(Some(observation.baseline));
                usize::from(suspicious)
            }
            Err(e) => {
                warn!("Log probe failed: {}", e);
                0
            }
        }
    }
}
