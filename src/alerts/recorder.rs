use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::database::models::Alert;
use crate::database::Database;
use crate::error::MonitorError;
use crate::notify::{Notifier, NotifyOutcome};

/// Detector that raised an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSource {
    Snapshot,
    Chain,
    Log,
    ChangeStream,
}

impl AlertSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSource::Snapshot => "snapshot",
            AlertSource::Chain => "chain",
            AlertSource::Log => "log",
            AlertSource::ChangeStream => "change_stream",
        }
    }
}

impl fmt::Display for AlertSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize)]
struct AlertMeta<'a> {
    alert_id: Option<i64>,
    created_at: String,
    source: &'a str,
    reason: &'a str,
}

#[derive(Clone)]
pub struct AlertRecorder {
    database: Database,
    notifier: Option<Arc<Notifier>>,
    alerts_dir: Option<PathBuf>,
}

impl AlertRecorder {
    pub fn new(database: Database, notifier: Option<Arc<Notifier>>, alerts_dir: Option<PathBuf>) -> Self {
        Self {
            database,
            notifier,
            alerts_dir,
        }
    }

    /// Record an alert and notify voters.
    ///
    /// Returns the stored alert, or `None` when it could not be persisted. Voters are
    /// notified either way.
    pub async fn raise(&self, source: AlertSource, reason: &str, detail: &str) -> Option<Alert> {
        let created_at = Utc::now();
        warn!("🚨 Tamper alert from {}: {}", source, reason);

        let stored = match self
            .database
            .insert_alert(created_at, source.as_str(), reason, detail)
            .await
        {
            Ok(alert) => {
                info!("Recorded alert {}", alert.alert_id);
                Some(alert)
            }
            Err(e) => {
                error!("Failed to persist {} alert: {}", source, e);
                None
            }
        };

        if let Some(dir) = &self.alerts_dir {
            let meta = AlertMeta {
                alert_id: stored.as_ref().map(|a| a.alert_id),
                created_at: created_at.to_rfc3339(),
                source: source.as_str(),
                reason,
            };
            if let Err(e) = write_alert_files(dir, &meta, detail).await {
                warn!("Failed to mirror alert to {:?}: {}", dir, e);
            }
        }

        if let Some(notifier) = &self.notifier {
            match notifier.notify(reason).await {
                NotifyOutcome::Failed(why) => warn!("Alert notification not delivered: {}", why),
                outcome => info!("Alert notification: {:?}", outcome),
            }
        }

        stored
    }
}

async fn write_alert_files(dir: &Path, meta: &AlertMeta<'_>, detail: &str) -> Result<PathBuf, MonitorError> {
    let stamp = Utc::now().format("%Y%m%dT%H%M%S%.6fZ");
    let name = match meta.alert_id {
        Some(id) => format!("{}-{}", stamp, id),
        None => stamp.to_string(),
    };
    let alert_dir = dir.join(name);
    tokio::fs::create_dir_all(&alert_dir).await?;

    let text = format!("{}\n\n{}\n", meta.reason, detail);
    tokio::fs::write(alert_dir.join("alert.txt"), text).await?;
    tokio::fs::write(alert_dir.join("meta.json"), serde_json::to_vec_pretty(meta)?).await?;
    Ok(alert_dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn setup() -> Database {
        let db = Database::new_in_memory().await.unwrap();
        db.run_migrations().await.unwrap();
        db
    }

    #[tokio::test]
    async fn test_raise_persists_alert() {
        let db = setup().await;
        let recorder = AlertRecorder::new(db.clone(), None, None);

        let alert = recorder
            .raise(AlertSource::ChangeStream, "DELETE on votes row 3", "{\"vote_id\":3}")
            .await
            .unwrap();
        assert_eq!(alert.source, "change_stream");
        assert!(!alert.acknowledged);
        assert_eq!(db.unacknowledged_alert_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_raise_mirrors_to_alerts_dir() {
        let db = setup().await;
        let dir = tempdir().unwrap();
        let recorder = AlertRecorder::new(db, None, Some(dir.path().to_path_buf()));

        recorder
            .raise(AlertSource::Snapshot, "Unauthorized modification", "--- previous_db\n")
            .await
            .unwrap();

        let mut entries = std::fs::read_dir(dir.path()).unwrap();
        let alert_dir = entries.next().unwrap().unwrap().path();
        let text = std::fs::read_to_string(alert_dir.join("alert.txt")).unwrap();
        assert!(text.starts_with("Unauthorized modification\n\n--- previous_db"));
        let meta: serde_json::Value =
            serde_json::from_slice(&std::fs::read(alert_dir.join("meta.json")).unwrap()).unwrap();
        assert_eq!(meta["source"], "snapshot");
        assert_eq!(meta["alert_id"], 1);
    }

    #[tokio::test]
    async fn test_raise_survives_storage_failure() {
        let db = setup().await;
        db.pool().close().await;
        let recorder = AlertRecorder::new(db, None, None);
        assert!(recorder.raise(AlertSource::Log, "log rewritten", "").await.is_none());
    }
}
