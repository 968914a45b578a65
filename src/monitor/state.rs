//! Detector state persisted between auditor cycles.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::MonitorError;
use crate::monitor::log_probe::LogBaseline;
use crate::monitor::snapshot::Snapshot;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorState {
    pub last_snapshot_hash: Option<String>,
    pub last_snapshot: Option<Snapshot>,
    pub last_log_hash: Option<String>,
    pub last_log_path: Option<PathBuf>,
    pub last_log_len: Option<u64>,
    pub last_checked_at: Option<DateTime<Utc>>,
}

impl DetectorState {
    /// Read the state file. A missing or unreadable file yields an empty state.
    pub async fn load(path: &Path) -> Self {
        match tokio::fs::read(path).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(state) => {
                    debug!("Loaded detector state from {:?}", path);
                    state
                }
                Err(e) => {
                    warn!("Ignoring unreadable detector state {:?}: {}", path, e);
                    Self::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => {
                warn!("Failed to read detector state {:?}: {}", path, e);
                Self::default()
            }
        }
    }

    /// Replace the state file atomically: write a sibling temp file, then rename it over.
    pub async fn save(&self, path: &Path) -> Result<(), MonitorError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_vec_pretty(self)?;
        let tmp = temp_path(path);
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, path).await.map_err(|e| {
            MonitorError::StateError(format!("Failed to replace {:?}: {}", path, e))
        })?;
        Ok(())
    }

    pub fn log_baseline(&self) -> Option<LogBaseline> {
        match (&self.last_log_path, self.last_log_len, &self.last_log_hash) {
            (Some(path), Some(len), Some(hash)) => Some(LogBaseline {
                path: path.clone(),
                len,
                hash: hash.clone(),
            }),
            _ => None,
        }
    }

    pub fn set_log_baseline(&mut self, baseline: Option<LogBaseline>) {
        match baseline {
            Some(b) => {
                self.last_log_path = Some(b.path);
                self.last_log_len = Some(b.len);
                self.last_log_hash = Some(b.hash);
            }
            None => {
                self.last_log_path = None;
                self.last_log_len = None;
                self.last_log_hash = None;
            }
        }
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "detector_state.json".into());
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_missing_file_is_empty_state() {
        let dir = tempdir().unwrap();
        let state = DetectorState::load(&dir.path().join("absent.json")).await;
        assert_eq!(state, DetectorState::default());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        let snapshot = Snapshot::from_rows(vec![json!({"vote_id": 1})], vec![]);
        let mut state = DetectorState {
            last_snapshot_hash: Some(snapshot.hash().unwrap()),
            last_snapshot: Some(snapshot),
            last_checked_at: Some(Utc::now()),
            ..Default::default()
        };
        state.set_log_baseline(Some(LogBaseline {
            path: PathBuf::from("/var/lib/db/log.000002"),
            len: 512,
            hash: "ab".repeat(32),
        }));

        state.save(&path).await.unwrap();
        assert!(!temp_path(&path).exists());

        let loaded = DetectorState::load(&path).await;
        assert_eq!(loaded, state);
        assert_eq!(loaded.log_baseline().unwrap().len, 512);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_empty_state() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();
        assert_eq!(DetectorState::load(&path).await, DetectorState::default());
    }
}
