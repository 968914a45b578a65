//! Raw change-log probe.
//!
//! Hashes the newest file matching a glob (for example the store's binary or
//! write-ahead log) and reports whether content that was already observed changed.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use tracing::debug;

use crate::error::MonitorError;

/// What the previous cycle saw.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogBaseline {
    pub path: PathBuf,
    pub len: u64,
    pub hash: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogVerdict {
    /// No baseline yet.
    First,
    Unchanged,
    /// Grew while keeping the previously hashed bytes intact.
    Appended,
    /// A newer log file took over; the baseline restarts on it.
    Rotated,
    /// Bytes that were already observed differ, or the file shrank.
    Rewritten,
}

impl LogVerdict {
    pub fn is_suspicious(&self) -> bool {
        matches!(self, LogVerdict::Rewritten)
    }
}

#[derive(Debug, Clone)]
pub struct LogObservation {
    pub baseline: LogBaseline,
    pub verdict: LogVerdict,
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub struct LogProbe {
    pattern: String,
}

impl LogProbe {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
        }
    }

    /// Newest log file, by name order.
    pub fn latest_log(&self) -> Result<PathBuf, MonitorError> {
        let entries = glob::glob(&self.pattern).map_err(|e| {
            MonitorError::ConfigError(format!("Invalid log glob {}: {}", self.pattern, e))
        })?;

        let mut files: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .filter(|p| p.is_file())
            .collect();
        files.sort();

        files.pop().ok_or_else(|| {
            MonitorError::IoError(format!("No log files match {}", self.pattern))
        })
    }

    pub async fn observe(&self, previous: Option<&LogBaseline>) -> Result<LogObservation, MonitorError> {
        let path = self.latest_log()?;
        let bytes = tokio::fs::read(&path).await?;
        let baseline = LogBaseline {
            path: path.clone(),
            len: bytes.len() as u64,
            hash: sha256_hex(&bytes),
        };

        let verdict = match previous {
            None => LogVerdict::First,
            Some(prev) if prev.path != path => LogVerdict::Rotated,
            Some(prev) if prev.len > baseline.len => LogVerdict::Rewritten,
            Some(prev) if prev.len == baseline.len => {
                if prev.hash == baseline.hash {
                    LogVerdict::Unchanged
                } else {
                    LogVerdict::Rewritten
                }
            }
            Some(prev) => {
                // prev.len < bytes.len() here, so the slice is in bounds.
                if sha256_hex(&bytes[..prev.len as usize]) == prev.hash {
                    LogVerdict::Appended
                } else {
                    LogVerdict::Rewritten
                }
            }
        };

        debug!("Log probe {:?}: {:?} ({} bytes)", path, verdict, baseline.len);
        Ok(LogObservation { baseline, verdict })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_log_probe_verdicts() {
        let dir = tempdir().unwrap();
        let pattern = dir.path().join("db-bin.*").to_string_lossy().to_string();
        let first = dir.path().join("db-bin.000001");
        tokio::fs::write(&first, b"INSERT 1\n").await.unwrap();

        let probe = LogProbe::new(pattern);
        let obs = probe.observe(None).await.unwrap();
        assert_eq!(obs.verdict, LogVerdict::First);

        let obs = probe.observe(Some(&obs.baseline)).await.unwrap();
        assert_eq!(obs.verdict, LogVerdict::Unchanged);

        tokio::fs::write(&first, b"INSERT 1\nINSERT 2\n").await.unwrap();
        let obs = probe.observe(Some(&obs.baseline)).await.unwrap();
        assert_eq!(obs.verdict, LogVerdict::Appended);
        assert!(!obs.verdict.is_suspicious());

        tokio::fs::write(&first, b"INSERT 1\nDELETE 2\n").await.unwrap();
        let rewritten = probe.observe(Some(&obs.baseline)).await.unwrap();
        assert_eq!(rewritten.verdict, LogVerdict::Rewritten);
        assert!(rewritten.verdict.is_suspicious());

        tokio::fs::write(&first, b"INSERT 1\n").await.unwrap();
        let shrunk = probe.observe(Some(&rewritten.baseline)).await.unwrap();
        assert_eq!(shrunk.verdict, LogVerdict::Rewritten);

        tokio::fs::write(dir.path().join("db-bin.000002"), b"").await.unwrap();
        let rotated = probe.observe(Some(&shrunk.baseline)).await.unwrap();
        assert_eq!(rotated.verdict, LogVerdict::Rotated);
        assert!(rotated.baseline.path.ends_with("db-bin.000002"));
    }

    #[test]
    fn test_no_matching_logs() {
        let dir = tempdir().unwrap();
        let probe = LogProbe::new(dir.path().join("none.*").to_string_lossy().to_string());
        assert!(probe.latest_log().is_err());
    }
}
