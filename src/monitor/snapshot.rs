//! Database Snapshots
//!
//! Point-in-time copies of the `votes` and `voters` tables, normalized so that the same
//! logical state always serializes and hashes identically.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use similar::TextDiff;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use crate::database::queries::Queries;
use crate::database::Database;
use crate::error::MonitorError;

/// Table captured in a snapshot and the column identifying its rows.
#[derive(Debug, Clone, Copy)]
pub struct SnapshotTable {
    pub name: &'static str,
    pub key: &'static str,
}

pub const VOTES_TABLE: SnapshotTable = SnapshotTable {
    name: "votes",
    key: "vote_id",
};

pub const VOTERS_TABLE: SnapshotTable = SnapshotTable {
    name: "voters",
    key: "voter_id",
};

const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

/// Rewrite a timestamp-looking string as `YYYY-MM-DDTHH:MM:SS.ffffffZ`.
pub fn canonicalize_timestamp(text: &str) -> Option<String> {
    let parsed = DateTime::parse_from_rfc3339(text)
        .map(|ts| ts.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NAIVE_FORMATS
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
                .map(|naive| naive.and_utc())
        })?;
    Some(parsed.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string())
}

/// Recursively canonicalize timestamps and sort object keys.
pub fn normalize_value(value: Value) -> Value {
    match value {
        Value::String(text) => match canonicalize_timestamp(&text) {
            Some(canonical) => Value::String(canonical),
            None => Value::String(text),
        },
        Value::Array(items) => Value::Array(items.into_iter().map(normalize_value).collect()),
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> = map
                .into_iter()
                .map(|(k, v)| (k, normalize_value(v)))
                .collect();
            Value::Object(sorted.into_iter().collect::<Map<String, Value>>())
        }
        other => other,
    }
}

fn compare_rows(a: &Value, b: &Value, key: &str) -> Ordering {
    let by_key = match (a.get(key), b.get(key)) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => x.to_string().cmp(&y.to_string()),
        },
        (Some(x), Some(y)) => x.to_string().cmp(&y.to_string()),
        _ => Ordering::Equal,
    };
    by_key.then_with(|| a.to_string().cmp(&b.to_string()))
}

fn normalize_rows(rows: Vec<Value>, key: &str) -> Vec<Value> {
    let mut rows: Vec<Value> = rows.into_iter().map(normalize_value).collect();
    rows.sort_by(|a, b| compare_rows(a, b, key));
    rows
}

fn row_key(row: &Value, key: &str) -> String {
    match row.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(value) => value.to_string(),
        None => row.to_string(),
    }
}

/// Keys of rows added, modified or removed between two versions of one table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TableChanges {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub removed: Vec<String>,
}

impl TableChanges {
    fn between(previous: &[Value], current: &[Value], key: &str) -> Self {
        let before: BTreeMap<String, &Value> =
            previous.iter().map(|row| (row_key(row, key), row)).collect();
        let after: BTreeMap<String, &Value> =
            current.iter().map(|row| (row_key(row, key), row)).collect();

        let keys: BTreeSet<&String> = before.keys().chain(after.keys()).collect();
        let mut changes = TableChanges::default();
        for k in keys {
            match (before.get(k), after.get(k)) {
                (None, Some(_)) => changes.added.push(k.clone()),
                (Some(_), None) => changes.removed.push(k.clone()),
                (Some(old), Some(new)) if old != new => changes.modified.push(k.clone()),
                _ => {}
            }
        }
        changes
    }

    /// Rows that existed before and were altered or dropped.
    pub fn has_mutations(&self) -> bool {
        !self.modified.is_empty() || !self.removed.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SnapshotChanges {
    pub votes: TableChanges,
    pub voters: TableChanges,
}

impl SnapshotChanges {
    pub fn has_mutations(&self) -> bool {
        self.votes.has_mutations() || self.voters.has_mutations()
    }

    /// Vote identifiers that appeared since the previous snapshot.
    pub fn added_vote_ids(&self) -> Vec<i64> {
        self.votes
            .added
            .iter()
            .filter_map(|k| k.parse().ok())
            .collect()
    }

    pub fn describe(&self) -> String {
        let mut parts = Vec::new();
        for (table, changes) in [("votes", &self.votes), ("voters", &self.voters)] {
            if !changes.modified.is_empty() {
                parts.push(format!("{} modified {:?}", table, changes.modified));
            }
            if !changes.removed.is_empty() {
                parts.push(format!("{} removed {:?}", table, changes.removed));
            }
        }
        parts.join("; ")
    }
}

/// Canonical copy of the vote and voter tables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub votes: Vec<Value>,
    pub voters: Vec<Value>,
}

impl Snapshot {
    /// Build a snapshot from rows in any order.
    pub fn from_rows(votes: Vec<Value>, voters: Vec<Value>) -> Self {
        Self {
            votes: normalize_rows(votes, VOTES_TABLE.key),
            voters: normalize_rows(voters, VOTERS_TABLE.key),
        }
    }

    pub async fn capture(database: &Database) -> Result<Self, MonitorError> {
        let votes = Self::read_table(database, VOTES_TABLE).await?;
        let voters = Self::read_table(database, VOTERS_TABLE).await?;
        Ok(Self::from_rows(votes, voters))
    }

    async fn read_table(database: &Database, table: SnapshotTable) -> Result<Vec<Value>, MonitorError> {
        Queries::table_rows_json(database.pool(), table.name)
            .await?
            .iter()
            .map(|row| {
                serde_json::from_str(row).map_err(|e| {
                    MonitorError::SnapshotError(format!("Malformed row in {}: {}", table.name, e))
                })
            })
            .collect()
    }

    /// Compact serialization used for hashing.
    pub fn canonical_json(&self) -> Result<String, MonitorError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Indented serialization used for diffs, newline terminated.
    pub fn pretty_json(&self) -> Result<String, MonitorError> {
        let mut text = serde_json::to_string_pretty(self)?;
        text.push('\n');
        Ok(text)
    }

    pub fn hash(&self) -> Result<String, MonitorError> {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical_json()?.as_bytes());
        Ok(hex::encode(hasher.finalize()))
    }

    /// Unified line diff from `self` to `current`.
    pub fn diff(&self, current: &Snapshot) -> Result<String, MonitorError> {
        let before = self.pretty_json()?;
        let after = current.pretty_json()?;
        Ok(TextDiff::from_lines(&before, &after)
            .unified_diff()
            .context_radius(3)
            .header("previous_db", "current_db")
            .to_string())
    }

    pub fn changes(&self, current: &Snapshot) -> SnapshotChanges {
        SnapshotChanges {
            votes: TableChanges::between(&self.votes, &current.votes, VOTES_TABLE.key),
            voters: TableChanges::between(&self.voters, &current.voters, VOTERS_TABLE.key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonicalize_timestamp_formats() {
        let expected = Some("2025-03-01T09:30:00.250000Z".to_string());
        assert_eq!(canonicalize_timestamp("2025-03-01T09:30:00.25+00:00"), expected);
        assert_eq!(canonicalize_timestamp("2025-03-01T10:30:00.25+01:00"), expected);
        assert_eq!(canonicalize_timestamp("2025-03-01 09:30:00.25"), expected);
        assert_eq!(canonicalize_timestamp("2025-03-01T09:30:00.250Z"), expected);
        assert_eq!(canonicalize_timestamp("alice@example.org"), None);
        assert_eq!(canonicalize_timestamp(&"a".repeat(64)), None);
    }

    #[test]
    fn test_normalize_sorts_keys_recursively() {
        let value = json!({"b": 1, "a": {"z": "2025-03-01 09:30:00", "y": [true]}});
        let normalized = normalize_value(value);
        assert_eq!(
            serde_json::to_string(&normalized).unwrap(),
            r#"{"a":{"y":[true],"z":"2025-03-01T09:30:00.000000Z"},"b":1}"#
        );
    }

    #[test]
    fn test_rows_sorted_by_key() {
        let snapshot = Snapshot::from_rows(
            vec![json!({"vote_id": 10}), json!({"vote_id": 2}), json!({"vote_id": 7})],
            vec![],
        );
        let ids: Vec<i64> = snapshot
            .votes
            .iter()
            .map(|r| r["vote_id"].as_i64().unwrap())
            .collect();
        assert_eq!(ids, vec![2, 7, 10]);
    }

    #[test]
    fn test_hash_ignores_fetch_order() {
        let rows = vec![
            json!({"vote_id": 1, "timestamp": "2025-03-01 09:30:00", "candidate_id": 3}),
            json!({"vote_id": 2, "timestamp": "2025-03-01T09:31:00+00:00", "candidate_id": 4}),
            json!({"vote_id": 3, "candidate_id": 3, "timestamp": "2025-03-01T09:32:00.000000Z"}),
        ];
        let voters = vec![json!({"voter_id": 2}), json!({"voter_id": 1})];

        let forward = Snapshot::from_rows(rows.clone(), voters.clone());
        let mut reversed_rows = rows;
        reversed_rows.reverse();
        let mut reversed_voters = voters;
        reversed_voters.reverse();
        let backward = Snapshot::from_rows(reversed_rows, reversed_voters);

        assert_eq!(forward.hash().unwrap(), backward.hash().unwrap());
        assert_eq!(forward.hash().unwrap().len(), 64);
    }

    #[test]
    fn test_changes_classification() {
        let before = Snapshot::from_rows(
            vec![json!({"vote_id": 1, "candidate_id": 3}), json!({"vote_id": 2, "candidate_id": 4})],
            vec![json!({"voter_id": 1, "email": "a@example.org"})],
        );
        let after = Snapshot::from_rows(
            vec![json!({"vote_id": 1, "candidate_id": 5}), json!({"vote_id": 3, "candidate_id": 4})],
            vec![
                json!({"voter_id": 1, "email": "a@example.org"}),
                json!({"voter_id": 2, "email": "b@example.org"}),
            ],
        );

        let changes = before.changes(&after);
        assert_eq!(changes.votes.modified, vec!["1"]);
        assert_eq!(changes.votes.removed, vec!["2"]);
        assert_eq!(changes.votes.added, vec!["3"]);
        assert_eq!(changes.voters.added, vec!["2"]);
        assert!(!changes.voters.has_mutations());
        assert!(changes.has_mutations());
        assert_eq!(changes.added_vote_ids(), vec![3]);
        assert_eq!(changes.describe(), r#"votes modified ["1"]; votes removed ["2"]"#);
    }

    #[test]
    fn test_additions_only_are_not_mutations() {
        let before = Snapshot::from_rows(vec![json!({"vote_id": 1})], vec![]);
        let after = Snapshot::from_rows(vec![json!({"vote_id": 1}), json!({"vote_id": 2})], vec![]);
        let changes = before.changes(&after);
        assert!(!changes.has_mutations());
        assert_eq!(changes.added_vote_ids(), vec![2]);
    }

    #[test]
    fn test_diff_headers() {
        let before = Snapshot::from_rows(vec![json!({"vote_id": 1, "candidate_id": 3})], vec![]);
        let after = Snapshot::from_rows(vec![json!({"vote_id": 1, "candidate_id": 9})], vec![]);
        let diff = before.diff(&after).unwrap();
        assert!(diff.starts_with("--- previous_db\n+++ current_db\n"));
        assert!(diff.contains("-      \"candidate_id\": 3,"));
        assert!(diff.contains("+      \"candidate_id\": 9,"));
        assert!(before.diff(&before).unwrap().is_empty());
    }
}
