use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Persisted tamper alert. `acknowledged` is the only field that changes after insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Alert {
    pub alert_id: i64,
    pub created_at: DateTime<Utc>,
    pub source: String,
    pub reason: String,
    pub detail: String,
    pub acknowledged: bool,
}

/// Raw `votes` row; the timestamp stays in its stored text form.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct VoteRow {
    pub vote_id: i64,
    pub voter_id: i64,
    pub position_id: i64,
    pub candidate_id: i64,
    pub timestamp: String,
    pub vote_hash: String,
    pub previous_vote_hash: String,
}

/// One entry of the trigger-fed change feed.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ChangeRow {
    pub change_id: i64,
    pub table_name: String,
    pub operation: String,
    pub row_id: i64,
    pub before_values: Option<String>,
    pub after_values: Option<String>,
    pub changed_at: String,
}
