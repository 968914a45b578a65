//! Ledger Store
//!
//! Appends votes to the global chain and reads them back for verification.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::database::models::VoteRow;
use crate::database::Database;
use crate::error::MonitorError;
use crate::ledger::record::{canonical_timestamp, compute_commit_hash, VoteRecord};
use crate::ledger::verify::{detect_gaps, find_tampered, verify_chain, ChainReport};

/// Attempts before an append gives up on a tail that keeps moving.
const MAX_APPEND_ATTEMPTS: u32 = 5;

const APPEND_RETRY_DELAY: Duration = Duration::from_millis(20);

/// SQLite result codes for a lock held by another connection.
const SQLITE_BUSY_CODES: [&str; 4] = ["5", "6", "261", "517"];

/// Lock timeouts and tail-link collisions: the append can start over.
fn is_contention(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            db_err.is_unique_violation()
                || db_err
                    .code()
                    .is_some_and(|code| SQLITE_BUSY_CODES.iter().any(|busy| *busy == code))
        }
        _ => false,
    }
}

const VOTE_COLUMNS: &str =
    "vote_id, voter_id, position_id, candidate_id, timestamp, vote_hash, previous_vote_hash";

/// Election vote joined with the vote immediately before it in the global chain.
#[derive(Debug, sqlx::FromRow)]
struct LinkRow {
    vote_id: i64,
    voter_id: i64,
    position_id: i64,
    candidate_id: i64,
    timestamp: String,
    vote_hash: String,
    previous_vote_hash: String,
    pred_vote_id: Option<i64>,
    pred_voter_id: Option<i64>,
    pred_position_id: Option<i64>,
    pred_candidate_id: Option<i64>,
    pred_timestamp: Option<String>,
    pred_vote_hash: Option<String>,
    pred_previous_vote_hash: Option<String>,
}

impl LinkRow {
    fn split(self) -> (VoteRecord, Option<VoteRecord>) {
        let predecessor = match (
            self.pred_vote_id,
            self.pred_voter_id,
            self.pred_position_id,
            self.pred_candidate_id,
            self.pred_timestamp,
            self.pred_vote_hash,
            self.pred_previous_vote_hash,
        ) {
            (Some(vote_id), Some(voter_id), Some(position_id), Some(candidate_id), Some(timestamp), Some(commit_hash), Some(previous_hash)) => {
                Some(VoteRecord {
                    vote_id,
                    voter_id,
                    position_id,
                    candidate_id,
                    timestamp,
                    commit_hash,
                    previous_hash,
                })
            }
            _ => None,
        };

        let record = VoteRecord {
            vote_id: self.vote_id,
            voter_id: self.voter_id,
            position_id: self.position_id,
            candidate_id: self.candidate_id,
            timestamp: self.timestamp,
            commit_hash: self.vote_hash,
            previous_hash: self.previous_vote_hash,
        };

        (record, predecessor)
    }
}

/// Hash-chained vote ledger backed by the `votes` table.
#[derive(Clone)]
pub struct Ledger {
    database: Database,
    append_lock: Arc<Mutex<()>>,
}

impl Ledger {
    pub fn new(database: Database) -> Self {
        Self {
            database,
            append_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Append a vote to the chain tail.
    ///
    /// The write lock is taken when the transaction begins, so the tail read and the
    /// insert see the same chain. A writer on another connection that still claims the
    /// same tail is rejected by the UNIQUE constraint on `previous_vote_hash`; lock
    /// timeouts and such rejections restart the append from the new tail.
    pub async fn append(
        &self,
        voter_id: i64,
        position_id: i64,
        candidate_id: i64,
        timestamp: DateTime<Utc>,
    ) -> Result<VoteRecord, MonitorError> {
        let _guard = self.append_lock.lock().await;
        let timestamp = canonical_timestamp(&timestamp);

        for attempt in 1..=MAX_APPEND_ATTEMPTS {
            match self
                .try_append(voter_id, position_id, candidate_id, &timestamp)
                .await?
            {
                Some(record) => {
                    debug!("Appended {}", record.summary());
                    return Ok(record);
                }
                None => {
                    warn!(
                        "Chain tail contended during append for voter {} position {} (attempt {})",
                        voter_id, position_id, attempt
                    );
                    tokio::time::sleep(APPEND_RETRY_DELAY * attempt).await;
                }
            }
        }

        Err(MonitorError::ChainContention(MAX_APPEND_ATTEMPTS))
    }

    /// `Ok(None)` when another writer held or claimed the tail.
    async fn try_append(
        &self,
        voter_id: i64,
        position_id: i64,
        candidate_id: i64,
        timestamp: &str,
    ) -> Result<Option<VoteRecord>, MonitorError> {
        let mut tx = match self.database.pool().begin_with("BEGIN IMMEDIATE").await {
            Ok(tx) => tx,
            Err(e) if is_contention(&e) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let already_voted: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM votes WHERE voter_id = ? AND position_id = ?",
        )
        .bind(voter_id)
        .bind(position_id)
        .fetch_one(&mut *tx)
        .await?;
        if already_voted > 0 {
            return Err(MonitorError::DuplicateVote {
                voter_id,
                position_id,
            });
        }

        let previous_hash =
            sqlx::query_scalar::<_, String>("SELECT vote_hash FROM votes ORDER BY vote_id DESC LIMIT 1")
                .fetch_optional(&mut *tx)
                .await?
                .unwrap_or_default();

        let commit_hash =
            compute_commit_hash(voter_id, position_id, candidate_id, timestamp, &previous_hash);

        let inserted = sqlx::query(
            r#"
            INSERT INTO votes (voter_id, position_id, candidate_id, timestamp, vote_hash, previous_vote_hash)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(voter_id)
        .bind(position_id)
        .bind(candidate_id)
        .bind(timestamp)
        .bind(&commit_hash)
        .bind(&previous_hash)
        .execute(&mut *tx)
        .await;

        let vote_id = match inserted {
            Ok(result) => result.last_insert_rowid(),
            Err(e) if is_contention(&e) => {
                tx.rollback().await?;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        match tx.commit().await {
            Ok(()) => {}
            Err(e) if is_contention(&e) => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        Ok(Some(VoteRecord {
            vote_id,
            voter_id,
            position_id,
            candidate_id,
            timestamp: timestamp.to_string(),
            commit_hash,
            previous_hash,
        }))
    }

    /// Most recently appended record in the whole store.
    pub async fn tail(&self) -> Result<Option<VoteRecord>, MonitorError> {
        let sql = format!(
            "SELECT {} FROM votes ORDER BY vote_id DESC LIMIT 1",
            VOTE_COLUMNS
        );
        let row = sqlx::query_as::<_, VoteRow>(&sql)
            .fetch_optional(self.database.pool())
            .await?;
        Ok(row.map(VoteRecord::from))
    }

    /// Every record in chain order.
    pub async fn records(&self) -> Result<Vec<VoteRecord>, MonitorError> {
        let sql = format!("SELECT {} FROM votes ORDER BY vote_id ASC", VOTE_COLUMNS);
        let rows = sqlx::query_as::<_, VoteRow>(&sql)
            .fetch_all(self.database.pool())
            .await?;
        Ok(rows.into_iter().map(VoteRecord::from).collect())
    }

    /// Records whose position belongs to `election_id`, in chain order.
    pub async fn election_records(&self, election_id: i64) -> Result<Vec<VoteRecord>, MonitorError> {
        Ok(self
            .election_links(election_id)
            .await?
            .into_iter()
            .map(|(record, _)| record)
            .collect())
    }

    async fn election_links(
        &self,
        election_id: i64,
    ) -> Result<Vec<(VoteRecord, Option<VoteRecord>)>, MonitorError> {
        let rows = sqlx::query_as::<_, LinkRow>(
            r#"
            SELECT v.vote_id, v.voter_id, v.position_id, v.candidate_id, v.timestamp,
                   v.vote_hash, v.previous_vote_hash,
                   p.vote_id AS pred_vote_id, p.voter_id AS pred_voter_id,
                   p.position_id AS pred_position_id, p.candidate_id AS pred_candidate_id,
                   p.timestamp AS pred_timestamp, p.vote_hash AS pred_vote_hash,
                   p.previous_vote_hash AS pred_previous_vote_hash
            FROM votes v
            JOIN positions pos ON pos.position_id = v.position_id
            LEFT JOIN votes p
                ON p.vote_id = (SELECT MAX(q.vote_id) FROM votes q WHERE q.vote_id < v.vote_id)
            WHERE pos.election_id = ?
            ORDER BY v.vote_id ASC
            "#,
        )
        .bind(election_id)
        .fetch_all(self.database.pool())
        .await?;

        Ok(rows.into_iter().map(LinkRow::split).collect())
    }

    /// Verify the votes of one election against their global chain predecessors.
    /// Read-only; safe to run next to concurrent appends.
    pub async fn verify_election(&self, election_id: i64) -> Result<ChainReport, MonitorError> {
        let links = self.election_links(election_id).await?;
        let tampered = find_tampered(links.iter().map(|(r, p)| (r, p.as_ref())));

        if tampered.is_empty() {
            info!("Election {} chain verified: {} votes", election_id, links.len());
        } else {
            warn!(
                "Election {} chain verification flagged {} vote(s): {:?}",
                election_id,
                tampered.len(),
                tampered
            );
        }

        Ok(ChainReport::new(Some(election_id), links.len(), tampered))
    }

    /// Verify the whole ledger, including identifier gaps left by deletions.
    pub async fn verify_all(&self) -> Result<ChainReport, MonitorError> {
        let records = self.records().await?;
        let tampered = verify_chain(&records);
        let highest_issued = self.highest_issued_id().await?;
        let gaps = detect_gaps(&records, highest_issued);

        let report = ChainReport::new(None, records.len(), tampered).with_gaps(gaps);
        if report.is_intact() {
            info!("Ledger chain verified: {} votes", report.checked);
        } else {
            warn!("{}", report.summary());
        }
        Ok(report)
    }

    /// Largest identifier AUTOINCREMENT ever issued for `votes`.
    async fn highest_issued_id(&self) -> Result<Option<i64>, MonitorError> {
        let seq = sqlx::query_scalar::<_, i64>(
            "SELECT seq FROM sqlite_sequence WHERE name = 'votes'",
        )
        .fetch_optional(self.database.pool())
        .await?;
        Ok(seq)
    }

    pub async fn count(&self) -> Result<i64, MonitorError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM votes")
            .fetch_one(self.database.pool())
            .await?;
        Ok(count)
    }
}
