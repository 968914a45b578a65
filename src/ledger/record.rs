//! Vote Record
//!
//! A single ballot and the digest that links it into the chain.

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::database::models::VoteRow;

/// `previous_hash` of the first record in the store.
pub const GENESIS_PREVIOUS_HASH: &str = "";

/// Cast vote with its chain digests. Never mutated once persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRecord {
    pub vote_id: i64,
    pub voter_id: i64,
    pub position_id: i64,
    pub candidate_id: i64,
    /// ISO 8601 text exactly as stored and hashed.
    pub timestamp: String,
    pub commit_hash: String,
    pub previous_hash: String,
}

/// RFC 3339 with microseconds and an explicit `+00:00` offset.
pub fn canonical_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp
        .trunc_subsecs(6)
        .to_rfc3339_opts(SecondsFormat::Micros, false)
}

/// Digest input: the vote fields and the predecessor digest joined with `-`.
pub fn commit_preimage(
    voter_id: i64,
    position_id: i64,
    candidate_id: i64,
    timestamp: &str,
    previous_hash: &str,
) -> String {
    format!(
        "{}-{}-{}-{}-{}",
        voter_id, position_id, candidate_id, timestamp, previous_hash
    )
}

/// SHA-256 of the preimage, lowercase hex.
pub fn compute_commit_hash(
    voter_id: i64,
    position_id: i64,
    candidate_id: i64,
    timestamp: &str,
    previous_hash: &str,
) -> String {
    let preimage = commit_preimage(voter_id, position_id, candidate_id, timestamp, previous_hash);
    let mut hasher = Sha256::new();
    hasher.update(preimage.as_bytes());
    hex::encode(hasher.finalize())
}

impl VoteRecord {
    /// Digest of this record's fields chained onto `previous_hash`.
    pub fn recompute_hash(&self, previous_hash: &str) -> String {
        compute_commit_hash(
            self.voter_id,
            self.position_id,
            self.candidate_id,
            &self.timestamp,
            previous_hash,
        )
    }

    /// True when the stored digest matches the fields and the stored predecessor link.
    pub fn verify_hash(&self) -> bool {
        self.commit_hash == self.recompute_hash(&self.previous_hash)
    }

    pub fn timestamp_utc(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.timestamp)
            .ok()
            .map(|ts| ts.with_timezone(&Utc))
    }

    pub fn summary(&self) -> String {
        format!(
            "vote {} (voter {}, position {}, candidate {}) {}",
            self.vote_id,
            self.voter_id,
            self.position_id,
            self.candidate_id,
            self.commit_hash
        )
    }
}

impl From<VoteRow> for VoteRecord {
    fn from(row: VoteRow) -> Self {
        Self {
            vote_id: row.vote_id,
            voter_id: row.voter_id,
            position_id: row.position_id,
            candidate_id: row.candidate_id,
            timestamp: row.timestamp,
            commit_hash: row.vote_hash,
            previous_hash: row.previous_vote_hash,
        }
    }
}
