//! Chain Verification
//!
//! Recomputes vote digests and reports the records whose link into the chain no longer
//! holds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ledger::record::{VoteRecord, GENESIS_PREVIOUS_HASH};

/// Check one record against its global chain predecessor.
///
/// The predecessor may be accepted by its stored digest or by the digest recomputed from
/// its own fields, so an edit to either the fields or the digest of one record is reported
/// on that record only. A record whose predecessor vanished no longer matches either.
pub fn link_is_valid(record: &VoteRecord, predecessor: Option<&VoteRecord>) -> bool {
    let accepted: Vec<String> = match predecessor {
        None => vec![GENESIS_PREVIOUS_HASH.to_string()],
        Some(prev) => {
            let stored = prev.commit_hash.clone();
            let recomputed = prev.recompute_hash(&prev.previous_hash);
            if stored == recomputed {
                vec![stored]
            } else {
                vec![stored, recomputed]
            }
        }
    };

    if !accepted.iter().any(|hash| *hash == record.previous_hash) {
        return false;
    }

    accepted
        .iter()
        .any(|hash| record.recompute_hash(hash) == record.commit_hash)
}

/// Identifiers of records that fail [`link_is_valid`], in input order.
pub fn find_tampered<'a, I>(links: I) -> Vec<i64>
where
    I: IntoIterator<Item = (&'a VoteRecord, Option<&'a VoteRecord>)>,
{
    links
        .into_iter()
        .filter(|(record, predecessor)| !link_is_valid(record, *predecessor))
        .map(|(record, _)| record.vote_id)
        .collect()
}

/// Verify a contiguous chain ordered by identifier, starting at the first record ever
/// appended.
pub fn verify_chain(records: &[VoteRecord]) -> Vec<i64> {
    find_tampered(
        records
            .iter()
            .enumerate()
            .map(|(i, record)| (record, if i == 0 { None } else { Some(&records[i - 1]) })),
    )
}

/// Identifiers missing between two consecutive records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdGap {
    pub after_vote_id: i64,
    pub before_vote_id: Option<i64>,
    pub missing: i64,
}

/// Identifier gaps in a whole-ledger listing. `highest_issued` is the largest identifier
/// the store ever handed out, which exposes deletions at the tail.
pub fn detect_gaps(records: &[VoteRecord], highest_issued: Option<i64>) -> Vec<IdGap> {
    let mut gaps = Vec::new();
    let mut expected_next = 1;

    for record in records {
        if record.vote_id > expected_next {
            gaps.push(IdGap {
                after_vote_id: expected_next - 1,
                before_vote_id: Some(record.vote_id),
                missing: record.vote_id - expected_next,
            });
        }
        expected_next = record.vote_id + 1;
    }

    if let Some(highest) = highest_issued {
        if highest >= expected_next {
            gaps.push(IdGap {
                after_vote_id: expected_next - 1,
                before_vote_id: None,
                missing: highest - expected_next + 1,
            });
        }
    }

    gaps
}

/// Result of a verification pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainReport {
    /// `None` for a whole-ledger pass.
    pub election_id: Option<i64>,
    pub checked: usize,
    pub tampered: Vec<i64>,
    pub gaps: Vec<IdGap>,
    pub verified_at: DateTime<Utc>,
}

impl ChainReport {
    pub fn new(election_id: Option<i64>, checked: usize, tampered: Vec<i64>) -> Self {
        Self {
            election_id,
            checked,
            tampered,
            gaps: Vec::new(),
            verified_at: Utc::now(),
        }
    }

    pub fn with_gaps(mut self, gaps: Vec<IdGap>) -> Self {
        self.gaps = gaps;
        self
    }

    pub fn is_intact(&self) -> bool {
        self.tampered.is_empty() && self.gaps.is_empty()
    }

    pub fn scope(&self) -> String {
        match self.election_id {
            Some(id) => format!("election {}", id),
            None => "ledger".to_string(),
        }
    }

    pub fn summary(&self) -> String {
        if self.is_intact() {
            format!("✅ {} chain intact ({} votes)", self.scope(), self.checked)
        } else {
            let missing: i64 = self.gaps.iter().map(|g| g.missing).sum();
            format!(
                "❌ {} chain broken ({} votes): tampered {:?}, {} missing identifier(s)",
                self.scope(),
                self.checked,
                self.tampered,
                missing
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::record::compute_commit_hash;

    fn build_chain(n: i64) -> Vec<VoteRecord> {
        let mut records: Vec<VoteRecord> = Vec::new();
        for i in 1..=n {
            let previous_hash = records
                .last()
                .map(|r| r.commit_hash.clone())
                .unwrap_or_default();
            let timestamp = format!("2025-03-01T09:{:02}:00.000000+00:00", i);
            let commit_hash = compute_commit_hash(i, 1, 10 + i % 2, &timestamp, &previous_hash);
            records.push(VoteRecord {
                vote_id: i,
                voter_id: i,
                position_id: 1,
                candidate_id: 10 + i % 2,
                timestamp,
                commit_hash,
                previous_hash,
            });
        }
        records
    }

    #[test]
    fn test_untouched_chain_is_clean() {
        let chain = build_chain(6);
        assert!(verify_chain(&chain).is_empty());
        assert!(verify_chain(&[]).is_empty());
    }

    #[test]
    fn test_altered_digest_flagged_once() {
        let mut chain = build_chain(5);
        chain[2].commit_hash = "f".repeat(64);
        assert_eq!(verify_chain(&chain), vec![3]);
    }

    #[test]
    fn test_altered_field_flagged_once() {
        let mut chain = build_chain(5);
        chain[1].candidate_id = 99;
        assert_eq!(verify_chain(&chain), vec![2]);
    }

    #[test]
    fn test_altered_previous_link_flagged() {
        let mut chain = build_chain(4);
        chain[2].previous_hash = "0".repeat(64);
        assert_eq!(verify_chain(&chain), vec![3]);
    }

    #[test]
    fn test_deleted_record_flags_successor() {
        let mut chain = build_chain(5);
        chain.remove(2);
        assert_eq!(verify_chain(&chain), vec![4]);
    }

    #[test]
    fn test_deleted_first_record_flags_new_head() {
        let mut chain = build_chain(3);
        chain.remove(0);
        assert_eq!(verify_chain(&chain), vec![2]);
    }

    #[test]
    fn test_rewritten_record_flags_successor() {
        let mut chain = build_chain(4);
        // Field edit with a freshly computed digest keeps record 2 self-consistent.
        chain[1].candidate_id = 77;
        chain[1].commit_hash = chain[1].recompute_hash(&chain[1].previous_hash);
        assert_eq!(verify_chain(&chain), vec![3]);
    }

    #[test]
    fn test_detect_gaps() {
        let mut chain = build_chain(6);
        chain.remove(3);
        chain.remove(1);
        let gaps = detect_gaps(&chain, Some(8));
        assert_eq!(gaps.len(), 3);
        assert_eq!(gaps[0].after_vote_id, 1);
        assert_eq!(gaps[0].before_vote_id, Some(3));
        assert_eq!(gaps[1].missing, 1);
        assert_eq!(gaps[2].before_vote_id, None);
        assert_eq!(gaps[2].missing, 2);

        assert!(detect_gaps(&build_chain(3), Some(3)).is_empty());
    }

    #[test]
    fn test_report_summary() {
        let report = ChainReport::new(Some(4), 10, vec![]);
        assert!(report.is_intact());
        assert!(report.summary().contains("election 4 chain intact"));

        let broken = ChainReport::new(None, 3, vec![2]);
        assert!(!broken.is_intact());
        assert!(broken.summary().contains("ledger chain broken"));
    }
}
