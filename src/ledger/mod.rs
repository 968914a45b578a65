//! Vote Ledger
//!
//! Hash-chained, append-only vote records. Every vote commits to the digest of the
//! vote appended before it anywhere in the store, so a single deleted, reordered or
//! edited record breaks verification.

pub mod record;
pub mod store;
pub mod verify;

pub use record::{canonical_timestamp, compute_commit_hash, VoteRecord, GENESIS_PREVIOUS_HASH};
pub use store::Ledger;
pub use verify::{detect_gaps, find_tampered, link_is_valid, verify_chain, ChainReport, IdGap};
