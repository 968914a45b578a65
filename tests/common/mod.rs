#![allow(dead_code)]

use chrono::{Duration, TimeZone, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use vote_guard::database::Database;
use vote_guard::ledger::{Ledger, VoteRecord};

/// In-memory SQLite database with every migration applied.
pub async fn setup_test_db() -> Database {
    let db = Database::new_in_memory()
        .await
        .expect("Failed to create test database");
    db.run_migrations().await.expect("Failed to run migrations");
    db
}

pub async fn create_voter(db: &Database, name: &str, email: &str) -> i64 {
    sqlx::query("INSERT INTO voters (name, email, password_hash) VALUES (?, ?, 'test-hash')")
        .bind(name)
        .bind(email)
        .execute(db.pool())
        .await
        .expect("Failed to insert voter")
        .last_insert_rowid()
}

pub async fn create_election(db: &Database, name: &str, status: &str) -> i64 {
    sqlx::query(
        r#"
        INSERT INTO elections (election_name, start_date, end_date, candidate_deadline, status)
        VALUES (?, '2025-03-01T08:00:00Z', '2025-03-08T20:00:00Z', '2025-02-20T23:59:59Z', ?)
        "#,
    )
    .bind(name)
    .bind(status)
    .execute(db.pool())
    .await
    .expect("Failed to insert election")
    .last_insert_rowid()
}

pub async fn create_position(db: &Database, election_id: i64, name: &str) -> i64 {
    sqlx::query("INSERT INTO positions (election_id, position_name) VALUES (?, ?)")
        .bind(election_id)
        .bind(name)
        .execute(db.pool())
        .await
        .expect("Failed to insert position")
        .last_insert_rowid()
}

pub async fn create_candidate(db: &Database, position_id: i64, name: &str) -> i64 {
    sqlx::query(
        "INSERT INTO candidates (position_id, candidate_name, is_approved) VALUES (?, ?, 1)",
    )
    .bind(position_id)
    .bind(name)
    .execute(db.pool())
    .await
    .expect("Failed to insert candidate")
    .last_insert_rowid()
}

pub async fn register_voter(db: &Database, election_id: i64, voter_id: i64, approved: bool) {
    sqlx::query("INSERT INTO election_voters (election_id, voter_id, is_approved) VALUES (?, ?, ?)")
        .bind(election_id)
        .bind(voter_id)
        .bind(approved)
        .execute(db.pool())
        .await
        .expect("Failed to register voter");
}

/// One election with a single position and two candidates.
pub struct ElectionFixture {
    pub election_id: i64,
    pub position_id: i64,
    pub candidates: [i64; 2],
}

pub async fn create_election_fixture(db: &Database, name: &str) -> ElectionFixture {
    let election_id = create_election(db, name, "running").await;
    let position_id = create_position(db, election_id, "Chair").await;
    let first = create_candidate(db, position_id, "Candidate A").await;
    let second = create_candidate(db, position_id, "Candidate B").await;
    ElectionFixture {
        election_id,
        position_id,
        candidates: [first, second],
    }
}

/// Deterministic, strictly increasing vote timestamps.
pub fn vote_time(n: i64) -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap() + Duration::seconds(n)
}

static VOTER_SEQ: AtomicUsize = AtomicUsize::new(0);

/// Create `count` voters and cast one vote each in `fixture`.
pub async fn cast_votes(db: &Database, ledger: &Ledger, fixture: &ElectionFixture, count: usize) -> Vec<VoteRecord> {
    let mut records = Vec::with_capacity(count);
    for i in 0..count {
        let email = format!("voter{}@example.org", VOTER_SEQ.fetch_add(1, Ordering::Relaxed));
        let voter_id = create_voter(db, &format!("Voter {}", i), &email).await;
        register_voter(db, fixture.election_id, voter_id, true).await;
        let record = ledger
            .append(
                voter_id,
                fixture.position_id,
                fixture.candidates[i % 2],
                vote_time(records.len() as i64),
            )
            .await
            .expect("Failed to append vote");
        records.push(record);
    }
    records
}
