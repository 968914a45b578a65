// Bundled migrations, applied in order by `Database::run_migrations`.

pub const VOTING_SCHEMA: &str = include_str!("../../migrations/001_voting_schema.sql");
pub const VOTE_LEDGER_SCHEMA: &str = include_str!("../../migrations/002_vote_ledger.sql");
pub const TAMPER_ALERTS_SCHEMA: &str = include_str!("../../migrations/003_tamper_alerts.sql");

pub const MIGRATIONS: [(&str, &str); 3] = [
    ("001_voting_schema", VOTING_SCHEMA),
    ("002_vote_ledger", VOTE_LEDGER_SCHEMA),
    ("003_tamper_alerts", TAMPER_ALERTS_SCHEMA),
];
