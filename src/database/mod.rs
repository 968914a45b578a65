pub mod models;
pub mod queries;
pub mod schema;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use crate::database::models::Alert;
use crate::database::queries::Queries;
use crate::error::MonitorError;

/// How long a connection waits on another connection's write lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Ok(Database { pool })
    }

    /// Single-connection in-memory database; the connection never expires so the data lives
    /// as long as the pool.
    pub async fn new_in_memory() -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Ok(Database { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<(), sqlx::Error> {
        for (name, sql) in schema::MIGRATIONS {
            sqlx::raw_sql(sql).execute(&self.pool).await?;
            debug!("Applied migration {}", name);
        }
        info!("Database migrations completed");
        Ok(())
    }

    pub async fn insert_alert(
        &self,
        created_at: DateTime<Utc>,
        source: &str,
        reason: &str,
        detail: &str,
    ) -> Result<Alert, MonitorError> {
        let alert_id = sqlx::query(
            r#"
            INSERT INTO tamper_alerts (created_at, source, reason, detail, acknowledged)
            VALUES (?, ?, ?, ?, 0)
            "#,
        )
        .bind(created_at)
        .bind(source)
        .bind(reason)
        .bind(detail)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        Ok(Alert {
            alert_id,
            created_at,
            source: source.to_string(),
            reason: reason.to_string(),
            detail: detail.to_string(),
            acknowledged: false,
        })
    }

    pub async fn get_alert(&self, alert_id: i64) -> Result<Option<Alert>, MonitorError> {
        let alert = sqlx::query_as::<_, Alert>(
            r#"
            SELECT alert_id, created_at, source, reason, detail, acknowledged
            FROM tamper_alerts
            WHERE alert_id = ?
            "#,
        )
        .bind(alert_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(alert)
    }

    /// Newest first.
    pub async fn list_alerts(&self, only_unacknowledged: bool) -> Result<Vec<Alert>, MonitorError> {
        let alerts = sqlx::query_as::<_, Alert>(
            r#"
            SELECT alert_id, created_at, source, reason, detail, acknowledged
            FROM tamper_alerts
            WHERE (? = 0 OR acknowledged = 0)
            ORDER BY alert_id DESC
            "#,
        )
        .bind(only_unacknowledged)
        .fetch_all(&self.pool)
        .await?;
        Ok(alerts)
    }

    pub async fn acknowledge_alert(&self, alert_id: i64) -> Result<(), MonitorError> {
        let result = sqlx::query("UPDATE tamper_alerts SET acknowledged = 1 WHERE alert_id = ?")
            .bind(alert_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(MonitorError::alert_not_found(alert_id));
        }
        info!("Alert {} acknowledged", alert_id);
        Ok(())
    }

    pub async fn unacknowledged_alert_count(&self) -> Result<i64, MonitorError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM tamper_alerts WHERE acknowledged = 0")
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    /// Distinct emails of approved voters in elections that are currently running.
    pub async fn running_voter_emails(&self) -> Result<Vec<String>, MonitorError> {
        Queries::running_voter_emails(&self.pool).await
    }
}
