use sqlx::SqlitePool;

use crate::database::models::ChangeRow;
use crate::error::MonitorError;

pub struct Queries;

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

impl Queries {
    pub async fn running_voter_emails(pool: &SqlitePool) -> Result<Vec<String>, MonitorError> {
        let emails = sqlx::query_scalar::<_, String>(
            r#"
            SELECT DISTINCT v.email
            FROM election_voters ev
            JOIN voters v ON ev.voter_id = v.voter_id
            JOIN elections e ON ev.election_id = e.election_id
            WHERE e.status = 'running' AND ev.is_approved = 1 AND v.email <> ''
            ORDER BY v.email
            "#,
        )
        .fetch_all(pool)
        .await?;
        Ok(emails)
    }

    pub async fn table_columns(pool: &SqlitePool, table: &str) -> Result<Vec<String>, MonitorError> {
        let columns = sqlx::query_scalar::<_, String>(
            "SELECT name FROM pragma_table_info(?) ORDER BY cid",
        )
        .bind(table)
        .fetch_all(pool)
        .await?;
        Ok(columns)
    }

    /// Every row of `table` as a JSON object text, in storage order.
    pub async fn table_rows_json(pool: &SqlitePool, table: &str) -> Result<Vec<String>, MonitorError> {
        let columns = Self::table_columns(pool, table).await?;
        if columns.is_empty() {
            return Err(MonitorError::SnapshotError(format!(
                "Table {} does not exist or has no columns",
                table
            )));
        }

        let pairs = columns
            .iter()
            .map(|c| format!("{}, {}", quote_literal(c), quote_identifier(c)))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT json_object({}) FROM {}",
            pairs,
            quote_identifier(table)
        );

        let rows = sqlx::query_scalar::<_, String>(&sql).fetch_all(pool).await?;
        Ok(rows)
    }

    pub async fn max_change_id(pool: &SqlitePool) -> Result<i64, MonitorError> {
        let id: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(change_id), 0) FROM vote_changes")
            .fetch_one(pool)
            .await?;
        Ok(id)
    }

    pub async fn load_cursor(
        pool: &SqlitePool,
        subscriber_id: &str,
    ) -> Result<Option<i64>, MonitorError> {
        let cursor = sqlx::query_scalar::<_, i64>(
            "SELECT last_change_id FROM change_cursors WHERE subscriber_id = ?",
        )
        .bind(subscriber_id)
        .fetch_optional(pool)
        .await?;
        Ok(cursor)
    }

    pub async fn save_cursor(
        pool: &SqlitePool,
        subscriber_id: &str,
        last_change_id: i64,
    ) -> Result<(), MonitorError> {
        sqlx::query(
            r#"
            INSERT INTO change_cursors (subscriber_id, last_change_id)
            VALUES (?, ?)
            ON CONFLICT (subscriber_id) DO UPDATE SET
                last_change_id = excluded.last_change_id,
                updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
            "#,
        )
        .bind(subscriber_id)
        .bind(last_change_id)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn changes_after(
        pool: &SqlitePool,
        table: &str,
        after_change_id: i64,
        limit: i64,
    ) -> Result<Vec<ChangeRow>, MonitorError> {
        let rows = sqlx::query_as::<_, ChangeRow>(
            r#"
            SELECT change_id, table_name, operation, row_id, before_values, after_values, changed_at
            FROM vote_changes
            WHERE change_id > ? AND table_name = ?
            ORDER BY change_id ASC
            LIMIT ?
            "#,
        )
        .bind(after_change_id)
        .bind(table)
        .bind(limit)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_quoting() {
        assert_eq!(quote_identifier("votes"), "\"votes\"");
        assert_eq!(quote_identifier("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(quote_literal("it's"), "'it''s'");
    }
}
