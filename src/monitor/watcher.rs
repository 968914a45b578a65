//! Change-Stream Watcher
//!
//! Follows the row-level change feed of the votes table and raises an alert for every
//! UPDATE or DELETE. Inserts are cast votes and pass through silently.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::alerts::{AlertRecorder, AlertSource};
use crate::config::WatcherConfig;
use crate::database::models::ChangeRow;
use crate::database::queries::Queries;
use crate::database::Database;
use crate::error::MonitorError;

const BATCH_SIZE: i64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RowOperation {
    Insert,
    Update,
    Delete,
}

impl RowOperation {
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "INSERT" => Some(RowOperation::Insert),
            "UPDATE" => Some(RowOperation::Update),
            "DELETE" => Some(RowOperation::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for RowOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowOperation::Insert => write!(f, "INSERT"),
            RowOperation::Update => write!(f, "UPDATE"),
            RowOperation::Delete => write!(f, "DELETE"),
        }
    }
}

/// One row-level change from the feed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowEvent {
    pub change_id: i64,
    pub table: String,
    pub operation: RowOperation,
    pub row_id: i64,
    pub before: Option<Value>,
    pub after: Option<Value>,
    pub changed_at: String,
}

impl RowEvent {
    /// Cast votes are immutable, so any UPDATE or DELETE is tampering.
    pub fn is_tampering(&self) -> bool {
        matches!(self.operation, RowOperation::Update | RowOperation::Delete)
    }

    pub fn describe(&self) -> String {
        let show = |v: &Option<Value>| v.as_ref().map(Value::to_string).unwrap_or_default();
        match self.operation {
            RowOperation::Update => format!(
                "UPDATE on {} row {} at {}: before={} after={}",
                self.table,
                self.row_id,
                self.changed_at,
                show(&self.before),
                show(&self.after)
            ),
            RowOperation::Delete => format!(
                "DELETE on {} row {} at {}: values={}",
                self.table,
                self.row_id,
                self.changed_at,
                show(&self.before)
            ),
            RowOperation::Insert => format!(
                "INSERT on {} row {} at {}",
                self.table, self.row_id, self.changed_at
            ),
        }
    }
}

fn parse_image(change_id: i64, text: Option<String>) -> Result<Option<Value>, MonitorError> {
    text.map(|t| serde_json::from_str(&t))
        .transpose()
        .map_err(|e| MonitorError::StreamError(format!("Malformed row image in change {}: {}", change_id, e)))
}

impl TryFrom<ChangeRow> for RowEvent {
    type Error = MonitorError;

    fn try_from(row: ChangeRow) -> Result<Self, Self::Error> {
        let operation = RowOperation::parse(&row.operation).ok_or_else(|| {
            MonitorError::StreamError(format!(
                "Unknown operation {} in change {}",
                row.operation, row.change_id
            ))
        })?;

        Ok(RowEvent {
            change_id: row.change_id,
            table: row.table_name,
            operation,
            row_id: row.row_id,
            before: parse_image(row.change_id, row.before_values)?,
            after: parse_image(row.change_id, row.after_values)?,
            changed_at: row.changed_at,
        })
    }
}

/// Feed entry that could not be decoded into a [`RowEvent`].
#[derive(Debug, Clone, Serialize)]
pub struct MalformedChange {
    pub error: String,
    pub raw: ChangeRow,
}

impl MalformedChange {
    pub fn describe(&self) -> String {
        format!(
            "Unparseable change event #{} on {}: {}",
            self.raw.change_id, self.raw.table_name, self.error
        )
    }
}

/// What a change stream yields: decoded events, plus the entries that failed to decode so
/// the cursor can still move past them.
#[derive(Debug, Clone)]
pub enum ChangeEvent {
    Row(RowEvent),
    Malformed(MalformedChange),
}

impl ChangeEvent {
    pub fn change_id(&self) -> i64 {
        match self {
            ChangeEvent::Row(event) => event.change_id,
            ChangeEvent::Malformed(malformed) => malformed.raw.change_id,
        }
    }

    pub fn as_row(&self) -> Option<&RowEvent> {
        match self {
            ChangeEvent::Row(event) => Some(event),
            ChangeEvent::Malformed(_) => None,
        }
    }
}

impl From<ChangeRow> for ChangeEvent {
    fn from(row: ChangeRow) -> Self {
        match RowEvent::try_from(row.clone()) {
            Ok(event) => ChangeEvent::Row(event),
            Err(e) => ChangeEvent::Malformed(MalformedChange {
                error: e.to_string(),
                raw: row,
            }),
        }
    }
}

#[async_trait]
pub trait ChangeSource: Send + Sync {
    async fn subscribe(&self) -> Result<Box<dyn ChangeStream>, MonitorError>;
}

#[async_trait]
pub trait ChangeStream: Send {
    /// Block until at least one event past the committed position is available.
    async fn next_events(&mut self) -> Result<Vec<ChangeEvent>, MonitorError>;

    /// Mark everything up to `change_id` as handled.
    async fn commit(&mut self, change_id: i64) -> Result<(), MonitorError>;
}

/// Change feed kept in `vote_changes` by triggers, polled per subscriber.
pub struct SqliteChangeSource {
    database: Database,
    subscriber_id: String,
    table: String,
    poll_interval: Duration,
}

impl SqliteChangeSource {
    pub fn new(database: Database, config: &WatcherConfig) -> Self {
        Self {
            database,
            subscriber_id: config.subscriber_id.clone(),
            table: config.table.clone(),
            poll_interval: config.poll_interval(),
        }
    }
}

#[async_trait]
impl ChangeSource for SqliteChangeSource {
    async fn subscribe(&self) -> Result<Box<dyn ChangeStream>, MonitorError> {
        let pool = self.database.pool();
        let position = match Queries::load_cursor(pool, &self.subscriber_id).await? {
            Some(position) => position,
            None => {
                // A new subscriber starts at the end of the feed.
                let head = Queries::max_change_id(pool).await?;
                Queries::save_cursor(pool, &self.subscriber_id, head).await?;
                head
            }
        };

        info!(
            "Subscriber {} following {} changes after #{}",
            self.subscriber_id, self.table, position
        );

        Ok(Box::new(SqliteChangeStream {
            database: self.database.clone(),
            subscriber_id: self.subscriber_id.clone(),
            table: self.table.clone(),
            poll_interval: self.poll_interval,
            position,
        }))
    }
}

struct SqliteChangeStream {
    database: Database,
    subscriber_id: String,
    table: String,
    poll_interval: Duration,
    position: i64,
}

#[async_trait]
impl ChangeStream for SqliteChangeStream {
    async fn next_events(&mut self) -> Result<Vec<ChangeEvent>, MonitorError> {
        loop {
            let rows =
                Queries::changes_after(self.database.pool(), &self.table, self.position, BATCH_SIZE)
                    .await?;
            if !rows.is_empty() {
                return Ok(rows.into_iter().map(ChangeEvent::from).collect());
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn commit(&mut self, change_id: i64) -> Result<(), MonitorError> {
        Queries::save_cursor(self.database.pool(), &self.subscriber_id, change_id).await?;
        self.position = change_id;
        Ok(())
    }
}

pub struct ChangeWatcher {
    source: Arc<dyn ChangeSource>,
    recorder: AlertRecorder,
    backoff: Duration,
}

impl ChangeWatcher {
    pub fn new(source: Arc<dyn ChangeSource>, recorder: AlertRecorder, backoff: Duration) -> Self {
        Self {
            source,
            recorder,
            backoff,
        }
    }

    /// Follow the feed until `shutdown` fires, resubscribing after every failure.
    pub async fn run(self, shutdown: CancellationToken) {
        info!("Change-stream watcher started");

        'subscribe: loop {
            let subscribed = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break 'subscribe,
                result = self.source.subscribe() => result,
            };

            match subscribed {
                Ok(mut stream) => loop {
                    let batch = tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => break 'subscribe,
                        result = stream.next_events() => result,
                    };

                    let events = match batch {
                        Ok(events) => events,
                        Err(e) => {
                            e.log_failure("Change stream read failed");
                            break;
                        }
                    };

                    self.handle_events(&events).await;
                    if let Some(last) = events.last().map(ChangeEvent::change_id) {
                        if let Err(e) = stream.commit(last).await {
                            e.log_failure(&format!("Failed to commit change cursor at #{}", last));
                            break;
                        }
                    }
                },
                Err(e) => e.log_failure("Change stream subscription failed"),
            }

            warn!("Reconnecting to change stream in {}s", self.backoff.as_secs());
            tokio::select! {
                _ = shutdown.cancelled() => break 'subscribe,
                _ = tokio::time::sleep(self.backoff) => {}
            }
        }

        info!("Change-stream watcher stopped");
    }

    /// Raise one alert per UPDATE, DELETE or undecodable entry. Returns the number raised.
    pub async fn handle_events(&self, events: &[ChangeEvent]) -> usize {
        let mut raised = 0;
        for event in events {
            let event = match event {
                ChangeEvent::Row(event) => event,
                ChangeEvent::Malformed(malformed) => {
                    let reason = malformed.describe();
                    warn!("⚠️ {}", reason);
                    let detail = serde_json::to_string_pretty(malformed)
                        .unwrap_or_else(|_| format!("{:?}", malformed.raw));
                    self.recorder
                        .raise(AlertSource::ChangeStream, &reason, &detail)
                        .await;
                    raised += 1;
                    continue;
                }
            };

            if !event.is_tampering() {
                debug!("Ignoring {} on {} row {}", event.operation, event.table, event.row_id);
                continue;
            }

            let reason = event.describe();
            warn!("⚠️ Detected {}", reason);
            let detail = serde_json::to_string_pretty(event).unwrap_or_else(|_| reason.clone());
            self.recorder
                .raise(AlertSource::ChangeStream, &reason, &detail)
                .await;
            raised += 1;
        }
        raised
    }
}
