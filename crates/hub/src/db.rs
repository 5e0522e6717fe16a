use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{error, info, warn};

use crate::store::{SharedStore, SubscriptionId, Value};

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

/// One recorded value of a store key.
#[derive(Debug, Clone, Serialize)]
pub struct HistorySample {
    pub ts: i64,
    pub key: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub value: serde_json::Value,
}

/// Time window and size limit for a history query. Timestamps are unix
/// seconds, both ends inclusive.
#[derive(Debug, Clone, Copy)]
pub struct HistoryRange {
    pub from: Option<i64>,
    pub to: Option<i64>,
    pub limit: i64,
}

impl Default for HistoryRange {
    fn default() -> Self {
        Self {
            from: None,
            to: None,
            limit: 500,
        }
    }
}

pub fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/hydro/history.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        // Every connection to an in-memory database gets its own empty copy.
        let max_connections = if db_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Telemetry history
    // ----------------------------

    pub async fn insert_sample(&self, ts: i64, key: &str, value: &Value) -> Result<()> {
        let kind = value.kind().name();
        let json = value.to_json().to_string();
        sqlx::query("INSERT INTO telemetry (ts, key, type, value) VALUES (?, ?, ?, ?)")
            .bind(ts)
            .bind(key)
            .bind(kind)
            .bind(json)
            .execute(&self.pool)
            .await
            .context("insert_sample failed")?;
        Ok(())
    }

    /// Newest samples first.
    pub async fn query_history(
        &self,
        key: &str,
        range: HistoryRange,
    ) -> Result<Vec<HistorySample>> {
        let rows: Vec<(i64, String, String, String)> = sqlx::query_as(
            r#"
            SELECT ts, key, type, value
            FROM telemetry
            WHERE key = ?
              AND ts >= ?
              AND ts <= ?
            ORDER BY ts DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(key)
        .bind(range.from.unwrap_or(i64::MIN))
        .bind(range.to.unwrap_or(i64::MAX))
        .bind(range.limit)
        .fetch_all(&self.pool)
        .await
        .context("query_history failed")?;

        Ok(rows
            .into_iter()
            .map(|(ts, key, kind, value)| HistorySample {
                ts,
                key,
                kind,
                value: serde_json::from_str(&value).unwrap_or(serde_json::Value::Null),
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Recorder
// ---------------------------------------------------------------------------

/// Samples waiting for the writer task. Beyond this, new samples are dropped.
const HISTORY_QUEUE: usize = 1024;

/// Mirror every change of `keys` into the history table. Store callbacks
/// only enqueue; a background task does the writes.
pub fn record_history(db: Db, store: &SharedStore, keys: &[String]) -> Vec<SubscriptionId> {
    spawn_recorder(db, store, keys, HISTORY_QUEUE)
}

fn spawn_recorder(
    db: Db,
    store: &SharedStore,
    keys: &[String],
    capacity: usize,
) -> Vec<SubscriptionId> {
    let (tx, mut rx) = mpsc::channel::<(i64, String, Value)>(capacity);

    let subscriptions = keys
        .iter()
        .map(|key| {
            let tx = tx.clone();
            store.subscribe(key, move |key, value| {
                // A closed queue means shutdown.
                let sample = (now_unix(), key.to_owned(), value.clone());
                if let Err(TrySendError::Full(_)) = tx.try_send(sample) {
                    warn!(key, "history: queue full, sample dropped");
                }
            })
        })
        .collect();

    tokio::spawn(async move {
        while let Some((ts, key, value)) = rx.recv().await {
            if let Err(e) = db.insert_sample(ts, &key, &value).await {
                error!(key = %key, error = %format!("{e:#}"), "history: insert failed");
            }
        }
    });

    info!(keys = keys.len(), "history: recording");
    subscriptions
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use std::sync::Arc;
    use std::time::Duration;

    async fn memory_db() -> Db {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db
    }

    #[tokio::test]
    async fn insert_and_query_round_trip() {
        let db = memory_db().await;
        db.insert_sample(100, "waterLevel.telem.value", &Value::Float(41.5))
            .await
            .unwrap();
        db.insert_sample(101, "waterLevel.telem.value", &Value::Float(40.0))
            .await
            .unwrap();
        db.insert_sample(101, "pump.telem.value", &Value::Bool(true))
            .await
            .unwrap();

        let rows = db
            .query_history("waterLevel.telem.value", HistoryRange::default())
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].ts, 101);
        assert_eq!(rows[0].kind, "float");
        assert_eq!(rows[0].value, serde_json::json!(40.0));
    }

    #[tokio::test]
    async fn query_respects_window_and_limit() {
        let db = memory_db().await;
        for ts in 0..10 {
            db.insert_sample(ts, "k", &Value::Int(ts)).await.unwrap();
        }

        let rows = db
            .query_history(
                "k",
                HistoryRange {
                    from: Some(3),
                    to: Some(7),
                    limit: 2,
                },
            )
            .await
            .unwrap();
        let ts: Vec<i64> = rows.iter().map(|r| r.ts).collect();
        assert_eq!(ts, vec![7, 6]);
    }

    #[tokio::test]
    async fn recorder_mirrors_store_writes() {
        let db = memory_db().await;
        let store: SharedStore = Arc::new(Store::new());
        let keys = vec!["pump.telem.value".to_string()];
        let _subs = record_history(db.clone(), &store, &keys);

        store.set("pump.telem.value", true);
        store.set("pump.telem.value", true);
        store.set("lamp.telem.value", true);

        let mut rows = Vec::new();
        for _ in 0..50 {
            rows = db
                .query_history("pump.telem.value", HistoryRange::default())
                .await
                .unwrap();
            if !rows.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value, serde_json::json!(true));

        let lamp = db
            .query_history("lamp.telem.value", HistoryRange::default())
            .await
            .unwrap();
        assert!(lamp.is_empty());
    }

    #[tokio::test]
    async fn full_queue_drops_samples() {
        let db = memory_db().await;
        let store: SharedStore = Arc::new(Store::new());
        let keys = vec!["waterLevel.telem.value".to_string()];
        let _subs = spawn_recorder(db.clone(), &store, &keys, 1);

        // The writer task cannot run before the next await.
        for level in [10.0, 20.0, 30.0, 40.0] {
            store.set("waterLevel.telem.value", level);
        }

        let mut rows = Vec::new();
        for _ in 0..50 {
            rows = db
                .query_history("waterLevel.telem.value", HistoryRange::default())
                .await
                .unwrap();
            if !rows.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        let rows_after = db
            .query_history("waterLevel.telem.value", HistoryRange::default())
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows_after.len(), 1);
        assert_eq!(rows_after[0].value, serde_json::json!(10.0));
    }
}
