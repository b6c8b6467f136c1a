use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqliteConnection, SqlitePool};

use super::{now_ms, plan_append, started_event, HistoryStore, InstanceHistory, ProviderError};
use crate::{Event, EventKind};

/// SQLite-backed history store.
///
/// One row per event, keyed by `(instance_id, generation, seq)`. The pool is
/// limited to a single connection, which serializes writers and keeps
/// `sqlite::memory:` databases alive for the lifetime of the store.
pub struct SqliteHistoryStore {
    pool: SqlitePool,
}

impl SqliteHistoryStore {
    /// Open (creating if needed) the database at `url`, e.g. `sqlite:/tmp/flows.db`.
    pub async fn new(url: &str) -> Result<Self, ProviderError> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        tracing::debug!(target: "duraflow::providers", url, "sqlite history store ready");
        Ok(store)
    }

    pub async fn new_in_memory() -> Result<Self, ProviderError> {
        Self::new("sqlite::memory:").await
    }

    async fn migrate(&self) -> Result<(), ProviderError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS instances (
                instance_id TEXT PRIMARY KEY,
                orchestration TEXT NOT NULL,
                current_generation INTEGER NOT NULL,
                created_at_ms INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS history (
                instance_id TEXT NOT NULL,
                generation INTEGER NOT NULL,
                seq INTEGER NOT NULL,
                timestamp_ms INTEGER NOT NULL,
                event_type TEXT NOT NULL,
                event_data TEXT NOT NULL,
                PRIMARY KEY (instance_id, generation, seq)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn instance_row(
        conn: &mut SqliteConnection,
        operation: &str,
        instance: &str,
    ) -> Result<(String, u64), ProviderError> {
        let row = sqlx::query("SELECT orchestration, current_generation FROM instances WHERE instance_id = ?")
            .bind(instance)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| ProviderError::not_found(operation, instance))?;
        let orchestration: String = row.try_get("orchestration")?;
        let generation: i64 = row.try_get("current_generation")?;
        Ok((orchestration, generation as u64))
    }

    async fn load(conn: &mut SqliteConnection, instance: &str, generation: u64) -> Result<Vec<Event>, ProviderError> {
        let rows = sqlx::query(
            "SELECT seq, timestamp_ms, event_data FROM history WHERE instance_id = ? AND generation = ? ORDER BY seq",
        )
        .bind(instance)
        .bind(generation as i64)
        .fetch_all(&mut *conn)
        .await?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let seq: i64 = row.try_get("seq")?;
            let timestamp_ms: i64 = row.try_get("timestamp_ms")?;
            let data: String = row.try_get("event_data")?;
            let kind: EventKind = serde_json::from_str(&data).map_err(|e| {
                ProviderError::permanent("read", format!("corrupt event {seq} of '{instance}': {e}"))
            })?;
            events.push(Event::new(seq as u64, timestamp_ms as u64, kind));
        }
        Ok(events)
    }

    async fn insert(
        conn: &mut SqliteConnection,
        instance: &str,
        generation: u64,
        events: &[Event],
    ) -> Result<(), ProviderError> {
        for ev in events {
            let data = serde_json::to_string(&ev.kind)
                .map_err(|e| ProviderError::permanent("append", format!("encode {}: {e}", ev.kind.type_name())))?;
            sqlx::query(
                "INSERT INTO history (instance_id, generation, seq, timestamp_ms, event_type, event_data) VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(instance)
            .bind(generation as i64)
            .bind(ev.seq as i64)
            .bind(ev.timestamp_ms as i64)
            .bind(ev.kind.type_name())
            .bind(data)
            .execute(&mut *conn)
            .await?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl HistoryStore for SqliteHistoryStore {
    async fn create_instance(&self, instance: &str, orchestration: &str, input: &str) -> Result<(), ProviderError> {
        let mut tx = self.pool.begin().await?;
        let exists = sqlx::query("SELECT 1 FROM instances WHERE instance_id = ?")
            .bind(instance)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_some() {
            return Err(ProviderError::already_exists("create_instance", instance));
        }
        let now = now_ms();
        sqlx::query(
            "INSERT INTO instances (instance_id, orchestration, current_generation, created_at_ms) VALUES (?, ?, 1, ?)",
        )
        .bind(instance)
        .bind(orchestration)
        .bind(now as i64)
        .execute(&mut *tx)
        .await?;
        Self::insert(&mut tx, instance, 1, &[started_event(orchestration, input, 1, now)]).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn read(&self, instance: &str) -> Result<InstanceHistory, ProviderError> {
        let mut conn = self.pool.acquire().await?;
        let (_, generation) = Self::instance_row(&mut conn, "read", instance).await?;
        let events = Self::load(&mut conn, instance, generation).await?;
        Ok(InstanceHistory {
            instance: instance.to_string(),
            generation,
            events,
        })
    }

    async fn read_generation(&self, instance: &str, generation: u64) -> Result<Vec<Event>, ProviderError> {
        let mut conn = self.pool.acquire().await?;
        Self::instance_row(&mut conn, "read_generation", instance).await?;
        Self::load(&mut conn, instance, generation).await
    }

    async fn append(&self, instance: &str, generation: u64, events: Vec<EventKind>) -> Result<Vec<u64>, ProviderError> {
        let mut tx = self.pool.begin().await?;
        let (_, current) = Self::instance_row(&mut tx, "append", instance).await?;
        if current != generation {
            return Err(ProviderError::stale_generation("append", instance));
        }
        let existing = Self::load(&mut tx, instance, generation).await?;
        let plan = plan_append(instance, &existing, events, now_ms())?;
        Self::insert(&mut tx, instance, generation, &plan.new_events).await?;
        tx.commit().await?;
        Ok(plan.seqs)
    }

    async fn continue_as_new(&self, instance: &str, generation: u64, new_input: &str) -> Result<u64, ProviderError> {
        let mut tx = self.pool.begin().await?;
        let (orchestration, current) = Self::instance_row(&mut tx, "continue_as_new", instance).await?;
        if current != generation {
            return Err(ProviderError::stale_generation("continue_as_new", instance));
        }
        let existing = Self::load(&mut tx, instance, generation).await?;
        let closing = EventKind::OrchestrationContinuedAsNew {
            new_input: new_input.to_string(),
        };
        let plan = plan_append(instance, &existing, vec![closing], now_ms())?;
        Self::insert(&mut tx, instance, generation, &plan.new_events).await?;

        let next = generation + 1;
        let closed_at = plan.new_events.last().map(|e| e.timestamp_ms).unwrap_or_else(now_ms);
        Self::insert(&mut tx, instance, next, &[started_event(&orchestration, new_input, next, closed_at)]).await?;
        sqlx::query("UPDATE instances SET current_generation = ? WHERE instance_id = ?")
            .bind(next as i64)
            .bind(instance)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM history WHERE instance_id = ? AND generation < ?")
            .bind(instance)
            .bind(generation as i64)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(next)
    }

    async fn list_instances(&self) -> Result<Vec<String>, ProviderError> {
        let rows = sqlx::query("SELECT instance_id FROM instances ORDER BY instance_id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("instance_id").map_err(ProviderError::from))
            .collect()
    }

    async fn list_generations(&self, instance: &str) -> Result<Vec<u64>, ProviderError> {
        let mut conn = self.pool.acquire().await?;
        Self::instance_row(&mut conn, "list_generations", instance).await?;
        let rows = sqlx::query("SELECT DISTINCT generation FROM history WHERE instance_id = ? ORDER BY generation")
            .bind(instance)
            .fetch_all(&mut *conn)
            .await?;
        rows.iter()
            .map(|row| {
                row.try_get::<i64, _>("generation")
                    .map(|g| g as u64)
                    .map_err(ProviderError::from)
            })
            .collect()
    }
}
