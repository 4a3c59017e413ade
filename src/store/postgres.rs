use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use num_traits::ToPrimitive;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder};
use tracing::{info, warn};

use super::{EventFilter, EventStore, PresenceEvent, TimeRange};
use crate::config::DatastoreConfig;
use crate::error::StoreError;
use crate::labels::CanonicalClass;
use crate::track::TrackId;

const TABLE: &str = "tracking_data";

/// PostgreSQL-backed event store over a bounded pool.
///
/// Every operation borrows one connection for its duration; the borrow is
/// returned when the guard drops, including on error and when the calling
/// future is cancelled. Acquisition is bounded by `acquire_timeout`.
#[derive(Debug, Clone)]
pub struct PgEventStore {
    pool: PgPool,
}

#[derive(Debug, sqlx::FromRow)]
struct EventRow {
    track_id: i64,
    created_at: DateTime<Utc>,
    class: String,
}

impl PgEventStore {
    pub async fn connect(config: &DatastoreConfig) -> Result<Self, StoreError> {
        let mut options: PgConnectOptions = config
            .url
            .parse()
            .map_err(|e| StoreError::from_sqlx("connect", e))?;
        if let Some(ms) = config.statement_timeout_ms {
            options = options.options([("statement_timeout", ms.to_string())]);
        }

        let pool = PgPoolOptions::new()
            .min_connections(config.min_connections)
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout())
            .connect_with(options)
            .await
            .map_err(|e| StoreError::from_sqlx("connect", e))?;

        info!(
            min = config.min_connections,
            max = config.max_connections,
            "datastore pool ready"
        );
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the event table and its time index if missing.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        const OP: &str = "ensure_schema";
        let mut conn = self.acquire(OP).await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tracking_data (
                track_id   BIGINT      NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                class      TEXT        NOT NULL
            )
            "#,
        )
        .execute(&mut *conn)
        .await
        .map_err(|e| StoreError::from_sqlx(OP, e))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS tracking_data_created_at_idx ON tracking_data (created_at)",
        )
        .execute(&mut *conn)
        .await
        .map_err(|e| StoreError::from_sqlx(OP, e))?;
        Ok(())
    }

    async fn acquire(&self, operation: &'static str) -> Result<PoolConnection<Postgres>, StoreError> {
        self.pool
            .acquire()
            .await
            .map_err(|e| StoreError::from_sqlx(operation, e))
    }
}

fn push_range(qb: &mut QueryBuilder<'_, Postgres>, range: Option<TimeRange>) {
    if let Some(range) = range {
        qb.push(" AND created_at >= ")
            .push_bind(range.start)
            .push(" AND created_at < ")
            .push_bind(range.end);
    }
}

/// Stored class strings outside the taxonomy are reported as unknown.
fn parse_class(operation: &'static str, raw: &str) -> CanonicalClass {
    raw.parse().unwrap_or_else(|_| {
        warn!(operation, class = %raw, "stored class is not canonical, reporting as unknown");
        CanonicalClass::Unknown
    })
}

impl EventRow {
    fn into_event(self, operation: &'static str) -> Result<PresenceEvent, StoreError> {
        let track_id = self.track_id.to_u64().ok_or_else(|| StoreError::Integrity {
            operation,
            detail: format!("negative track id {}", self.track_id),
        })?;
        Ok(PresenceEvent {
            track_id,
            created_at: self.created_at,
            class: parse_class(operation, &self.class),
        })
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn insert(&self, event: &PresenceEvent) -> Result<(), StoreError> {
        const OP: &str = "insert_event";
        let track_id = event.track_id.to_i64().ok_or_else(|| StoreError::Integrity {
            operation: OP,
            detail: format!("track id {} exceeds BIGINT", event.track_id),
        })?;

        let mut conn = self.acquire(OP).await?;
        sqlx::query("INSERT INTO tracking_data (track_id, created_at, class) VALUES ($1, $2, $3)")
            .bind(track_id)
            .bind(event.created_at)
            .bind(event.class.as_str())
            .execute(&mut *conn)
            .await
            .map_err(|e| StoreError::from_sqlx(OP, e))?;
        Ok(())
    }

    async fn list(&self, filter: &EventFilter) -> Result<Vec<PresenceEvent>, StoreError> {
        const OP: &str = "list_events";
        let limit = filter.limit.to_i64().unwrap_or(i64::MAX);

        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT track_id, created_at, class FROM {TABLE} WHERE TRUE"
        ));
        push_range(&mut qb, filter.range);
        if let Some(class) = filter.class {
            qb.push(" AND class = ").push_bind(class.as_str());
        }
        qb.push(" ORDER BY created_at DESC, track_id DESC LIMIT ")
            .push_bind(limit);

        let mut conn = self.acquire(OP).await?;
        let rows: Vec<EventRow> = qb
            .build_query_as()
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| StoreError::from_sqlx(OP, e))?;

        rows.into_iter().map(|row| row.into_event(OP)).collect()
    }

    async fn count(&self, range: Option<TimeRange>) -> Result<i64, StoreError> {
        const OP: &str = "count_events";
        let mut qb = QueryBuilder::<Postgres>::new(format!("SELECT COUNT(*) FROM {TABLE} WHERE TRUE"));
        push_range(&mut qb, range);

        let mut conn = self.acquire(OP).await?;
        qb.build_query_scalar::<i64>()
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| StoreError::from_sqlx(OP, e))
    }

    async fn count_by_class(
        &self,
        range: Option<TimeRange>,
    ) -> Result<Vec<(CanonicalClass, i64)>, StoreError> {
        const OP: &str = "count_by_class";
        let mut qb =
            QueryBuilder::<Postgres>::new(format!("SELECT class, COUNT(*) FROM {TABLE} WHERE TRUE"));
        push_range(&mut qb, range);
        qb.push(" GROUP BY class");

        let mut conn = self.acquire(OP).await?;
        let rows: Vec<(String, i64)> = qb
            .build_query_as()
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| StoreError::from_sqlx(OP, e))?;

        // Several stray spellings may fold into `unknown`
        let mut counts: BTreeMap<CanonicalClass, i64> = BTreeMap::new();
        for (raw, n) in rows {
            *counts.entry(parse_class(OP, &raw)).or_default() += n;
        }
        Ok(counts.into_iter().collect())
    }

    async fn hourly_counts(&self, range: TimeRange, tz: Tz) -> Result<Vec<(u32, i64)>, StoreError> {
        const OP: &str = "hourly_counts";
        let mut conn = self.acquire(OP).await?;
        let rows: Vec<(i32, i64)> = sqlx::query_as(
            r#"
            SELECT EXTRACT(HOUR FROM created_at AT TIME ZONE $1)::INT AS hour, COUNT(*)
            FROM tracking_data
            WHERE created_at >= $2 AND created_at < $3
            GROUP BY 1
            ORDER BY 1
            "#,
        )
        .bind(tz.name())
        .bind(range.start)
        .bind(range.end)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| StoreError::from_sqlx(OP, e))?;

        rows.into_iter()
            .map(|(hour, n)| {
                hour.to_u32()
                    .filter(|h| *h < 24)
                    .map(|h| (h, n))
                    .ok_or_else(|| StoreError::Integrity {
                        operation: OP,
                        detail: format!("hour bucket {hour} out of range"),
                    })
            })
            .collect()
    }

    async fn daily_counts(
        &self,
        range: TimeRange,
        tz: Tz,
    ) -> Result<Vec<(NaiveDate, i64)>, StoreError> {
        const OP: &str = "daily_counts";
        let mut conn = self.acquire(OP).await?;
        sqlx::query_as(
            r#"
            SELECT (created_at AT TIME ZONE $1)::DATE AS day, COUNT(*)
            FROM tracking_data
            WHERE created_at >= $2 AND created_at < $3
            GROUP BY 1
            ORDER BY 1
            "#,
        )
        .bind(tz.name())
        .bind(range.start)
        .bind(range.end)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| StoreError::from_sqlx(OP, e))
    }

    async fn max_track_id(&self) -> Result<Option<TrackId>, StoreError> {
        const OP: &str = "max_track_id";
        let mut conn = self.acquire(OP).await?;
        let max: Option<i64> = sqlx::query_scalar("SELECT MAX(track_id) FROM tracking_data")
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| StoreError::from_sqlx(OP, e))?;

        max.map(|id| {
            id.to_u64().ok_or_else(|| StoreError::Integrity {
                operation: OP,
                detail: format!("negative track id {id}"),
            })
        })
        .transpose()
    }

    async fn ping(&self) -> Result<(), StoreError> {
        const OP: &str = "ping";
        let mut conn = self.acquire(OP).await?;
        sqlx::query("SELECT 1")
            .execute(&mut *conn)
            .await
            .map_err(|e| StoreError::from_sqlx(OP, e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    // Nothing listens on port 1, so every connection attempt is refused.
    fn unreachable_store() -> PgEventStore {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_millis(50))
            .connect_lazy("postgres://bridgewatch@127.0.0.1:1/bridgewatch")
            .unwrap();
        PgEventStore::from_pool(pool)
    }

    fn any_filter() -> EventFilter {
        EventFilter {
            range: None,
            class: None,
            limit: 10,
        }
    }

    #[tokio::test]
    async fn test_acquire_timeout_is_retryable() {
        let store = unreachable_store();
        let err = store.list(&any_filter()).await.unwrap_err();
        assert!(matches!(err, StoreError::PoolTimeout { .. }), "{err:?}");
        assert!(err.is_retryable());
        assert_eq!(err.operation(), "list_events");

        let err = store.ping().await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(err.operation(), "ping");
    }

    #[tokio::test]
    async fn test_failed_and_cancelled_calls_hold_no_connection() {
        let store = unreachable_store();
        for _ in 0..3 {
            assert!(store.count(None).await.is_err());
        }
        assert_eq!(store.pool.size(), 0);

        for _ in 0..3 {
            let cancelled =
                tokio::time::timeout(Duration::from_millis(5), store.list(&any_filter())).await;
            assert!(cancelled.is_err());
        }
        assert_eq!(store.pool.size(), 0);

        // Still usable after cancellations: fails fast with the same error
        let err = store.max_track_id().await.unwrap_err();
        assert!(matches!(err, StoreError::PoolTimeout { .. }), "{err:?}");
    }
}
