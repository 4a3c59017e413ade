//! Persisted presence events.
//!
//! [`EventStore`] is the seam between the pipeline / analytics layers and the
//! datastore. [`PgEventStore`] is the production backend over a bounded
//! connection pool; [`MemoryEventStore`] backs dry runs and tests.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::Serialize;

use crate::error::StoreError;
use crate::labels::CanonicalClass;
use crate::track::TrackId;

mod memory;
mod postgres;

pub use memory::MemoryEventStore;
pub use postgres::PgEventStore;

/// One durable row: a track seen (or relabelled) at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PresenceEvent {
    pub track_id: TrackId,
    pub created_at: DateTime<Utc>,
    pub class: CanonicalClass,
}

/// Half-open instant range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn contains(&self, instant: &DateTime<Utc>) -> bool {
        self.start <= *instant && *instant < self.end
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFilter {
    pub range: Option<TimeRange>,
    pub class: Option<CanonicalClass>,
    /// Maximum rows returned. Always bounded.
    pub limit: usize,
}

impl EventFilter {
    pub fn matches(&self, event: &PresenceEvent) -> bool {
        self.range.map_or(true, |r| r.contains(&event.created_at))
            && self.class.map_or(true, |c| c == event.class)
    }
}

/// Access to the presence event table.
///
/// Listings are ordered newest first (ties by descending track id).
/// Bucketing methods evaluate hours and dates in the supplied zone and omit
/// empty buckets.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn insert(&self, event: &PresenceEvent) -> Result<(), StoreError>;

    async fn list(&self, filter: &EventFilter) -> Result<Vec<PresenceEvent>, StoreError>;

    async fn count(&self, range: Option<TimeRange>) -> Result<i64, StoreError>;

    async fn count_by_class(
        &self,
        range: Option<TimeRange>,
    ) -> Result<Vec<(CanonicalClass, i64)>, StoreError>;

    /// `(hour 0..=23, count)` ascending by hour.
    async fn hourly_counts(&self, range: TimeRange, tz: Tz) -> Result<Vec<(u32, i64)>, StoreError>;

    /// `(local date, count)` ascending by date.
    async fn daily_counts(
        &self,
        range: TimeRange,
        tz: Tz,
    ) -> Result<Vec<(NaiveDate, i64)>, StoreError>;

    /// Largest track id ever stored, `None` for an empty table.
    async fn max_track_id(&self) -> Result<Option<TrackId>, StoreError>;

    /// Cheap round trip proving the store is reachable.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// First track id that cannot collide with anything already stored.
pub async fn next_track_id(store: &dyn EventStore) -> Result<TrackId, StoreError> {
    match store.max_track_id().await? {
        None => Ok(1),
        Some(max) => max.checked_add(1).ok_or_else(|| StoreError::Integrity {
            operation: "max_track_id",
            detail: format!("track id space exhausted at {max}"),
        }),
    }
}
