use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{NaiveDate, Timelike};
use chrono_tz::Tz;
use tokio::sync::RwLock;

use super::{EventFilter, EventStore, PresenceEvent, TimeRange};
use crate::error::StoreError;
use crate::labels::CanonicalClass;
use crate::track::TrackId;

/// Process-local event store. Same query semantics as the PostgreSQL store.
#[derive(Debug, Default)]
pub struct MemoryEventStore {
    events: RwLock<Vec<PresenceEvent>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything stored, in insertion order.
    pub async fn events(&self) -> Vec<PresenceEvent> {
        self.events.read().await.clone()
    }
}

fn in_range(range: Option<TimeRange>, event: &PresenceEvent) -> bool {
    range.map_or(true, |r| r.contains(&event.created_at))
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn insert(&self, event: &PresenceEvent) -> Result<(), StoreError> {
        self.events.write().await.push(event.clone());
        Ok(())
    }

    async fn list(&self, filter: &EventFilter) -> Result<Vec<PresenceEvent>, StoreError> {
        let events = self.events.read().await;
        let mut rows: Vec<PresenceEvent> =
            events.iter().filter(|e| filter.matches(e)).cloned().collect();
        rows.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then(b.track_id.cmp(&a.track_id))
        });
        rows.truncate(filter.limit);
        Ok(rows)
    }

    async fn count(&self, range: Option<TimeRange>) -> Result<i64, StoreError> {
        let events = self.events.read().await;
        Ok(events.iter().filter(|e| in_range(range, e)).count() as i64)
    }

    async fn count_by_class(
        &self,
        range: Option<TimeRange>,
    ) -> Result<Vec<(CanonicalClass, i64)>, StoreError> {
        let events = self.events.read().await;
        let mut counts: BTreeMap<CanonicalClass, i64> = BTreeMap::new();
        for event in events.iter().filter(|e| in_range(range, e)) {
            *counts.entry(event.class).or_default() += 1;
        }
        Ok(counts.into_iter().collect())
    }

    async fn hourly_counts(&self, range: TimeRange, tz: Tz) -> Result<Vec<(u32, i64)>, StoreError> {
        let events = self.events.read().await;
        let mut counts: BTreeMap<u32, i64> = BTreeMap::new();
        for event in events.iter().filter(|e| range.contains(&e.created_at)) {
            *counts.entry(event.created_at.with_timezone(&tz).hour()).or_default() += 1;
        }
        Ok(counts.into_iter().collect())
    }

    async fn daily_counts(
        &self,
        range: TimeRange,
        tz: Tz,
    ) -> Result<Vec<(NaiveDate, i64)>, StoreError> {
        let events = self.events.read().await;
        let mut counts: BTreeMap<NaiveDate, i64> = BTreeMap::new();
        for event in events.iter().filter(|e| range.contains(&e.created_at)) {
            *counts
                .entry(event.created_at.with_timezone(&tz).date_naive())
                .or_default() += 1;
        }
        Ok(counts.into_iter().collect())
    }

    async fn max_track_id(&self) -> Result<Option<TrackId>, StoreError> {
        Ok(self.events.read().await.iter().map(|e| e.track_id).max())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, m, 0).unwrap()
    }

    fn event(track_id: u64, created_at: DateTime<Utc>, class: CanonicalClass) -> PresenceEvent {
        PresenceEvent {
            track_id,
            created_at,
            class,
        }
    }

    #[tokio::test]
    async fn test_list_newest_first_with_limit() {
        let store = MemoryEventStore::new();
        store.insert(&event(1, at(1, 0), CanonicalClass::Car)).await.unwrap();
        store.insert(&event(2, at(3, 0), CanonicalClass::Car)).await.unwrap();
        store.insert(&event(3, at(2, 0), CanonicalClass::Motorcycle)).await.unwrap();
        store.insert(&event(4, at(3, 0), CanonicalClass::Car)).await.unwrap();

        let filter = EventFilter {
            range: None,
            class: Some(CanonicalClass::Car),
            limit: 2,
        };
        let rows = store.list(&filter).await.unwrap();
        let ids: Vec<_> = rows.iter().map(|e| e.track_id).collect();
        assert_eq!(ids, vec![4, 2]);
    }

    #[tokio::test]
    async fn test_buckets_use_reference_zone() {
        let store = MemoryEventStore::new();
        // 16:59 and 17:01 UTC are 23:59 and 00:01 in Jakarta (UTC+7)
        store.insert(&event(1, at(16, 59), CanonicalClass::Car)).await.unwrap();
        store.insert(&event(2, at(17, 1), CanonicalClass::Car)).await.unwrap();

        let range = TimeRange {
            start: at(0, 0),
            end: at(23, 0),
        };
        let tz = chrono_tz::Asia::Jakarta;
        let days = store.daily_counts(range, tz).await.unwrap();
        assert_eq!(
            days,
            vec![
                (NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(), 1),
                (NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(), 1),
            ]
        );
        let hours = store.hourly_counts(range, tz).await.unwrap();
        assert_eq!(hours, vec![(0, 1), (23, 1)]);
    }

    #[tokio::test]
    async fn test_max_track_id() {
        let store = MemoryEventStore::new();
        assert_eq!(store.max_track_id().await.unwrap(), None);
        store.insert(&event(7, at(1, 0), CanonicalClass::Car)).await.unwrap();
        store.insert(&event(3, at(2, 0), CanonicalClass::Bus)).await.unwrap();
        assert_eq!(store.max_track_id().await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn test_counts() {
        let store = MemoryEventStore::new();
        store.insert(&event(1, at(1, 0), CanonicalClass::Car)).await.unwrap();
        store.insert(&event(2, at(2, 0), CanonicalClass::Unknown)).await.unwrap();
        store.insert(&event(2, at(2, 5), CanonicalClass::Bus)).await.unwrap();

        assert_eq!(store.count(None).await.unwrap(), 3);
        let range = TimeRange {
            start: at(2, 0),
            end: at(3, 0),
        };
        assert_eq!(store.count(Some(range)).await.unwrap(), 2);
        assert_eq!(
            store.count_by_class(None).await.unwrap(),
            vec![
                (CanonicalClass::Car, 1),
                (CanonicalClass::Bus, 1),
                (CanonicalClass::Unknown, 1),
            ]
        );
    }
}
