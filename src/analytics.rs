//! Read-only queries over persisted presence events.
//!
//! Calendar dates and hours are always evaluated in the configured reference
//! timezone, never in the server's or the datastore's locale.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::Serialize;

use crate::error::{QueryError, StoreError};
use crate::labels::CanonicalClass;
use crate::store::{EventFilter, EventStore, PresenceEvent, TimeRange};

pub const DEFAULT_HISTOGRAM_DAYS: u32 = 7;
pub const MAX_HISTOGRAM_DAYS: u32 = 31;

/// Filters for [`AnalyticsService::list_events`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListQuery {
    /// Calendar date in the reference timezone
    pub date: Option<NaiveDate>,
    pub class: Option<CanonicalClass>,
    /// Requested row cap, always positive when present
    pub limit: Option<usize>,
}

impl ListQuery {
    /// Parse raw query-string values. Empty strings count as absent.
    pub fn parse(
        date: Option<&str>,
        class: Option<&str>,
        limit: Option<&str>,
    ) -> Result<Self, QueryError> {
        const OP: &str = "list_events";
        let date = present(date)
            .map(|raw| {
                NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                    .map_err(|e| invalid(OP, "date", raw, format!("expected YYYY-MM-DD ({e})")))
            })
            .transpose()?;
        let class = present(class)
            .map(|raw| {
                raw.parse::<CanonicalClass>()
                    .map_err(|e| invalid(OP, "class", raw, e.to_string()))
            })
            .transpose()?;
        let limit = present(limit)
            .map(|raw| match raw.parse::<usize>() {
                Ok(n) if n > 0 => Ok(n),
                _ => Err(invalid(OP, "limit", raw, "must be a positive integer")),
            })
            .transpose()?;
        Ok(Self { date, class, limit })
    }

    fn describe(&self) -> String {
        let mut parts = Vec::new();
        if let Some(date) = self.date {
            parts.push(format!("date={date}"));
        }
        if let Some(class) = self.class {
            parts.push(format!("class={class}"));
        }
        if let Some(limit) = self.limit {
            parts.push(format!("limit={limit}"));
        }
        if parts.is_empty() {
            "none".to_string()
        } else {
            parts.join(" ")
        }
    }
}

/// Parse the `days` parameter of the daily histogram.
pub fn parse_days(raw: Option<&str>) -> Result<u32, QueryError> {
    match present(raw) {
        None => Ok(DEFAULT_HISTOGRAM_DAYS),
        Some(raw) => match raw.parse::<u32>() {
            Ok(days) if (1..=MAX_HISTOGRAM_DAYS).contains(&days) => Ok(days),
            _ => Err(invalid(
                "daily_histogram",
                "days",
                raw,
                format!("must be an integer in 1..={MAX_HISTOGRAM_DAYS}"),
            )),
        },
    }
}

fn present(raw: Option<&str>) -> Option<&str> {
    raw.map(str::trim).filter(|s| !s.is_empty())
}

fn invalid(
    operation: &'static str,
    parameter: &'static str,
    value: &str,
    reason: impl Into<String>,
) -> QueryError {
    QueryError::InvalidFilter {
        operation,
        parameter,
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn store_error(operation: &'static str, filter: String) -> impl FnOnce(StoreError) -> QueryError {
    move |source| QueryError::Store {
        operation,
        filter,
        source,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatisticsSnapshot {
    pub total: i64,
    pub cars: i64,
    pub motorcycles: i64,
    pub avg_per_hour: i64,
    /// Events on the current reference-timezone day
    pub today: i64,
    /// Every canonical class, zero-filled
    pub by_class: BTreeMap<CanonicalClass, i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HourlyCount {
    pub hour: u32,
    pub count: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DailyCount {
    pub date: NaiveDate,
    pub count: i64,
}

/// `today / 24` rounded to the nearest integer, halves to even; 0 when
/// nothing happened today.
pub fn average_per_hour(today: i64) -> i64 {
    if today <= 0 {
        return 0;
    }
    let (q, r) = (today / 24, today % 24);
    match (2 * r).cmp(&24) {
        std::cmp::Ordering::Less => q,
        std::cmp::Ordering::Greater => q + 1,
        std::cmp::Ordering::Equal => q + q % 2,
    }
}

/// Stateless query layer. Cheap to share between request handlers.
pub struct AnalyticsService {
    store: Arc<dyn EventStore>,
    tz: Tz,
    max_rows: usize,
}

impl AnalyticsService {
    pub fn new(store: Arc<dyn EventStore>, tz: Tz, max_rows: usize) -> Self {
        Self {
            store,
            tz,
            max_rows: max_rows.max(1),
        }
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// The instants covered by a reference-timezone calendar date.
    pub fn day_range(&self, date: NaiveDate) -> TimeRange {
        let start = self.local_midnight(date);
        let end = date
            .succ_opt()
            .map(|next| self.local_midnight(next))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        TimeRange { start, end }
    }

    /// First instant of `date`. Zones that skip midnight for DST start the
    /// day at the first local time that exists.
    fn local_midnight(&self, date: NaiveDate) -> DateTime<Utc> {
        let midnight = date.and_time(NaiveTime::MIN);
        (0..3)
            .find_map(|h| {
                self.tz
                    .from_local_datetime(&(midnight + Duration::hours(h)))
                    .earliest()
            })
            .map(|local| local.with_timezone(&Utc))
            .unwrap_or_else(|| Utc.from_utc_datetime(&midnight))
    }

    fn today(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.tz).date_naive()
    }

    /// Events newest first. Without a limit the listing is still capped at
    /// the configured safety maximum.
    pub async fn list_events(&self, query: &ListQuery) -> Result<Vec<PresenceEvent>, QueryError> {
        const OP: &str = "list_events";
        let limit = match query.limit {
            Some(0) => return Err(invalid(OP, "limit", "0", "must be a positive integer")),
            Some(n) => n.min(self.max_rows),
            None => self.max_rows,
        };
        let filter = EventFilter {
            range: query.date.map(|d| self.day_range(d)),
            class: query.class,
            limit,
        };
        self.store
            .list(&filter)
            .await
            .map_err(store_error(OP, query.describe()))
    }

    pub async fn statistics(&self) -> Result<StatisticsSnapshot, QueryError> {
        self.statistics_at(Utc::now()).await
    }

    pub async fn statistics_at(&self, now: DateTime<Utc>) -> Result<StatisticsSnapshot, QueryError> {
        const OP: &str = "statistics";
        let today = self.today(now);
        let filter = format!("today={today}");

        let total = self
            .store
            .count(None)
            .await
            .map_err(store_error(OP, filter.clone()))?;
        let mut by_class: BTreeMap<CanonicalClass, i64> =
            CanonicalClass::ALL.iter().map(|c| (*c, 0)).collect();
        for (class, n) in self
            .store
            .count_by_class(None)
            .await
            .map_err(store_error(OP, filter.clone()))?
        {
            *by_class.entry(class).or_default() += n;
        }
        let today_count = self
            .store
            .count(Some(self.day_range(today)))
            .await
            .map_err(store_error(OP, filter))?;

        Ok(StatisticsSnapshot {
            total,
            cars: by_class.get(&CanonicalClass::Car).copied().unwrap_or(0),
            motorcycles: by_class.get(&CanonicalClass::Motorcycle).copied().unwrap_or(0),
            avg_per_hour: average_per_hour(today_count),
            today: today_count,
            by_class,
        })
    }

    pub async fn hourly_histogram(&self) -> Result<Vec<HourlyCount>, QueryError> {
        self.hourly_histogram_at(Utc::now()).await
    }

    /// Hours of the current reference day that have events, ascending.
    pub async fn hourly_histogram_at(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<HourlyCount>, QueryError> {
        const OP: &str = "hourly_histogram";
        let today = self.today(now);
        let rows = self
            .store
            .hourly_counts(self.day_range(today), self.tz)
            .await
            .map_err(store_error(OP, format!("date={today}")))?;
        Ok(rows
            .into_iter()
            .map(|(hour, count)| HourlyCount { hour, count })
            .collect())
    }

    pub async fn daily_histogram(&self, days: u32) -> Result<Vec<DailyCount>, QueryError> {
        self.daily_histogram_at(days, Utc::now()).await
    }

    /// Days among the last `days` reference days (today included) that have
    /// events, ascending.
    pub async fn daily_histogram_at(
        &self,
        days: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<DailyCount>, QueryError> {
        const OP: &str = "daily_histogram";
        if !(1..=MAX_HISTOGRAM_DAYS).contains(&days) {
            return Err(invalid(
                OP,
                "days",
                &days.to_string(),
                format!("must be an integer in 1..={MAX_HISTOGRAM_DAYS}"),
            ));
        }
        let today = self.today(now);
        let first = today - Duration::days(i64::from(days) - 1);
        let range = TimeRange {
            start: self.local_midnight(first),
            end: self.day_range(today).end,
        };
        let rows = self
            .store
            .daily_counts(range, self.tz)
            .await
            .map_err(store_error(OP, format!("from={first} to={today}")))?;
        Ok(rows
            .into_iter()
            .map(|(date, count)| DailyCount { date, count })
            .collect())
    }

    pub async fn health(&self) -> Result<(), QueryError> {
        self.store
            .ping()
            .await
            .map_err(store_error("health", "none".to_string()))
    }
}
