//! HTTP query API over the analytics service.

use chrono_tz::Tz;
use rocket::figment::Figment;
use rocket::serde::json::Json;
use rocket::{get, routes, Build, Responder, Rocket, State};
use serde::Serialize;
use tracing::{error, warn};

use crate::analytics::{parse_days, AnalyticsService, DailyCount, HourlyCount, ListQuery, StatisticsSnapshot};
use crate::error::QueryError;
use crate::labels::CanonicalClass;
use crate::store::PresenceEvent;
use crate::track::TrackId;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub operation: &'static str,
    pub retryable: bool,
}

#[derive(Debug, Responder)]
pub enum ApiError {
    #[response(status = 400)]
    BadRequest(Json<ErrorBody>),
    #[response(status = 503)]
    Unavailable(Json<ErrorBody>),
    #[response(status = 500)]
    Internal(Json<ErrorBody>),
}

impl From<QueryError> for ApiError {
    fn from(err: QueryError) -> Self {
        let body = Json(ErrorBody {
            error: err.to_string(),
            operation: err.operation(),
            retryable: err.is_retryable(),
        });
        match err {
            QueryError::InvalidFilter { .. } => {
                warn!(operation = err.operation(), %err, "rejected query");
                ApiError::BadRequest(body)
            }
            QueryError::Store { .. } if err.is_retryable() => {
                error!(operation = err.operation(), %err, "query failed, datastore unavailable");
                ApiError::Unavailable(body)
            }
            QueryError::Store { .. } => {
                error!(operation = err.operation(), %err, "query failed");
                ApiError::Internal(body)
            }
        }
    }
}

/// Wire form of a presence event; the timestamp carries the reference offset.
#[derive(Debug, Serialize)]
pub struct EventRecord {
    pub track_id: TrackId,
    pub created_at: String,
    pub class: CanonicalClass,
}

impl EventRecord {
    fn new(event: PresenceEvent, tz: Tz) -> Self {
        Self {
            track_id: event.track_id,
            created_at: event.created_at.with_timezone(&tz).to_rfc3339(),
            class: event.class,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct Health {
    pub status: &'static str,
    pub timezone: &'static str,
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[get("/api/data?<date>&<class>&<limit>")]
async fn data(
    service: &State<AnalyticsService>,
    date: Option<&str>,
    class: Option<&str>,
    limit: Option<&str>,
) -> ApiResult<Vec<EventRecord>> {
    let query = ListQuery::parse(date, class, limit)?;
    let tz = service.timezone();
    let events = service.list_events(&query).await?;
    Ok(Json(
        events.into_iter().map(|e| EventRecord::new(e, tz)).collect(),
    ))
}

#[get("/api/statistics")]
async fn statistics(service: &State<AnalyticsService>) -> ApiResult<StatisticsSnapshot> {
    Ok(Json(service.statistics().await?))
}

#[get("/api/hourly-data")]
async fn hourly_data(service: &State<AnalyticsService>) -> ApiResult<Vec<HourlyCount>> {
    Ok(Json(service.hourly_histogram().await?))
}

#[get("/api/daily-data?<days>")]
async fn daily_data(
    service: &State<AnalyticsService>,
    days: Option<&str>,
) -> ApiResult<Vec<DailyCount>> {
    let days = parse_days(days)?;
    Ok(Json(service.daily_histogram(days).await?))
}

#[get("/api/health")]
async fn health(service: &State<AnalyticsService>) -> ApiResult<Health> {
    service.health().await?;
    Ok(Json(Health {
        status: "ok",
        timezone: service.timezone().name(),
    }))
}

/// Assemble the server. `figment` carries address, port and Rocket settings.
pub fn build(service: AnalyticsService, figment: Figment) -> Rocket<Build> {
    rocket::custom(figment)
        .manage(service)
        .mount(
            "/",
            routes![data, statistics, hourly_data, daily_data, health],
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::{DateTime, NaiveDate, TimeZone, Utc};
    use rocket::http::Status;
    use rocket::local::asynchronous::Client;
    use serde_json::Value;

    use crate::error::StoreError;
    use crate::store::{EventFilter, EventStore, MemoryEventStore, TimeRange};

    fn utc(d: u32, h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, d, h, m, 0).unwrap()
    }

    async fn client_with(store: Arc<dyn EventStore>) -> Client {
        let service = AnalyticsService::new(store, chrono_tz::Asia::Jakarta, 1000);
        Client::tracked(build(service, rocket::Config::figment()))
            .await
            .expect("valid rocket instance")
    }

    async fn seeded_client() -> Client {
        let store = Arc::new(MemoryEventStore::new());
        let rows = [
            (1, utc(1, 3, 0), CanonicalClass::Car),
            (2, utc(1, 3, 5), CanonicalClass::Motorcycle),
            (3, utc(1, 3, 10), CanonicalClass::Motorcycle),
            (4, utc(1, 17, 30), CanonicalClass::Motorcycle),
        ];
        for (track_id, created_at, class) in rows {
            store
                .insert(&PresenceEvent {
                    track_id,
                    created_at,
                    class,
                })
                .await
                .unwrap();
        }
        client_with(store).await
    }

    #[rocket::async_test]
    async fn test_list_with_filters() {
        let client = seeded_client().await;
        let response = client
            .get("/api/data?date=2024-01-01&class=motorcycle&limit=10")
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);

        let body: Value = response.into_json().await.unwrap();
        let rows = body.as_array().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["track_id"], 3);
        assert_eq!(rows[0]["class"], "motorcycle");
        assert_eq!(rows[0]["created_at"], "2024-01-01T10:10:00+07:00");
        assert_eq!(rows[1]["track_id"], 2);
    }

    #[rocket::async_test]
    async fn test_list_without_filters() {
        let client = seeded_client().await;
        let response = client.get("/api/data").dispatch().await;
        assert_eq!(response.status(), Status::Ok);
        let body: Value = response.into_json().await.unwrap();
        assert_eq!(body.as_array().unwrap().len(), 4);
        assert_eq!(body[0]["track_id"], 4);
    }

    #[rocket::async_test]
    async fn test_malformed_limit_rejected() {
        let client = seeded_client().await;
        for uri in ["/api/data?limit=abc", "/api/data?limit=0", "/api/data?limit=-1"] {
            let response = client.get(uri).dispatch().await;
            assert_eq!(response.status(), Status::BadRequest, "{uri}");
            let body: Value = response.into_json().await.unwrap();
            assert_eq!(body["operation"], "list_events");
            assert_eq!(body["retryable"], false);
        }
    }

    #[rocket::async_test]
    async fn test_bad_date_and_class_rejected() {
        let client = seeded_client().await;
        let response = client.get("/api/data?date=yesterday").dispatch().await;
        assert_eq!(response.status(), Status::BadRequest);
        let response = client.get("/api/data?class=boat").dispatch().await;
        assert_eq!(response.status(), Status::BadRequest);
        let response = client.get("/api/daily-data?days=90").dispatch().await;
        assert_eq!(response.status(), Status::BadRequest);
    }

    #[rocket::async_test]
    async fn test_statistics_shape() {
        let client = seeded_client().await;
        let response = client.get("/api/statistics").dispatch().await;
        assert_eq!(response.status(), Status::Ok);
        let body: Value = response.into_json().await.unwrap();
        assert_eq!(body["total"], 4);
        assert_eq!(body["cars"], 1);
        assert_eq!(body["motorcycles"], 3);
        assert!(body["avg_per_hour"].is_i64());
        assert_eq!(body["by_class"]["unknown"], 0);
    }

    #[rocket::async_test]
    async fn test_histograms_and_health() {
        let client = seeded_client().await;
        let response = client.get("/api/hourly-data").dispatch().await;
        assert_eq!(response.status(), Status::Ok);
        assert!(response.into_json::<Value>().await.unwrap().is_array());

        let response = client.get("/api/daily-data").dispatch().await;
        assert_eq!(response.status(), Status::Ok);

        let response = client.get("/api/health").dispatch().await;
        assert_eq!(response.status(), Status::Ok);
        let body: Value = response.into_json().await.unwrap();
        assert_eq!(body["timezone"], "Asia/Jakarta");
    }

    /// Every read fails with the configured error.
    struct BrokenStore {
        retryable: bool,
    }

    impl BrokenStore {
        fn fail<T>(&self, operation: &'static str) -> Result<T, StoreError> {
            if self.retryable {
                Err(StoreError::PoolTimeout { operation })
            } else {
                Err(StoreError::Query {
                    operation,
                    source: sqlx::Error::RowNotFound,
                })
            }
        }
    }

    #[async_trait]
    impl EventStore for BrokenStore {
        async fn insert(&self, _: &PresenceEvent) -> Result<(), StoreError> {
            self.fail("insert_event")
        }
        async fn list(&self, _: &EventFilter) -> Result<Vec<PresenceEvent>, StoreError> {
            self.fail("list_events")
        }
        async fn count(&self, _: Option<TimeRange>) -> Result<i64, StoreError> {
            self.fail("count_events")
        }
        async fn count_by_class(
            &self,
            _: Option<TimeRange>,
        ) -> Result<Vec<(CanonicalClass, i64)>, StoreError> {
            self.fail("count_by_class")
        }
        async fn hourly_counts(&self, _: TimeRange, _: Tz) -> Result<Vec<(u32, i64)>, StoreError> {
            self.fail("hourly_counts")
        }
        async fn daily_counts(
            &self,
            _: TimeRange,
            _: Tz,
        ) -> Result<Vec<(NaiveDate, i64)>, StoreError> {
            self.fail("daily_counts")
        }
        async fn max_track_id(&self) -> Result<Option<TrackId>, StoreError> {
            self.fail("max_track_id")
        }
        async fn ping(&self) -> Result<(), StoreError> {
            self.fail("ping")
        }
    }

    #[rocket::async_test]
    async fn test_store_timeout_is_503() {
        let client = client_with(Arc::new(BrokenStore { retryable: true })).await;
        for uri in ["/api/data?class=car", "/api/statistics", "/api/hourly-data", "/api/health"] {
            let response = client.get(uri).dispatch().await;
            assert_eq!(response.status(), Status::ServiceUnavailable, "{uri}");
            let body: Value = response.into_json().await.unwrap();
            assert_eq!(body["retryable"], true);
            assert!(!body["error"].as_str().unwrap().is_empty());
        }
    }

    #[rocket::async_test]
    async fn test_query_failure_is_500_with_context() {
        let client = client_with(Arc::new(BrokenStore { retryable: false })).await;
        let response = client.get("/api/data?date=2024-01-01").dispatch().await;
        assert_eq!(response.status(), Status::InternalServerError);
        let body: Value = response.into_json().await.unwrap();
        assert_eq!(body["operation"], "list_events");
        assert_eq!(body["retryable"], false);
        assert!(body["error"].as_str().unwrap().contains("date=2024-01-01"));
    }
}
