pub mod analytics;
pub mod api;
pub mod assignment;
pub mod config;
pub mod detection;
pub mod error;
pub mod event_logger;
pub mod kalman_filter;
pub mod labels;
pub mod store;
pub mod track;
pub mod tracker;
pub mod utils;

// Re-export main types
pub use crate::analytics::{AnalyticsService, ListQuery, StatisticsSnapshot};
pub use crate::config::Config;
pub use crate::detection::{BoundingBox, Detection, Frame};
pub use crate::error::{ConfigError, DetectionError, QueryError, StoreError};
pub use crate::event_logger::EventLogger;
pub use crate::labels::{CanonicalClass, LabelNormalizer};
pub use crate::store::{EventStore, MemoryEventStore, PgEventStore, PresenceEvent};
pub use crate::track::{Track, TrackId, TrackSnapshot, TrackState};
pub use crate::tracker::{FrameUpdate, TrackManager};
