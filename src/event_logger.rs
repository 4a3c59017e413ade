//! Turns per-frame Track Manager output into durable presence events.
//!
//! A track is written when it first shows up as confirmed and again whenever
//! its canonical class changes. Everything else is a no-op, so write volume
//! scales with tracks and label changes rather than with frames.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::error::StoreError;
use crate::labels::{CanonicalClass, LabelNormalizer};
use crate::store::{EventStore, PresenceEvent};
use crate::track::TrackId;
use crate::tracker::FrameUpdate;

/// Outcome of logging one frame.
#[derive(Debug, Default)]
pub struct LogReport {
    pub written: Vec<PresenceEvent>,
    /// Events that were due but could not be stored. They are not retried.
    pub failures: Vec<StoreError>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoggerCounters {
    pub written: u64,
    pub failed: u64,
}

pub struct EventLogger {
    store: Arc<dyn EventStore>,
    normalizer: LabelNormalizer,
    /// Canonical class at the last logged event, per live track
    logged: BTreeMap<TrackId, CanonicalClass>,
    counters: LoggerCounters,
}

impl EventLogger {
    pub fn new(store: Arc<dyn EventStore>, normalizer: LabelNormalizer) -> Self {
        Self {
            store,
            normalizer,
            logged: BTreeMap::new(),
            counters: LoggerCounters::default(),
        }
    }

    /// Decide which events this frame produces and update the side table.
    ///
    /// The side table is updated whether or not the write later succeeds, so a
    /// failed write is lost rather than repeated on every following frame.
    pub fn plan(&mut self, update: &FrameUpdate) -> Vec<PresenceEvent> {
        for id in &update.deleted {
            self.logged.remove(id);
        }

        let mut due = Vec::new();
        for snapshot in &update.confirmed {
            let class = self.normalizer.normalize(&snapshot.label);
            let previous = self.logged.insert(snapshot.track_id, class);
            if previous != Some(class) {
                due.push(PresenceEvent {
                    track_id: snapshot.track_id,
                    created_at: update.timestamp,
                    class,
                });
            }
        }
        due
    }

    /// Plan and persist the events for one frame.
    pub async fn on_frame_update(&mut self, update: &FrameUpdate) -> LogReport {
        let mut report = LogReport::default();
        for event in self.plan(update) {
            match self.store.insert(&event).await {
                Ok(()) => {
                    info!(
                        track_id = event.track_id,
                        class = %event.class,
                        created_at = %event.created_at,
                        "presence event logged"
                    );
                    self.counters.written += 1;
                    report.written.push(event);
                }
                Err(error) => {
                    warn!(
                        track_id = event.track_id,
                        class = %event.class,
                        retryable = error.is_retryable(),
                        %error,
                        "presence event lost"
                    );
                    self.counters.failed += 1;
                    report.failures.push(error);
                }
            }
        }
        report
    }

    /// Number of tracks with a logged event that are still alive.
    #[cfg(test)]
    pub(crate) fn tracked(&self) -> usize {
        self.logged.len()
    }

    pub fn counters(&self) -> LoggerCounters {
        self.counters
    }
}
