use serde::Serialize;

use crate::detection::{BoundingBox, Detection};
use crate::kalman_filter::KalmanFilter;

/// Stable numeric track identifier. Allocated monotonically, never reused.
pub type TrackId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackState {
    /// Just spawned, not yet trusted.
    Tentative,
    /// Reported to consumers.
    Confirmed,
    /// Terminal. Removed from the live set in the frame it is reached.
    Deleted,
}

/// A persistent identity stitched across frames.
#[derive(Debug, Clone)]
pub struct Track {
    id: TrackId,
    state: TrackState,
    filter: KalmanFilter,
    /// Box estimate: corrected on a hit, predicted during misses
    bbox: BoundingBox,
    /// Raw label of the most recent matched detection
    label: String,
    confidence: f32,
    /// Consecutive matched frames
    hits: u32,
    /// Consecutive missed frames
    misses: u32,
}

/// What the Track Manager exposes about a Confirmed track each frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackSnapshot {
    pub track_id: TrackId,
    pub bbox: BoundingBox,
    pub label: String,
    pub confidence: f32,
    /// Consecutive frames without a matching detection (0 when seen this frame)
    pub misses: u32,
}

impl Track {
    /// Spawn a tentative track from an unmatched detection.
    pub fn new(id: TrackId, detection: &Detection, confirmation_hits: u32) -> Self {
        let mut track = Track {
            id,
            state: TrackState::Tentative,
            filter: KalmanFilter::initiate(&detection.bbox),
            bbox: detection.bbox,
            label: detection.label.clone(),
            confidence: detection.confidence,
            hits: 1,
            misses: 0,
        };
        track.confirm_if_ready(confirmation_hits);
        track
    }

    /// Advance the motion model by `dt` frames.
    pub fn predict(&mut self, dt: f32) -> BoundingBox {
        self.bbox = self.filter.predict(dt);
        self.bbox
    }

    /// Apply a matched detection. Returns `true` if this hit confirmed the track.
    pub fn update(&mut self, detection: &Detection, confirmation_hits: u32) -> bool {
        self.filter.update(&detection.bbox);
        self.bbox = self.filter.bbox();
        self.label.clone_from(&detection.label);
        self.confidence = detection.confidence;
        self.hits = self.hits.saturating_add(1);
        self.misses = 0;
        self.confirm_if_ready(confirmation_hits)
    }

    /// Record a frame without a match. Returns `true` if the track is now deleted.
    pub fn mark_missed(&mut self, max_age: u32) -> bool {
        if self.state == TrackState::Deleted {
            return false;
        }
        self.misses = self.misses.saturating_add(1);
        self.hits = 0;
        if self.misses > max_age {
            self.state = TrackState::Deleted;
            return true;
        }
        false
    }

    fn confirm_if_ready(&mut self, confirmation_hits: u32) -> bool {
        if self.state == TrackState::Tentative && self.hits >= confirmation_hits {
            self.state = TrackState::Confirmed;
            return true;
        }
        false
    }

    pub fn id(&self) -> TrackId {
        self.id
    }

    pub fn state(&self) -> TrackState {
        self.state
    }

    pub fn is_confirmed(&self) -> bool {
        self.state == TrackState::Confirmed
    }

    pub fn is_deleted(&self) -> bool {
        self.state == TrackState::Deleted
    }

    pub fn bbox(&self) -> &BoundingBox {
        &self.bbox
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn hits(&self) -> u32 {
        self.hits
    }

    pub fn misses(&self) -> u32 {
        self.misses
    }

    pub fn snapshot(&self) -> TrackSnapshot {
        TrackSnapshot {
            track_id: self.id,
            bbox: self.bbox,
            label: self.label.clone(),
            confidence: self.confidence,
            misses: self.misses,
        }
    }
}
