use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::assignment::solve;
use crate::config::TrackerConfig;
use crate::detection::{BoundingBox, Detection, Frame};
use crate::error::DetectionError;
use crate::track::{Track, TrackId, TrackSnapshot};
use crate::utils::iou_cost_matrix;

/// A detection dropped before association, with the reason.
#[derive(Debug, Clone, PartialEq)]
pub struct Anomaly {
    /// Position of the detection within its frame
    pub detection_index: usize,
    pub error: DetectionError,
}

/// Track Manager output for one processed frame (or one stall ageing pass).
#[derive(Debug, Clone, PartialEq)]
pub struct FrameUpdate {
    pub frame_index: u64,
    pub timestamp: DateTime<Utc>,
    /// Confirmed live tracks, ascending by id
    pub confirmed: Vec<TrackSnapshot>,
    /// Confirmed tracks deleted in this step
    pub deleted: Vec<TrackId>,
    pub anomalies: Vec<Anomaly>,
}

/// Owns every live track and advances them one frame at a time.
///
/// Frames must be fed in arrival order from a single owner; state at frame N
/// depends on frame N-1.
pub struct TrackManager {
    config: TrackerConfig,
    /// Live tracks, ascending by id
    tracks: Vec<Track>,
    next_id: TrackId,
    frame_index: u64,
    last_timestamp: Option<DateTime<Utc>>,
    /// Misses already applied by `age_idle` since the last real frame
    idle_misses_applied: u32,
}

impl TrackManager {
    pub fn new(config: TrackerConfig) -> Self {
        Self::with_first_id(config, 1)
    }

    /// Start handing out ids at `first_id`, e.g. one past the largest id
    /// already stored, so a restart never reuses an identity.
    pub fn with_first_id(config: TrackerConfig, first_id: TrackId) -> Self {
        TrackManager {
            config,
            tracks: Vec::new(),
            next_id: first_id,
            frame_index: 0,
            last_timestamp: None,
            idle_misses_applied: 0,
        }
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    /// Process one detection batch: predict, associate, update, age, spawn.
    pub fn step(&mut self, frame: &Frame) -> FrameUpdate {
        self.frame_index += 1;
        let dt = self.frame_delta(frame.timestamp);
        self.last_timestamp = Some(match self.last_timestamp {
            Some(prev) if prev > frame.timestamp => prev,
            _ => frame.timestamp,
        });
        self.idle_misses_applied = 0;

        let mut anomalies = Vec::new();
        let mut detections: Vec<&Detection> = Vec::with_capacity(frame.detections.len());
        for (index, detection) in frame.detections.iter().enumerate() {
            if let Err(error) = detection.validate() {
                warn!(
                    frame = self.frame_index,
                    detection = index,
                    %error,
                    "dropping malformed detection"
                );
                anomalies.push(Anomaly {
                    detection_index: index,
                    error,
                });
                continue;
            }
            if detection.confidence < self.config.min_confidence {
                continue;
            }
            detections.push(detection);
        }

        // Predict locations
        let predicted: Vec<BoundingBox> = self.tracks.iter_mut().map(|t| t.predict(dt)).collect();
        let observed: Vec<BoundingBox> = detections.iter().map(|d| d.bbox).collect();

        let cost = iou_cost_matrix(&predicted, &observed);
        let assignment = solve(&cost, self.config.gate_threshold);

        for &(track_idx, det_idx) in &assignment.matches {
            let track = &mut self.tracks[track_idx];
            if track.update(detections[det_idx], self.config.confirmation_hits) {
                debug!(track_id = track.id(), label = %track.label(), "track confirmed");
            }
        }

        let mut deleted = Vec::new();
        for &track_idx in &assignment.unmatched_tracks {
            self.miss(track_idx, &mut deleted);
        }

        for &det_idx in &assignment.unmatched_detections {
            let id = self.next_id;
            self.next_id += 1;
            let track = Track::new(id, detections[det_idx], self.config.confirmation_hits);
            if track.is_confirmed() {
                debug!(track_id = id, label = %track.label(), "track confirmed");
            }
            self.tracks.push(track);
        }

        self.tracks.retain(|t| !t.is_deleted());

        FrameUpdate {
            frame_index: self.frame_index,
            timestamp: frame.timestamp,
            confirmed: self.confirmed_snapshots(),
            deleted,
            anomalies,
        }
    }

    /// Age tracks while the feed is silent, without predicting or matching.
    ///
    /// `idle` is the total silence so far. It is converted to
    /// `floor(idle × frame_rate)` misses, of which only those not yet applied
    /// since the last real frame are charged, so repeated calls during one
    /// stall never double count.
    pub fn age_idle(&mut self, idle: Duration) -> FrameUpdate {
        let target = (idle.as_secs_f64() * self.config.frame_rate).floor();
        let target = if target >= f64::from(u32::MAX) {
            u32::MAX
        } else {
            target as u32
        };
        let pending = target.saturating_sub(self.idle_misses_applied);
        self.idle_misses_applied = self.idle_misses_applied.max(target);

        let mut deleted = Vec::new();
        if pending > 0 && !self.tracks.is_empty() {
            for track_idx in 0..self.tracks.len() {
                for _ in 0..pending {
                    if self.tracks[track_idx].is_deleted() {
                        break;
                    }
                    self.miss(track_idx, &mut deleted);
                }
            }
            let before = self.tracks.len();
            self.tracks.retain(|t| !t.is_deleted());
            info!(
                idle_ms = idle.as_millis() as u64,
                misses = pending,
                removed = before - self.tracks.len(),
                "feed stalled, aged tracks"
            );
        }

        let timestamp = match (self.last_timestamp, chrono::Duration::from_std(idle)) {
            (Some(last), Ok(idle)) => last + idle,
            _ => Utc::now(),
        };

        FrameUpdate {
            frame_index: self.frame_index,
            timestamp,
            confirmed: self.confirmed_snapshots(),
            deleted,
            anomalies: Vec::new(),
        }
    }

    fn miss(&mut self, track_idx: usize, deleted: &mut Vec<TrackId>) {
        let track = &mut self.tracks[track_idx];
        let was_confirmed = track.is_confirmed();
        if track.mark_missed(self.config.max_age) {
            debug!(track_id = track.id(), misses = track.misses(), "track deleted");
            if was_confirmed {
                deleted.push(track.id());
            }
        }
    }

    /// Elapsed time since the previous frame, in nominal frame units.
    fn frame_delta(&self, timestamp: DateTime<Utc>) -> f32 {
        let Some(prev) = self.last_timestamp else {
            return 1.0;
        };
        let Some(micros) = (timestamp - prev).num_microseconds() else {
            return 1.0;
        };
        if micros <= 0 {
            return 1.0;
        }
        (micros as f64 / 1e6 * self.config.frame_rate) as f32
    }

    fn confirmed_snapshots(&self) -> Vec<TrackSnapshot> {
        self.tracks
            .iter()
            .filter(|t| t.is_confirmed())
            .map(Track::snapshot)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 3, 0, 0).unwrap()
    }

    /// Frame `n` of a 30 fps feed.
    fn frame(n: i64, dets: Vec<Detection>) -> Frame {
        Frame::new(t0() + chrono::Duration::microseconds(n * 33_333), dets)
    }

    fn det(x1: f32, y1: f32, x2: f32, y2: f32, label: &str) -> Detection {
        Detection::new(BoundingBox::new(x1, y1, x2, y2), 0.9, label)
    }

    fn manager() -> TrackManager {
        TrackManager::new(TrackerConfig::default())
    }

    #[test]
    fn test_three_frames_confirm_one_track() {
        let mut tm = manager();
        let u1 = tm.step(&frame(0, vec![det(10.0, 10.0, 50.0, 50.0, "car")]));
        let u2 = tm.step(&frame(1, vec![det(10.0, 10.0, 50.0, 50.0, "car")]));
        assert!(u1.confirmed.is_empty());
        assert!(u2.confirmed.is_empty());

        let u3 = tm.step(&frame(2, vec![det(10.0, 10.0, 50.0, 50.0, "car")]));
        assert_eq!(u3.confirmed.len(), 1);
        assert_eq!(u3.confirmed[0].track_id, 1);
        assert_eq!(u3.confirmed[0].label, "car");
        assert_eq!(tm.tracks().len(), 1);
    }

    #[test]
    fn test_ids_stable_for_moving_objects() {
        let mut tm = manager();
        for n in 0..20 {
            let x = n as f32 * 2.0;
            let update = tm.step(&frame(
                n,
                vec![
                    det(x, 0.0, x + 40.0, 40.0, "car"),
                    det(300.0 - x, 200.0, 340.0 - x, 240.0, "bus"),
                ],
            ));
            if n >= 2 {
                let ids: Vec<_> = update.confirmed.iter().map(|s| s.track_id).collect();
                assert_eq!(ids, vec![1, 2]);
                assert_eq!(update.confirmed[0].label, "car");
                assert_eq!(update.confirmed[1].label, "bus");
            }
        }
    }

    #[test]
    fn test_deleted_exactly_once_after_max_age() {
        let config = TrackerConfig {
            max_age: 5,
            ..TrackerConfig::default()
        };
        let mut tm = TrackManager::new(config);
        for n in 0..3 {
            tm.step(&frame(n, vec![det(10.0, 10.0, 50.0, 50.0, "car")]));
        }

        let mut deletions = Vec::new();
        for n in 3..15 {
            let update = tm.step(&frame(n, vec![]));
            if n - 3 < 5 {
                assert_eq!(update.confirmed.len(), 1, "alive at miss {}", n - 2);
            }
            deletions.extend(update.deleted);
        }
        assert_eq!(deletions, vec![1]);
        assert!(tm.tracks().is_empty());

        // Same place again: a new identity
        let update = tm.step(&frame(15, vec![det(10.0, 10.0, 50.0, 50.0, "car")]));
        assert!(update.confirmed.is_empty());
        assert_eq!(tm.tracks()[0].id(), 2);
    }

    #[test]
    fn test_ids_continue_from_first_id() {
        let mut tm = TrackManager::with_first_id(TrackerConfig::default(), 42);
        tm.step(&frame(0, vec![
            det(10.0, 10.0, 50.0, 50.0, "car"),
            det(200.0, 10.0, 240.0, 50.0, "car"),
        ]));
        let ids: Vec<_> = tm.tracks().iter().map(|t| t.id()).collect();
        assert_eq!(ids, vec![42, 43]);
    }

    #[test]
    fn test_tentative_deletion_not_reported() {
        let config = TrackerConfig {
            max_age: 0,
            ..TrackerConfig::default()
        };
        let mut tm = TrackManager::new(config);
        tm.step(&frame(0, vec![det(10.0, 10.0, 50.0, 50.0, "car")]));
        let update = tm.step(&frame(1, vec![]));
        assert!(update.deleted.is_empty());
        assert!(tm.tracks().is_empty());
    }

    #[test]
    fn test_malformed_detection_dropped_rest_processed() {
        let mut tm = manager();
        let update = tm.step(&frame(
            0,
            vec![
                det(50.0, 50.0, 10.0, 10.0, "car"),
                det(100.0, 100.0, 150.0, 150.0, "car"),
                Detection::new(BoundingBox::new(0.0, 0.0, 5.0, 5.0), 2.0, "car"),
            ],
        ));
        let indices: Vec<_> = update.anomalies.iter().map(|a| a.detection_index).collect();
        assert_eq!(indices, vec![0, 2]);
        assert!(matches!(
            update.anomalies[0].error,
            DetectionError::Degenerate { .. }
        ));
        assert_eq!(tm.tracks().len(), 1);
    }

    #[test]
    fn test_low_confidence_ignored() {
        let mut tm = manager();
        let weak = Detection::new(BoundingBox::new(0.0, 0.0, 10.0, 10.0), 0.2, "car");
        let update = tm.step(&frame(0, vec![weak]));
        assert!(update.anomalies.is_empty());
        assert!(tm.tracks().is_empty());
    }

    #[test]
    fn test_age_idle_deletes_without_new_frame() {
        let config = TrackerConfig {
            max_age: 30,
            ..TrackerConfig::default()
        };
        let mut tm = TrackManager::new(config);
        for n in 0..3 {
            tm.step(&frame(n, vec![det(10.0, 10.0, 50.0, 50.0, "car")]));
        }

        // 0.5 s at 30 fps is 15 misses: still alive
        let update = tm.age_idle(Duration::from_millis(500));
        assert_eq!(update.confirmed.len(), 1);
        assert_eq!(update.confirmed[0].misses, 15);

        // Same stall observed again: nothing more charged
        let update = tm.age_idle(Duration::from_millis(500));
        assert_eq!(update.confirmed[0].misses, 15);

        // 1.1 s total is 33 misses, past max_age
        let update = tm.age_idle(Duration::from_millis(1100));
        assert_eq!(update.deleted, vec![1]);
        assert!(update.confirmed.is_empty());
        assert!(tm.tracks().is_empty());

        let update = tm.age_idle(Duration::from_millis(5000));
        assert!(update.deleted.is_empty());
    }

    #[test]
    fn test_age_idle_timestamp_follows_feed_clock() {
        let mut tm = manager();
        tm.step(&frame(0, vec![]));
        let update = tm.age_idle(Duration::from_secs(2));
        assert_eq!(update.timestamp, t0() + chrono::Duration::seconds(2));
    }

    #[test]
    fn test_frame_delta_from_timestamps() {
        let mut tm = manager();
        assert_relative_eq!(tm.frame_delta(t0()), 1.0);

        tm.last_timestamp = Some(t0());
        let later = t0() + chrono::Duration::milliseconds(100);
        assert_relative_eq!(tm.frame_delta(later), 3.0, epsilon = 1e-4);

        // Non-increasing timestamps fall back to one frame
        assert_relative_eq!(tm.frame_delta(t0()), 1.0);
        let earlier = t0() - chrono::Duration::seconds(1);
        assert_relative_eq!(tm.frame_delta(earlier), 1.0);
    }

    #[test]
    fn test_deterministic_output() {
        let feed: Vec<Frame> = (0..12)
            .map(|n| {
                let x = n as f32 * 3.0;
                let mut dets = vec![
                    det(x, 0.0, x + 30.0, 30.0, "car"),
                    det(x + 5.0, 0.0, x + 35.0, 30.0, "motorcycle"),
                ];
                if n % 4 == 0 {
                    dets.push(det(200.0, 200.0, 220.0, 220.0, "person"));
                }
                frame(n, dets)
            })
            .collect();

        let run = || {
            let mut tm = manager();
            feed.iter().map(|f| tm.step(f)).collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
    }
}
