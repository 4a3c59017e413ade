use chrono::{DateTime, Utc};
use nalgebra::SVector;
use serde::{Deserialize, Serialize};

use crate::error::DetectionError;

/// Axis-aligned box in pixel space: `(x1, y1)` top-left, `(x2, y2)` bottom-right.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 4]", into = "[f32; 4]")]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    /// Convert to `[x, y, w, h]`, the layout the motion model works in.
    pub fn to_tlwh(&self) -> SVector<f32, 4> {
        SVector::<f32, 4>::new(self.x1, self.y1, self.width(), self.height())
    }

    pub fn from_tlwh(tlwh: &SVector<f32, 4>) -> Self {
        Self {
            x1: tlwh[0],
            y1: tlwh[1],
            x2: tlwh[0] + tlwh[2],
            y2: tlwh[1] + tlwh[3],
        }
    }

    pub fn validate(&self) -> Result<(), DetectionError> {
        if ![self.x1, self.y1, self.x2, self.y2]
            .iter()
            .all(|v| v.is_finite())
        {
            return Err(DetectionError::NonFinite);
        }
        if self.x1 >= self.x2 || self.y1 >= self.y2 {
            return Err(DetectionError::Degenerate {
                x1: self.x1,
                y1: self.y1,
                x2: self.x2,
                y2: self.y2,
            });
        }
        Ok(())
    }
}

impl From<[f32; 4]> for BoundingBox {
    fn from(v: [f32; 4]) -> Self {
        Self::new(v[0], v[1], v[2], v[3])
    }
}

impl From<BoundingBox> for [f32; 4] {
    fn from(b: BoundingBox) -> Self {
        [b.x1, b.y1, b.x2, b.y2]
    }
}

/// A single detection result, as produced by the external detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub confidence: f32,
    /// Raw detector label, any spelling or language.
    pub label: String,
}

impl Detection {
    pub fn new(bbox: BoundingBox, confidence: f32, label: impl Into<String>) -> Self {
        Self {
            bbox,
            confidence,
            label: label.into(),
        }
    }

    pub fn validate(&self) -> Result<(), DetectionError> {
        self.bbox.validate()?;
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(DetectionError::ConfidenceOutOfRange(self.confidence));
        }
        Ok(())
    }
}

/// One batch of detections for one processed video frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub detections: Vec<Detection>,
}

impl Frame {
    pub fn new(timestamp: DateTime<Utc>, detections: Vec<Detection>) -> Self {
        Self {
            timestamp,
            detections,
        }
    }
}
