use nalgebra::DMatrix;

use crate::detection::BoundingBox;

/// Compute IoU between two boxes in `x1, y1, x2, y2` form.
pub fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let x1 = a.x1.max(b.x1);
    let y1 = a.y1.max(b.y1);
    let x2 = a.x2.min(b.x2);
    let y2 = a.y2.min(b.y2);

    let inter_area = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = a.area() + b.area() - inter_area;

    if union <= 0.0 || !union.is_finite() {
        return 0.0;
    }

    inter_area / union
}

/// Association cost `1 - IoU` for every (track, detection) pair.
/// Rows are tracks, columns are detections.
pub fn iou_cost_matrix(tracks: &[BoundingBox], detections: &[BoundingBox]) -> DMatrix<f64> {
    DMatrix::from_fn(tracks.len(), detections.len(), |i, j| {
        1.0 - f64::from(iou(&tracks[i], &detections[j]))
    })
}
