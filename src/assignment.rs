//! Minimum-cost one-to-one assignment between tracks and detections.
//!
//! Costs are quantized to integers and handed to the Kuhn-Munkres solver from
//! `pathfinding`, padded to a square matrix with zero-cost dummy cells. Pairs
//! landing on a dummy cell, or whose cost exceeds the gate, are reported as
//! unmatched. Among assignments of equal total cost, the lower track index
//! wins first, then the lower detection index.

use nalgebra::DMatrix;
use pathfinding::kuhn_munkres::kuhn_munkres;
use pathfinding::matrix::Matrix;

/// Costs that agree to this many parts per million count as equal.
const COST_SCALE: f64 = 1_000_000.0;

/// Result of one association round. All index lists are ascending.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Assignment {
    /// `(track_index, detection_index)` pairs, sorted by track index.
    pub matches: Vec<(usize, usize)>,
    pub unmatched_tracks: Vec<usize>,
    pub unmatched_detections: Vec<usize>,
}

fn sanitize(c: f64) -> f64 {
    if c.is_finite() {
        c
    } else {
        1.0
    }
}

/// Solve the assignment for a `tracks × detections` cost matrix and drop
/// pairs costing more than `gate`.
///
/// Non-finite costs are treated as the worst possible cost (1.0).
pub fn solve(cost: &DMatrix<f64>, gate: f64) -> Assignment {
    let (n_tracks, n_dets) = cost.shape();

    if n_tracks == 0 || n_dets == 0 {
        return Assignment {
            matches: Vec::new(),
            unmatched_tracks: (0..n_tracks).collect(),
            unmatched_detections: (0..n_dets).collect(),
        };
    }

    let quantized = DMatrix::from_fn(n_tracks, n_dets, |i, j| {
        (sanitize(cost[(i, j)]) * COST_SCALE).round() as i64
    });

    // kuhn_munkres maximizes and wants rows <= columns
    let n = n_tracks.max(n_dets);
    let mut weights = Matrix::new(n, n, 0i64);
    for i in 0..n_tracks {
        for j in 0..n_dets {
            weights[(i, j)] = -quantized[(i, j)];
        }
    }
    let (_, col_for_row) = kuhn_munkres(&weights);

    let mut det_for_track: Vec<Option<usize>> = col_for_row[..n_tracks]
        .iter()
        .map(|&j| (j < n_dets).then_some(j))
        .collect();
    settle_ties(&quantized, &mut det_for_track);

    let mut assignment = Assignment::default();
    let mut det_taken = vec![false; n_dets];
    for (track_idx, det) in det_for_track.iter().enumerate() {
        match det {
            Some(det_idx) if sanitize(cost[(track_idx, *det_idx)]) <= gate => {
                assignment.matches.push((track_idx, *det_idx));
                det_taken[*det_idx] = true;
            }
            _ => assignment.unmatched_tracks.push(track_idx),
        }
    }
    assignment.unmatched_detections = det_taken
        .iter()
        .enumerate()
        .filter(|(_, taken)| !**taken)
        .map(|(j, _)| j)
        .collect();

    assignment
}

/// Rewrite an optimal assignment into the equal-cost one preferred by index
/// order. Every move keeps the total cost and makes the per-track detection
/// sequence lexicographically smaller (unmatched sorts last), so the loop
/// terminates.
fn settle_ties(cost: &DMatrix<i64>, det_for_track: &mut [Option<usize>]) {
    let n_tracks = det_for_track.len();
    loop {
        let mut changed = false;
        for i in 0..n_tracks {
            if let Some(di) = det_for_track[i] {
                let lower_free = (0..di).find(|&j| {
                    cost[(i, j)] == cost[(i, di)] && !det_for_track.contains(&Some(j))
                });
                if let Some(j) = lower_free {
                    det_for_track[i] = Some(j);
                    changed = true;
                }
            }
            for k in i + 1..n_tracks {
                match (det_for_track[i], det_for_track[k]) {
                    (Some(di), Some(dk))
                        if dk < di
                            && cost[(i, dk)] + cost[(k, di)] == cost[(i, di)] + cost[(k, dk)] =>
                    {
                        det_for_track.swap(i, k);
                    }
                    (None, Some(dk)) if cost[(i, dk)] == cost[(k, dk)] => {
                        det_for_track.swap(i, k);
                    }
                    _ => continue,
                }
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
}
