//! Deterministic DBSCAN over 2-D points sorted by their first coordinate.
//!
//! Points are expected in ascending time order; the neighbour search walks
//! outwards from each point and stops once the time gap alone exceeds the
//! radius, so dense series cost roughly O(n · window) instead of O(n²).

use super::stats;
use crate::budget::Budget;
use crate::error::DetectError;

pub type Point = [f64; 2];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Label {
    Core(usize),
    Border(usize),
    Noise,
}

impl Label {
    pub fn is_noise(&self) -> bool {
        matches!(self, Label::Noise)
    }
}

#[derive(Debug, Clone)]
pub struct Clustering {
    pub labels: Vec<Label>,
    /// Distance to the `min_samples`-th nearest point, self included.
    pub core_distances: Vec<f64>,
    pub clusters: usize,
}

impl Clustering {
    pub fn noise_count(&self) -> usize {
        self.labels.iter().filter(|l| l.is_noise()).count()
    }
}

fn distance(a: &Point, b: &Point) -> f64 {
    ((a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2)).sqrt()
}

/// Indices within `eps` of point `i`, self included, in index order.
fn region_query(points: &[Point], i: usize, eps: f64) -> Vec<usize> {
    let origin = &points[i];
    let mut lo = i;
    while lo > 0 && origin[0] - points[lo - 1][0] <= eps {
        lo -= 1;
    }
    let mut hi = i;
    while hi + 1 < points.len() && points[hi + 1][0] - origin[0] <= eps {
        hi += 1;
    }
    (lo..=hi)
        .filter(|&j| distance(origin, &points[j]) <= eps)
        .collect()
}

/// k-th smallest distance from point `i` (k counts the point itself).
fn core_distance(points: &[Point], i: usize, k: usize) -> f64 {
    if k <= 1 {
        return 0.0;
    }
    let origin = &points[i];
    let mut best: Vec<f64> = vec![0.0];
    let (mut left, mut right) = (i, i + 1);
    loop {
        let kth = if best.len() >= k { best[k - 1] } else { f64::INFINITY };
        let left_gap = if left > 0 { origin[0] - points[left - 1][0] } else { f64::INFINITY };
        let right_gap = if right < points.len() { points[right][0] - origin[0] } else { f64::INFINITY };
        if left_gap.min(right_gap) > kth || (left_gap.is_infinite() && right_gap.is_infinite()) {
            break;
        }
        let j = if left_gap <= right_gap {
            left -= 1;
            left
        } else {
            right += 1;
            right - 1
        };
        let d = distance(origin, &points[j]);
        let pos = best.partition_point(|&x| x <= d);
        best.insert(pos, d);
        best.truncate(k);
    }
    best.get(k - 1).copied().unwrap_or(f64::INFINITY)
}

/// Cluster `points` (sorted by first coordinate).
pub fn cluster(
    points: &[Point],
    eps: f64,
    min_samples: usize,
    budget: &Budget,
) -> Result<Clustering, DetectError> {
    let n = points.len();
    let min_samples = min_samples.max(1);
    let mut labels: Vec<Option<Label>> = vec![None; n];
    let mut core_distances = Vec::with_capacity(n);
    for i in 0..n {
        if i % 256 == 0 {
            budget.check()?;
        }
        core_distances.push(core_distance(points, i, min_samples));
    }
    let is_core = |i: usize| core_distances[i] <= eps;

    let mut cluster_id = 0;
    for i in 0..n {
        if labels[i].is_some() || !is_core(i) {
            continue;
        }
        budget.check()?;
        labels[i] = Some(Label::Core(cluster_id));
        let mut frontier = region_query(points, i, eps);
        let mut cursor = 0;
        while cursor < frontier.len() {
            let j = frontier[cursor];
            cursor += 1;
            if j == i {
                continue;
            }
            match labels[j] {
                Some(Label::Core(_)) | Some(Label::Border(_)) => continue,
                _ => {}
            }
            if is_core(j) {
                labels[j] = Some(Label::Core(cluster_id));
                for k in region_query(points, j, eps) {
                    if labels[k].is_none() {
                        frontier.push(k);
                    }
                }
            } else {
                labels[j] = Some(Label::Border(cluster_id));
            }
        }
        cluster_id += 1;
    }

    Ok(Clustering {
        labels: labels.into_iter().map(|l| l.unwrap_or(Label::Noise)).collect(),
        core_distances,
        clusters: cluster_id,
    })
}

/// Embed a time-ordered series into the clustering feature space.
///
/// The time axis counts sampling steps, where each gap is measured in
/// median intervals and capped at `max_gap_steps`; the value axis is a
/// robust z-score. Both are therefore independent of the range length.
pub fn embed(times: &[i64], values: &[f64], time_weight: f64, max_gap_steps: f64) -> Vec<Point> {
    let gaps: Vec<f64> = times.windows(2).map(|w| (w[1] - w[0]) as f64).collect();
    let step = stats::median(&gaps);

    let center = stats::median(values);
    let scale = stats::robust_scale(values);

    let mut t = 0.0;
    let mut points = Vec::with_capacity(values.len());
    for (i, v) in values.iter().enumerate() {
        if i > 0 {
            let steps = if step > 0.0 { gaps[i - 1] / step } else { 1.0 };
            t += steps.min(max_gap_steps);
        }
        let z = if scale > 0.0 { (v - center) / scale } else { 0.0 };
        points.push([t * time_weight, z]);
    }
    points
}
