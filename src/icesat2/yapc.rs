//! YAPC ("yet another photon classifier") density scores.
//!
//! Each photon is scored 0..=255 from the height proximity of its nearest
//! neighbours inside an along-track by height window.

use crate::config::YapcParams;
use crate::{Result, TracklineError};

const MAXIMUM_HSPREAD: f64 = 15_000.0;
const HSPREAD_BINSIZE: f64 = 1.0;
const MAX_KNN: usize = 25;

/// Photon subset of one track.
#[derive(Debug, Clone, Copy)]
pub struct YapcInput<'a> {
    pub segment_ph_cnt: &'a [i32],
    pub segment_dist_x: &'a [f64],
    pub dist_ph_along: &'a [f64],
    pub h_ph: &'a [f64],
}

impl YapcInput<'_> {
    fn num_photons(&self) -> usize {
        self.dist_ph_along.len().min(self.h_ph.len())
    }
}

/// Scores every photon with the configured YAPC version.
pub fn score(params: &YapcParams, minimum_photon_count: u32, input: &YapcInput<'_>) -> Result<Vec<u8>> {
    match params.version {
        3 => Ok(score_v3(params, input)),
        1 | 2 => Ok(score_v2(params, minimum_photon_count, input)),
        v => Err(TracklineError::config(format!("invalid YAPC version {v}"))),
    }
}

/// Segment-windowed scoring: neighbours come from the segment and the ones on
/// either side of it.
fn score_v2(params: &YapcParams, minimum_photon_count: u32, input: &YapcInput<'_>) -> Vec<u8> {
    let num_photons = input.num_photons();
    let mut scores = vec![0u8; num_photons];
    let counts: Vec<usize> = input.segment_ph_cnt.iter().map(|&c| c.max(0) as usize).collect();
    let num_segments = counts.len();
    if num_segments == 0 {
        return scores;
    }

    let x = input.dist_ph_along;
    let h = input.h_ph;
    let mut nearest = [0.0f64; MAX_KNN];

    let (mut b0, mut c0, mut c1, mut b1) = (0usize, 0usize, 0usize, counts[0]);
    for s in 0..num_segments {
        if s > 1 {
            b0 += counts[s - 2];
        }
        if s > 0 {
            c0 += counts[s - 1];
        }
        c1 += counts[s];
        if s + 1 < num_segments {
            b1 += counts[s + 1];
        }
        let (c1, b1) = (c1.min(num_photons), b1.min(num_photons));

        let n = counts[s];
        let knn = if params.knn != 0 {
            params.knn as usize
        } else {
            (((n as f64).sqrt() + 0.5) / 2.0).max(1.0) as usize
        };
        let knn = knn.min(MAX_KNN);
        if n <= knn || n < minimum_photon_count as usize || c0 >= c1 {
            continue;
        }

        let (mut min_h, mut max_h, mut min_x, mut max_x) = (h[c0], h[c0], x[c0], x[c0]);
        for i in c0 + 1..c1 {
            min_h = min_h.min(h[i]);
            max_h = max_h.max(h[i]);
            min_x = min_x.min(x[i]);
            max_x = max_x.max(x[i]);
        }
        let hspread = max_h - min_h;
        let xspread = max_x - min_x;
        if hspread <= 0.0 || hspread > MAXIMUM_HSPREAD || xspread <= 0.0 {
            tracing::warn!(segment = s, hspread, xspread, "invalid photon spread for YAPC");
            continue;
        }

        let num_bins = (hspread / HSPREAD_BINSIZE) as usize + 1;
        let mut occupied = vec![false; num_bins];
        for i in c0..c1 {
            let bin = ((h[i] - min_h) / HSPREAD_BINSIZE) as usize;
            occupied[bin.min(num_bins - 1)] = true;
        }
        let nonzero = occupied.iter().filter(|&&b| b).count();
        let h_span = (nonzero as f64 * HSPREAD_BINSIZE) / n as f64 * knn as f64;

        let half_win_x = params.win_x / 2.0;
        let half_win_h = if params.win_h != 0.0 { params.win_h / 2.0 } else { h_span / 2.0 };

        for y in c0..c1 {
            let mut filled = 0;
            let mut smallest = f64::MAX;
            let mut smallest_at = 0;
            for xi in b0..b1 {
                if xi == y || (x[xi] - x[y]).abs() > half_win_x {
                    continue;
                }
                let proximity = half_win_h - (h[xi] - h[y]).abs();
                if filled < knn {
                    if proximity < smallest {
                        smallest = proximity;
                        smallest_at = filled;
                    }
                    nearest[filled] = proximity;
                    filled += 1;
                } else if proximity > smallest {
                    nearest[smallest_at] = proximity;
                    smallest = proximity;
                    for (k, &v) in nearest[..knn].iter().enumerate() {
                        if v < smallest {
                            smallest = v;
                            smallest_at = k;
                        }
                    }
                }
            }
            nearest[filled..knn].fill(0.0);

            let sum: f64 = nearest[..knn].iter().filter(|&&p| p > 0.0).sum::<f64>() / knn as f64;
            scores[y] = ((sum / half_win_h) * 255.0) as u8;
        }
    }
    scores
}

/// Distance-windowed scoring over the whole track with an adaptive knn.
fn score_v3(params: &YapcParams, input: &YapcInput<'_>) -> Vec<u8> {
    let num_photons = input.num_photons();
    let mut scores = vec![0u8; num_photons];
    let hwx = params.win_x / 2.0;
    let hwz = params.win_h / 2.0;
    let h = input.h_ph;

    let mut ph_dist = Vec::with_capacity(num_photons);
    for (s, &count) in input.segment_ph_cnt.iter().enumerate() {
        let base = input.segment_dist_x.get(s).copied().unwrap_or(0.0);
        for _ in 0..count.max(0) {
            let i = ph_dist.len();
            if i >= num_photons {
                break;
            }
            ph_dist.push(base + input.dist_ph_along[i]);
        }
    }
    let num_photons = ph_dist.len();

    let mut ph_index = 0;
    let mut proximities = Vec::new();
    for &count in input.segment_ph_cnt {
        let n = (count.max(0) as usize).min(num_photons - ph_index);
        let start = ph_index;
        let mut max_knn = params.min_knn as usize;
        let mut weights = Vec::with_capacity(n);

        for _ in 0..n {
            proximities.clear();
            for neighbor in (0..ph_index).rev() {
                let x_dist = ph_dist[ph_index] - ph_dist[neighbor];
                if x_dist <= hwx {
                    let proximity = (h[ph_index] - h[neighbor]).abs();
                    if proximity <= hwz {
                        proximities.push(proximity);
                    }
                }
                if x_dist >= hwx + 1.0 {
                    break;
                }
            }
            for neighbor in ph_index + 1..num_photons {
                let x_dist = ph_dist[neighbor] - ph_dist[ph_index];
                if x_dist <= hwx {
                    let proximity = (h[ph_index] - h[neighbor]).abs();
                    if proximity <= hwz {
                        proximities.push(proximity);
                    }
                }
                if x_dist >= hwx + 1.0 {
                    break;
                }
            }
            proximities.sort_by(f64::total_cmp);

            let knn = ((proximities.len() as f64).sqrt().max(params.min_knn as f64)) as usize;
            max_knn = max_knn.max(knn);
            let weight: f64 = proximities.iter().take(knn).map(|p| hwz - p).sum();
            weights.push(weight);
            ph_index += 1;
        }

        for (i, weight) in weights.into_iter().enumerate() {
            let wt = weight / (hwz * max_knn as f64);
            scores[start + i] = (wt * 255.0).min(255.0) as u8;
        }
    }
    scores
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 20 photons half a meter apart at 100 m with photon 10 lifted to 150 m.
    fn cluster() -> (Vec<i32>, Vec<f64>, Vec<f64>, Vec<f64>) {
        let x: Vec<f64> = (0..20).map(|i| i as f64 * 0.5).collect();
        let mut h = vec![100.0; 20];
        h[10] = 150.0;
        (vec![20], vec![1000.0], x, h)
    }

    #[test]
    fn v3_scores_dense_photons_high_and_outliers_zero() {
        let (cnt, sdx, x, h) = cluster();
        let input = YapcInput { segment_ph_cnt: &cnt, segment_dist_x: &sdx, dist_ph_along: &x, h_ph: &h };
        let scores = score(&YapcParams::default(), 10, &input).unwrap();
        assert_eq!(scores[10], 0);
        assert!(scores.iter().enumerate().filter(|(i, _)| *i != 10).all(|(_, &s)| s == 255));
    }

    #[test]
    fn v2_scores_dense_photons_high_and_outliers_zero() {
        let (cnt, sdx, x, h) = cluster();
        let input = YapcInput { segment_ph_cnt: &cnt, segment_dist_x: &sdx, dist_ph_along: &x, h_ph: &h };
        let params = YapcParams { version: 2, ..YapcParams::default() };
        let scores = score(&params, 10, &input).unwrap();
        assert_eq!(scores[10], 0);
        assert_eq!(scores[0], 255);
        assert_eq!(scores[19], 255);
    }

    #[test]
    fn v2_spread_is_measured_per_segment() {
        // Segment 0 carries a spread beyond the limit; segment 1 is scored on its own spread.
        let x: Vec<f64> = (0..40).map(|i| i as f64 * 0.5).collect();
        let mut h = vec![100.0; 40];
        h[5] = 20_100.0;
        h[30] = 150.0;
        let input =
            YapcInput { segment_ph_cnt: &[20, 20], segment_dist_x: &[1000.0, 1010.0], dist_ph_along: &x, h_ph: &h };
        let params = YapcParams { version: 2, ..YapcParams::default() };
        let scores = score(&params, 10, &input).unwrap();

        assert!(scores[..20].iter().all(|&s| s == 0));
        assert_eq!(scores[30], 0);
        for (i, &s) in scores.iter().enumerate().skip(20) {
            if i != 30 {
                assert_eq!(s, 255, "photon {i}");
            }
        }
    }

    #[test]
    fn v2_skips_sparse_segments() {
        let (_, sdx, x, h) = cluster();
        let input = YapcInput { segment_ph_cnt: &[20], segment_dist_x: &sdx, dist_ph_along: &x, h_ph: &h };
        let params = YapcParams { version: 1, ..YapcParams::default() };
        let scores = score(&params, 50, &input).unwrap();
        assert!(scores.iter().all(|&s| s == 0));
    }

    #[test]
    fn unknown_version_is_a_config_error() {
        let (cnt, sdx, x, h) = cluster();
        let input = YapcInput { segment_ph_cnt: &cnt, segment_dist_x: &sdx, dist_ph_along: &x, h_ph: &h };
        let params = YapcParams { version: 7, ..YapcParams::default() };
        assert!(matches!(score(&params, 10, &input), Err(TracklineError::Config { .. })));
    }
}
