// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Shape-based clustering of z-scored series.
//!
//! [`ShapeClusterer`] is the seam used by model selection; [`KShape`] is the
//! built-in implementation (Paparrizos & Gravano, 2015). Distances are shape
//! based distances (SBD): one minus the maximal normalized cross-correlation
//! over all shifts.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::stats;

/// One group of a partition.
#[derive(Debug, Clone, PartialEq)]
pub struct ShapeCluster {
    pub centroid: Vec<f64>,
    /// Indices into the clustered series; may be empty.
    pub members: Vec<usize>,
}

/// Partition `series` into `k` groups.
///
/// Every input index appears in exactly one returned cluster and exactly `k`
/// clusters are returned. Callers z-score the series beforehand.
pub trait ShapeClusterer: Send + Sync {
    fn cluster(&self, series: &[Vec<f64>], k: usize) -> Vec<ShapeCluster>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KShapeConfig {
    pub max_iterations: usize,
    /// Seed of the random initial assignment.
    pub seed: u64,
}

impl Default for KShapeConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            seed: 0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct KShape {
    config: KShapeConfig,
}

impl KShape {
    pub fn with_config(config: KShapeConfig) -> Self {
        Self { config }
    }
}

impl ShapeClusterer for KShape {
    fn cluster(&self, series: &[Vec<f64>], k: usize) -> Vec<ShapeCluster> {
        if k == 0 {
            return Vec::new();
        }
        let len = series.iter().map(Vec::len).max().unwrap_or(0);
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let mut labels: Vec<usize> = series.iter().map(|_| rng.random_range(0..k)).collect();
        let mut centroids = vec![vec![0.0; len]; k];

        for iteration in 0..self.config.max_iterations {
            centroids = (0..k)
                .into_par_iter()
                .map(|j| extract_shape(series, &labels, j, &centroids[j]))
                .collect();

            let next: Vec<usize> = series
                .par_iter()
                .map(|s| {
                    centroids
                        .iter()
                        .map(|c| sbd(s, c).0)
                        .enumerate()
                        .fold((0, f64::INFINITY), |best, (j, d)| {
                            if d < best.1 { (j, d) } else { best }
                        })
                        .0
                })
                .collect();
            if next == labels {
                tracing::trace!(iteration, k, "k-shape converged");
                break;
            }
            labels = next;
        }

        centroids
            .into_iter()
            .enumerate()
            .map(|(j, centroid)| ShapeCluster {
                centroid,
                members: labels
                    .iter()
                    .enumerate()
                    .filter(|(_, label)| **label == j)
                    .map(|(i, _)| i)
                    .collect(),
            })
            .collect()
    }
}

/// Refine the centroid of cluster `j` as the leading eigenvector of the
/// centred scatter matrix of its shift-aligned members.
fn extract_shape(series: &[Vec<f64>], labels: &[usize], j: usize, current: &[f64]) -> Vec<f64> {
    let aligned: Vec<Vec<f64>> = series
        .iter()
        .zip(labels)
        .filter(|(_, label)| **label == j)
        .map(|(s, _)| {
            if current.iter().all(|v| *v == 0.0) {
                s.clone()
            } else {
                sbd(current, s).1
            }
        })
        .collect();
    let Some(first) = aligned.first() else {
        return vec![0.0; current.len()];
    };

    let rows: Vec<Vec<f64>> = aligned.iter().map(|a| stats::zscore(a, 1)).collect();
    let mut centroid = leading_eigenvector(&rows, current.len().max(first.len()));

    let towards: f64 = first.iter().zip(&centroid).map(|(a, c)| (a - c).powi(2)).sum();
    let away: f64 = first.iter().zip(&centroid).map(|(a, c)| (a + c).powi(2)).sum();
    if towards >= away {
        centroid.iter_mut().for_each(|c| *c = -*c);
    }
    stats::zscore(&centroid, 1)
}

/// Leading eigenvector of `P·YᵀY·P` with `P = I - 1/n`, by power iteration.
fn leading_eigenvector(rows: &[Vec<f64>], n: usize) -> Vec<f64> {
    const ITERATIONS: usize = 200;
    const TOLERANCE: f64 = 1e-10;

    let centre = |v: &mut Vec<f64>| {
        let m = stats::mean(v);
        v.iter_mut().for_each(|x| *x -= m);
    };
    let apply = |v: &[f64]| -> Vec<f64> {
        let mut centred = v.to_vec();
        centre(&mut centred);
        let mut out = vec![0.0; n];
        for row in rows {
            let w: f64 = row.iter().zip(&centred).map(|(a, b)| a * b).sum();
            out.iter_mut().zip(row).for_each(|(o, a)| *o += w * a);
        }
        centre(&mut out);
        out
    };

    // Start from the member sum, or a ramp when the members cancel out.
    let mut v: Vec<f64> = (0..n)
        .map(|t| rows.iter().map(|r| r.get(t).copied().unwrap_or(0.0)).sum::<f64>())
        .collect();
    if norm(&v) == 0.0 {
        v = (0..n).map(|t| t as f64 + 1.0).collect();
    }
    let mut v = normalized(v);
    for _ in 0..ITERATIONS {
        let next = apply(&v);
        if norm(&next) == 0.0 {
            break;
        }
        let next = normalized(next);
        let delta = next.iter().zip(&v).map(|(a, b)| (a - b).abs()).fold(0.0, f64::max);
        v = next;
        if delta < TOLERANCE {
            break;
        }
    }
    v
}

fn norm(v: &[f64]) -> f64 {
    v.iter().map(|x| x * x).sum::<f64>().sqrt()
}

fn normalized(v: Vec<f64>) -> Vec<f64> {
    let n = norm(&v);
    v.into_iter().map(|x| x / n).collect()
}

/// Shape based distance of `x` and `y`, and `y` shifted onto `x`.
///
/// The distance lies in `[0, 1]`. A series with zero norm is at distance 1
/// from everything except an identical series.
pub fn sbd(x: &[f64], y: &[f64]) -> (f64, Vec<f64>) {
    let n = x.len().max(y.len());
    let den = norm(x) * norm(y);
    if den == 0.0 {
        let distance = if x == y { 0.0 } else { 1.0 };
        return (distance, y.to_vec());
    }
    let cc = cross_correlation(x, y, n);
    let (best, value) = cc
        .iter()
        .enumerate()
        .fold((0, f64::NEG_INFINITY), |best, (i, v)| if *v > best.1 { (i, *v) } else { best });
    let distance = (1.0 - value / den).clamp(0.0, 1.0);
    let shift = best as i64 - (n as i64 - 1);
    (distance, roll_zero_padded(y, shift))
}

/// SBD between every pair of series, computed in parallel.
pub fn sbd_matrix(series: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let upper: Vec<Vec<f64>> = (0..series.len())
        .into_par_iter()
        .map(|i| {
            (i + 1..series.len())
                .map(|j| sbd(&series[i], &series[j]).0)
                .collect()
        })
        .collect();
    let mut matrix = vec![vec![0.0; series.len()]; series.len()];
    for (i, row) in upper.iter().enumerate() {
        for (offset, d) in row.iter().enumerate() {
            let j = i + 1 + offset;
            matrix[i][j] = *d;
            matrix[j][i] = *d;
        }
    }
    matrix
}

/// Shift `y` right by `shift` samples (left when negative), filling with zeros.
fn roll_zero_padded(y: &[f64], shift: i64) -> Vec<f64> {
    let n = y.len();
    let mut out = vec![0.0; n];
    for (i, value) in y.iter().enumerate() {
        let target = i as i64 + shift;
        if (0..n as i64).contains(&target) {
            out[target as usize] = *value;
        }
    }
    out
}

/// `cc[i] = Σ x[t + s]·y[t]` for shifts `s = i - (n - 1)`, `i` in `0..2n-1`.
fn cross_correlation(x: &[f64], y: &[f64], n: usize) -> Vec<f64> {
    let size = (2 * n - 1).next_power_of_two();
    let load = |s: &[f64]| {
        let mut buf = vec![Complex::default(); size];
        buf.iter_mut().zip(s).for_each(|(b, v)| b.re = *v);
        fft(&mut buf, false);
        buf
    };
    let fx = load(x);
    let fy = load(y);
    let mut product: Vec<Complex> = fx.iter().zip(&fy).map(|(a, b)| a.mul(b.conj())).collect();
    fft(&mut product, true);

    let scale = size as f64;
    let negative = product[size - (n - 1)..].iter();
    let positive = product[..n].iter();
    negative.chain(positive).map(|c| c.re / scale).collect()
}

#[derive(Debug, Clone, Copy, Default)]
struct Complex {
    re: f64,
    im: f64,
}

impl Complex {
    fn mul(self, other: Complex) -> Complex {
        Complex {
            re: self.re * other.re - self.im * other.im,
            im: self.re * other.im + self.im * other.re,
        }
    }

    fn conj(self) -> Complex {
        Complex {
            re: self.re,
            im: -self.im,
        }
    }
}

/// In-place iterative radix-2 FFT; `buf.len()` must be a power of two.
fn fft(buf: &mut [Complex], inverse: bool) {
    let n = buf.len();
    let mut j = 0;
    for i in 1..n {
        let mut bit = n >> 1;
        while j & bit != 0 {
            j ^= bit;
            bit >>= 1;
        }
        j |= bit;
        if i < j {
            buf.swap(i, j);
        }
    }

    let sign = if inverse { 1.0 } else { -1.0 };
    let mut len = 2;
    while len <= n {
        let angle = sign * 2.0 * std::f64::consts::PI / len as f64;
        let step = Complex {
            re: angle.cos(),
            im: angle.sin(),
        };
        for start in (0..n).step_by(len) {
            let mut w = Complex { re: 1.0, im: 0.0 };
            for k in 0..len / 2 {
                let even = buf[start + k];
                let odd = buf[start + k + len / 2].mul(w);
                buf[start + k] = Complex {
                    re: even.re + odd.re,
                    im: even.im + odd.im,
                };
                buf[start + k + len / 2] = Complex {
                    re: even.re - odd.re,
                    im: even.im - odd.im,
                };
                w = w.mul(step);
            }
        }
        len <<= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sine(len: usize, phase: f64) -> Vec<f64> {
        stats::zscore(
            &(0..len).map(|t| (t as f64 / 4.0 + phase).sin()).collect::<Vec<_>>(),
            0,
        )
    }

    #[test]
    fn test_cross_correlation_matches_direct_sum() {
        let x = [1.0, 2.0, 3.0];
        let y = [0.0, 1.0, 0.5];
        let cc = cross_correlation(&x, &y, 3);
        // shifts -2..=2
        let expected = [0.5, 2.0, 3.5, 3.0, 0.0];
        for (got, want) in cc.iter().zip(expected) {
            assert!((got - want).abs() < 1e-9, "{cc:?}");
        }
    }

    #[test]
    fn test_sbd_identity_and_shift() {
        let x = sine(64, 0.0);
        let (d, _) = sbd(&x, &x);
        assert!(d.abs() < 1e-9);

        let mut shifted = vec![0.0; 3];
        shifted.extend_from_slice(&x[..61]);
        let (d, aligned) = sbd(&x, &shifted);
        assert!(d < 0.1, "distance {d}");
        assert!((aligned[10] - x[10]).abs() < 1e-9);
    }

    #[test]
    fn test_sbd_zero_norm() {
        let zero = vec![0.0; 8];
        assert_eq!(sbd(&zero, &zero).0, 0.0);
        assert_eq!(sbd(&zero, &sine(8, 0.0)).0, 1.0);
        assert_eq!(sbd(&sine(8, 0.0), &zero).0, 1.0);
    }

    #[test]
    fn test_kshape_separates_shapes() {
        let mut series = Vec::new();
        for phase in [0.0, 0.05, 0.1, 0.15] {
            series.push(sine(80, phase));
        }
        for i in 0..4 {
            let step: Vec<f64> = (0..80).map(|t| if t < 38 + i { 0.0 } else { 1.0 }).collect();
            series.push(stats::zscore(&step, 0));
        }
        let clusters = KShape::default().cluster(&series, 2);
        assert_eq!(clusters.len(), 2);
        let of = |i: usize| clusters.iter().position(|c| c.members.contains(&i)).unwrap();
        for i in 1..4 {
            assert_eq!(of(0), of(i));
            assert_eq!(of(4), of(4 + i));
        }
        assert_ne!(of(0), of(4));
    }

    #[test]
    fn test_kshape_is_seeded() {
        let series: Vec<Vec<f64>> = (0..6).map(|i| sine(40, i as f64)).collect();
        let a = KShape::default().cluster(&series, 3);
        let b = KShape::default().cluster(&series, 3);
        assert_eq!(a, b);
    }

    #[test]
    fn test_matrix_is_symmetric() {
        let series: Vec<Vec<f64>> = (0..4).map(|i| sine(32, i as f64 * 0.7)).collect();
        let m = sbd_matrix(&series);
        for i in 0..4 {
            assert_eq!(m[i][i], 0.0);
            for j in 0..4 {
                assert_eq!(m[i][j], m[j][i]);
            }
        }
    }

    proptest! {
        #[test]
        fn prop_partition_covers_every_series(k in 1usize..5, count in 1usize..8) {
            let series: Vec<Vec<f64>> = (0..count).map(|i| sine(24, i as f64 * 0.9)).collect();
            let clusters = KShape::default().cluster(&series, k);
            prop_assert_eq!(clusters.len(), k);
            let mut seen: Vec<usize> = clusters.iter().flat_map(|c| c.members.clone()).collect();
            seen.sort_unstable();
            prop_assert_eq!(seen, (0..count).collect::<Vec<_>>());
        }

        #[test]
        fn prop_sbd_is_bounded_and_symmetric(
            x in proptest::collection::vec(-10.0f64..10.0, 16),
            y in proptest::collection::vec(-10.0f64..10.0, 16),
        ) {
            let (a, _) = sbd(&x, &y);
            let (b, _) = sbd(&y, &x);
            prop_assert!((0.0..=1.0).contains(&a));
            prop_assert!((a - b).abs() < 1e-9);
        }
    }
}
