// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Choosing the number of clusters per service.
//!
//! Every k in the configured range is clustered and scored with the
//! silhouette coefficient over the SBD distance matrix. Scores are kept for
//! every k; the best k is the highest defined score, smallest k on ties.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::shape::{sbd_matrix, ShapeCluster, ShapeClusterer};

/// Score of a partition whose silhouette is not defined.
pub const UNDEFINED_SCORE: f64 = -1.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SelectionConfig {
    pub min_k: usize,
    pub max_k: usize,
    /// Exclusive upper bound for k when the best k lands at the top of the
    /// range. `None` disables the extension.
    pub extend_limit: Option<usize>,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            min_k: 1,
            max_k: 7,
            extend_limit: Some(15),
        }
    }
}

/// A scored partition for one k.
#[derive(Debug, Clone)]
pub struct Partition {
    pub k: usize,
    pub clusters: Vec<ShapeCluster>,
    /// `None` for k = 1.
    pub score: Option<f64>,
}

/// Partitions computed by [`ModelSelector::select`] and the resulting best k.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    /// Newly computed partitions, ascending k.
    pub partitions: Vec<Partition>,
    pub best_k: Option<usize>,
}

pub struct ModelSelector<C> {
    clusterer: C,
    config: SelectionConfig,
}

impl<C: ShapeClusterer> ModelSelector<C> {
    pub fn new(clusterer: C, config: SelectionConfig) -> Self {
        Self { clusterer, config }
    }

    pub fn config(&self) -> &SelectionConfig {
        &self.config
    }

    /// Cluster `series` into `k` groups and score the result.
    pub fn evaluate(&self, series: &[Vec<f64>], k: usize) -> Partition {
        let clusters = self.clusterer.cluster(series, k);
        let score = (k > 1).then(|| {
            let labels = labels(series.len(), &clusters);
            silhouette_score(&sbd_matrix(series), &labels)
        });
        Partition { k, clusters, score }
    }

    /// The primary k range for `metrics` series, capped at `metrics`.
    pub fn candidates(&self, metrics: usize) -> Range<usize> {
        let upper = self.config.max_k.min(metrics);
        self.config.min_k.max(1)..upper + 1
    }

    /// Additional k to evaluate when `best_k` lies at the top of the range.
    pub fn extension(&self, best_k: Option<usize>, metrics: usize) -> Range<usize> {
        let max_k = self.config.max_k;
        match (best_k, self.config.extend_limit) {
            (Some(best), Some(limit)) if best + 1 >= max_k => max_k + 1..metrics.min(limit),
            _ => 0..0,
        }
    }

    /// Evaluate every k not yet in `recorded` and determine the best k over
    /// both the recorded and the new scores.
    pub fn select(
        &self,
        series: &[Vec<f64>],
        recorded: &BTreeMap<usize, Option<f64>>,
    ) -> Selection {
        let mut scores = recorded.clone();
        let mut partitions = Vec::new();
        let mut run = |ks: Range<usize>, scores: &mut BTreeMap<usize, Option<f64>>| {
            for k in ks {
                if scores.contains_key(&k) {
                    continue;
                }
                let partition = self.evaluate(series, k);
                tracing::debug!(k, score = ?partition.score, "evaluated partition");
                scores.insert(k, partition.score);
                partitions.push(partition);
            }
        };

        let candidates = self.candidates(series.len());
        run(candidates.clone(), &mut scores);
        let primary: BTreeMap<usize, Option<f64>> = scores
            .iter()
            .filter(|(k, _)| candidates.contains(k))
            .map(|(k, s)| (*k, *s))
            .collect();
        let extension = self.extension(best_k(&primary), series.len());
        run(extension, &mut scores);

        Selection {
            partitions,
            best_k: best_k(&scores),
        }
    }
}

/// Highest defined score, smallest k on ties; `None` when no k has a score
/// above [`UNDEFINED_SCORE`].
pub fn best_k(scores: &BTreeMap<usize, Option<f64>>) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (k, score) in scores {
        let Some(score) = *score else { continue };
        if score > best.map_or(UNDEFINED_SCORE, |(_, s)| s) {
            best = Some((*k, score));
        }
    }
    best.map(|(k, _)| k)
}

/// Cluster label of every series index.
pub fn labels(len: usize, clusters: &[ShapeCluster]) -> Vec<usize> {
    let mut labels = vec![0; len];
    for (label, cluster) in clusters.iter().enumerate() {
        for member in &cluster.members {
            labels[*member] = label;
        }
    }
    labels
}

/// Mean silhouette coefficient of `labels` over a precomputed distance matrix.
///
/// Returns [`UNDEFINED_SCORE`] unless there are at least two populated
/// clusters and fewer clusters than samples.
pub fn silhouette_score(distances: &[Vec<f64>], labels: &[usize]) -> f64 {
    let distinct: BTreeSet<usize> = labels.iter().copied().collect();
    if distinct.len() < 2 || distinct.len() >= labels.len() {
        return UNDEFINED_SCORE;
    }

    let total: f64 = (0..labels.len())
        .map(|i| {
            let mut sums: BTreeMap<usize, (f64, usize)> = BTreeMap::new();
            for (j, label) in labels.iter().enumerate() {
                if i != j {
                    let entry = sums.entry(*label).or_default();
                    entry.0 += distances[i][j];
                    entry.1 += 1;
                }
            }
            let own = labels[i];
            let Some(&(own_sum, own_count)) = sums.get(&own) else {
                // Singleton clusters contribute zero.
                return 0.0;
            };
            let a = own_sum / own_count as f64;
            let b = sums
                .iter()
                .filter(|(label, _)| **label != own)
                .map(|(_, (sum, count))| sum / *count as f64)
                .fold(f64::INFINITY, f64::min);
            let denominator = a.max(b);
            if denominator == 0.0 {
                0.0
            } else {
                (b - a) / denominator
            }
        })
        .sum();
    total / labels.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::KShape;
    use proptest::prelude::*;

    /// Clusters by a fixed assignment, ignoring the data.
    struct Fixed(Vec<usize>);

    impl ShapeClusterer for Fixed {
        fn cluster(&self, series: &[Vec<f64>], k: usize) -> Vec<ShapeCluster> {
            (0..k)
                .map(|j| ShapeCluster {
                    centroid: vec![0.0; series.first().map_or(0, Vec::len)],
                    members: (0..series.len()).filter(|i| self.0[*i] % k == j).collect(),
                })
                .collect()
        }
    }

    fn scores(pairs: &[(usize, Option<f64>)]) -> BTreeMap<usize, Option<f64>> {
        pairs.iter().copied().collect()
    }

    #[test]
    fn test_silhouette_two_tight_groups() {
        let d = vec![
            vec![0.0, 0.1, 0.9, 0.9],
            vec![0.1, 0.0, 0.9, 0.9],
            vec![0.9, 0.9, 0.0, 0.1],
            vec![0.9, 0.9, 0.1, 0.0],
        ];
        let score = silhouette_score(&d, &[0, 0, 1, 1]);
        assert!((score - (0.8 / 0.9)).abs() < 1e-12);
    }

    #[test]
    fn test_silhouette_undefined() {
        let d = vec![vec![0.0; 3]; 3];
        assert_eq!(silhouette_score(&d, &[0, 0, 0]), UNDEFINED_SCORE);
        assert_eq!(silhouette_score(&d, &[0, 1, 2]), UNDEFINED_SCORE);
    }

    #[test]
    fn test_best_k_prefers_smallest_on_ties() {
        assert_eq!(best_k(&scores(&[(1, None), (2, Some(0.4)), (3, Some(0.4))])), Some(2));
        assert_eq!(best_k(&scores(&[(2, Some(0.1)), (3, Some(0.7))])), Some(3));
        assert_eq!(best_k(&scores(&[(1, None), (2, Some(-1.0))])), None);
    }

    #[test]
    fn test_candidates_capped_at_metric_count() {
        let selector = ModelSelector::new(KShape::default(), SelectionConfig::default());
        assert_eq!(selector.candidates(3), 1..4);
        assert_eq!(selector.candidates(30), 1..8);
    }

    #[test]
    fn test_extension_only_near_top_of_range() {
        let selector = ModelSelector::new(KShape::default(), SelectionConfig::default());
        assert_eq!(selector.extension(Some(7), 20), 8..15);
        assert_eq!(selector.extension(Some(6), 10), 8..10);
        assert!(selector.extension(Some(5), 20).is_empty());
        assert!(selector.extension(None, 20).is_empty());

        let disabled = ModelSelector::new(
            KShape::default(),
            SelectionConfig {
                extend_limit: None,
                ..Default::default()
            },
        );
        assert!(disabled.extension(Some(7), 20).is_empty());
    }

    #[test]
    fn test_select_skips_recorded_k() {
        let series: Vec<Vec<f64>> = (0..4).map(|i| vec![i as f64, 1.0, 0.0]).collect();
        let selector = ModelSelector::new(
            Fixed(vec![0, 1, 2, 3]),
            SelectionConfig {
                max_k: 3,
                ..Default::default()
            },
        );
        let recorded = scores(&[(1, None), (2, Some(0.9))]);
        let selection = selector.select(&series, &recorded);
        let ks: Vec<usize> = selection.partitions.iter().map(|p| p.k).collect();
        assert_eq!(ks, vec![3]);
        assert!(selection.partitions[0].score.is_some());
    }

    #[test]
    fn test_k_one_has_no_score() {
        let series = vec![vec![1.0, 2.0, 3.0], vec![3.0, 2.0, 1.0]];
        let selector = ModelSelector::new(KShape::default(), SelectionConfig::default());
        let partition = selector.evaluate(&series, 1);
        assert_eq!(partition.score, None);
        assert_eq!(partition.clusters[0].members, vec![0, 1]);
    }

    proptest! {
        #[test]
        fn prop_silhouette_in_range(
            labels in proptest::collection::vec(0usize..3, 2..12),
            seed in proptest::collection::vec(0.0f64..1.0, 144),
        ) {
            let n = labels.len();
            let mut d = vec![vec![0.0; n]; n];
            for i in 0..n {
                for j in i + 1..n {
                    d[i][j] = seed[i * 12 + j];
                    d[j][i] = d[i][j];
                }
            }
            let score = silhouette_score(&d, &labels);
            prop_assert!((-1.0..=1.0).contains(&score));
            let distinct: BTreeSet<usize> = labels.iter().copied().collect();
            if distinct.len() < 2 {
                prop_assert_eq!(score, UNDEFINED_SCORE);
            }
        }
    }
}
