// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Dependency graphs from causality results.
//!
//! A metric pair becomes a directed edge only when exactly one of its two
//! directions is significant at the evaluated lag. Pairs significant in both
//! directions, or in neither, carry no direction and are left out.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::io::Write as _;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::causality::CausalityResult;
use crate::error::{Error, Result};
use crate::stats;
use crate::store::{to_pretty_json, write_atomically};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GraphConfig {
    /// Significance thresholds, each evaluated on its own.
    pub significance: Vec<f64>,
    /// Granger lag whose p-value decides the direction.
    pub lag: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            significance: vec![0.01, 0.05, 0.10],
            lag: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub perpetrator_service: String,
    pub perpetrator_metric: String,
    pub consequence_service: String,
    pub consequence_metric: String,
    /// `1 - p_value`.
    pub confidence: f64,
    pub p_value: f64,
    pub lag: usize,
    pub quotient_slope: f64,
    pub selected: bool,
}

impl DependencyEdge {
    fn key(&self) -> (&str, &str, &str, &str) {
        (
            &self.perpetrator_service,
            &self.perpetrator_metric,
            &self.consequence_service,
            &self.consequence_metric,
        )
    }
}

/// Edges that pass one significance threshold.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DependencyGraph {
    pub significance: f64,
    pub edges: Vec<DependencyEdge>,
}

#[derive(Debug, Clone, Default)]
pub struct GraphBuilder {
    config: GraphConfig,
}

impl GraphBuilder {
    pub fn with_config(config: GraphConfig) -> Self {
        Self { config }
    }

    /// One graph per configured threshold.
    pub fn build(&self, results: &[CausalityResult]) -> Vec<DependencyGraph> {
        self.config
            .significance
            .iter()
            .map(|&significance| DependencyGraph {
                significance,
                edges: self.edges(results, significance),
            })
            .collect()
    }

    /// Directed edges at threshold `alpha`, sorted by endpoint names.
    pub fn edges(&self, results: &[CausalityResult], alpha: f64) -> Vec<DependencyEdge> {
        let lag = self.config.lag;
        let mut edges: Vec<DependencyEdge> = directed_pairs(results)
            .into_iter()
            .filter_map(|(forward, backward)| {
                let p_forward = forward.p_value(lag).unwrap_or(f64::NAN);
                let p_backward = backward.p_value(lag).unwrap_or(f64::NAN);
                let (winner, p_value) = match (p_forward <= alpha, p_backward <= alpha) {
                    (true, false) => (forward, p_forward),
                    (false, true) => (backward, p_backward),
                    _ => return None,
                };
                Some(DependencyEdge {
                    perpetrator_service: winner.perpetrator_service.clone(),
                    perpetrator_metric: winner.perpetrator_metric.clone(),
                    consequence_service: winner.consequence_service.clone(),
                    consequence_metric: winner.consequence_metric.clone(),
                    confidence: 1.0 - p_value,
                    p_value,
                    lag,
                    quotient_slope: winner.quotient.slope,
                    selected: winner.selected,
                })
            })
            .collect();
        edges.sort_by(|a, b| a.key().cmp(&b.key()));
        edges
    }
}

type MetricId<'a> = (&'a str, &'a str);

/// Both directions of every tested metric pair, keeping the first row seen
/// for each direction. Pairs with only one direction are dropped.
fn directed_pairs(results: &[CausalityResult]) -> Vec<(&CausalityResult, &CausalityResult)> {
    let mut pairs: BTreeMap<(MetricId<'_>, MetricId<'_>), [Option<&CausalityResult>; 2]> =
        BTreeMap::new();
    for result in results {
        let perpetrator = (result.perpetrator_service.as_str(), result.perpetrator_metric.as_str());
        let consequence = (result.consequence_service.as_str(), result.consequence_metric.as_str());
        let (key, slot) = if perpetrator <= consequence {
            ((perpetrator, consequence), 0)
        } else {
            ((consequence, perpetrator), 1)
        };
        let entry = pairs.entry(key).or_default();
        entry[slot].get_or_insert(result);
    }
    pairs
        .into_values()
        .filter_map(|[forward, backward]| Some((forward?, backward?)))
        .collect()
}

/// Write edges as a JSON list with sorted keys.
pub fn write_json(path: &Path, edges: &[DependencyEdge]) -> Result<()> {
    let bytes = to_pretty_json(&edges).map_err(|source| Error::Json {
        path: path.to_path_buf(),
        source,
    })?;
    write_atomically(path, |file| file.write_all(&bytes))
}

pub fn read_json(path: &Path) -> Result<Vec<DependencyEdge>> {
    let bytes = std::fs::read(path).map_err(|e| Error::io(path, e))?;
    serde_json::from_slice(&bytes).map_err(|source| Error::Json {
        path: path.to_path_buf(),
        source,
    })
}

/// Render edges as a Graphviz digraph between services.
pub fn to_dot(edges: &[DependencyEdge]) -> String {
    let mut dot = String::from("digraph dependencies {\n  overlap = false\n  splines = true\n");
    for edge in edges {
        // Writing to a String cannot fail.
        let _ = writeln!(
            dot,
            "  \"{}\" -> \"{}\" [tooltip=\"{}-{} -> {}-{} ({:.6})\",penwidth={:.3},color={}]",
            edge.perpetrator_service,
            edge.consequence_service,
            edge.perpetrator_service,
            edge.perpetrator_metric,
            edge.consequence_service,
            edge.consequence_metric,
            edge.confidence,
            edge.confidence,
            if edge.selected { "black" } else { "gray" },
        );
    }
    dot.push_str("}\n");
    dot
}

/// Spread of one edge's quotient slope across runs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EdgeVariability {
    pub perpetrator_service: String,
    pub perpetrator_metric: String,
    pub consequence_service: String,
    pub consequence_metric: String,
    pub count: usize,
    pub mean: f64,
    /// Sample standard deviation; NaN with fewer than two runs.
    pub std: f64,
    /// `std / |mean|`.
    pub relative_std: f64,
    /// Slope of each run containing the edge divided by the reference slope.
    pub ratios: Vec<f64>,
}

/// Compare every edge of `reference` with the same edge in `runs`.
pub fn variability(
    reference: &[DependencyEdge],
    runs: &[Vec<DependencyEdge>],
) -> Vec<EdgeVariability> {
    reference
        .iter()
        .map(|edge| {
            let slopes: Vec<f64> = runs
                .iter()
                .filter_map(|run| run.iter().find(|e| e.key() == edge.key()))
                .map(|e| e.quotient_slope)
                .collect();
            let mean = stats::mean(&slopes);
            let std = stats::variance(&slopes, 1).sqrt();
            EdgeVariability {
                perpetrator_service: edge.perpetrator_service.clone(),
                perpetrator_metric: edge.perpetrator_metric.clone(),
                consequence_service: edge.consequence_service.clone(),
                consequence_metric: edge.consequence_metric.clone(),
                count: slopes.len(),
                mean,
                std,
                relative_std: std / mean.abs(),
                ratios: slopes.iter().map(|s| s / edge.quotient_slope).collect(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::LinearFit;

    fn row(from: (&str, &str), to: (&str, &str), p: f64, slope: f64) -> CausalityResult {
        CausalityResult {
            perpetrator_service: from.0.into(),
            perpetrator_metric: from.1.into(),
            consequence_service: to.0.into(),
            consequence_metric: to.1.into(),
            p_values: vec![p, 0.5],
            quotient: LinearFit {
                slope,
                ..LinearFit::UNDEFINED
            },
            perpetrator_trend: LinearFit::UNDEFINED,
            consequence_trend: LinearFit::UNDEFINED,
            selected: true,
        }
    }

    const WEB: (&str, &str) = ("web", "load");
    const DB: (&str, &str) = ("db", "queries");

    #[test]
    fn test_single_significant_direction_becomes_edge() {
        let results = vec![row(WEB, DB, 0.01, 2.0), row(DB, WEB, 0.4, 0.1)];
        let edges = GraphBuilder::default().edges(&results, 0.05);
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].perpetrator_service, "web");
        assert_eq!(edges[0].consequence_metric, "queries");
        assert!((edges[0].confidence - 0.99).abs() < 1e-12);
        assert_eq!(edges[0].quotient_slope, 2.0);
    }

    #[test]
    fn test_tie_break_excludes_both_and_neither() {
        let both = vec![row(WEB, DB, 0.01, 1.0), row(DB, WEB, 0.02, 1.0)];
        let neither = vec![row(WEB, DB, 0.3, 1.0), row(DB, WEB, 0.4, 1.0)];
        let builder = GraphBuilder::default();
        assert!(builder.edges(&both, 0.05).is_empty());
        assert!(builder.edges(&neither, 0.05).is_empty());
    }

    #[test]
    fn test_thresholds_are_independent() {
        let results = vec![row(WEB, DB, 0.03, 1.0), row(DB, WEB, 0.5, 1.0)];
        let graphs = GraphBuilder::default().build(&results);
        let counts: Vec<usize> = graphs.iter().map(|g| g.edges.len()).collect();
        assert_eq!(counts, vec![0, 1, 1]);
    }

    #[test]
    fn test_duplicates_keep_first_and_need_both_directions() {
        let results = vec![
            row(DB, WEB, 0.01, 3.0),
            row(WEB, DB, 0.5, 1.0),
            row(DB, WEB, 0.9, 7.0),
            row(("web", "cpu"), DB, 0.001, 1.0),
        ];
        let edges = GraphBuilder::default().edges(&results, 0.05);
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].perpetrator_service, "db");
        assert_eq!(edges[0].quotient_slope, 3.0);
    }

    #[test]
    fn test_json_and_dot_exports() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.json");
        let rows = [row(WEB, DB, 0.01, 2.0), row(DB, WEB, 0.4, 0.1)];
        let edges = GraphBuilder::default().edges(&rows, 0.05);
        write_json(&path, &edges).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let confidence = text.find("\"confidence\"").unwrap();
        assert!(confidence < text.find("\"consequence_metric\"").unwrap());
        assert_eq!(read_json(&path).unwrap(), edges);

        let dot = to_dot(&edges);
        assert!(dot.starts_with("digraph"));
        assert!(dot.contains("\"web\" -> \"db\""));
    }

    #[test]
    fn test_variability_across_runs() {
        let edge = |slope: f64| {
            let rows = [row(WEB, DB, 0.01, slope), row(DB, WEB, 0.4, 0.1)];
            GraphBuilder::default().edges(&rows, 0.05)
        };
        let reference = edge(2.0);
        let runs = vec![edge(2.0), edge(4.0), Vec::new()];
        let report = variability(&reference, &runs);
        assert_eq!(report.len(), 1);
        assert_eq!(report[0].count, 2);
        assert_eq!(report[0].mean, 3.0);
        assert!((report[0].std - 2f64.sqrt()).abs() < 1e-12);
        assert_eq!(report[0].ratios, vec![1.0, 2.0]);
    }
}
