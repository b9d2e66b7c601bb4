// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Summaries over finished measurements: how far the metric set shrank, and
//! how stable cluster assignments are between repeated runs.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::Result;
use crate::representative::{natural_cmp, CENTROID_COLUMN};
use crate::stats::ln_gamma;
use crate::store::{MeasurementStore, Service};
use crate::table::TimeTable;

/// Metric counts of one service at each reduction step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReductionRow {
    pub measurement: String,
    pub service: String,
    pub fields: usize,
    pub preprocessed: usize,
    pub best_k: Option<usize>,
    pub representatives: usize,
}

pub fn reduction(store: &MeasurementStore) -> Result<Vec<ReductionRow>> {
    let measurement = store.load()?;
    Ok(measurement
        .services
        .iter()
        .map(|service| ReductionRow {
            measurement: measurement.name.clone(),
            service: service.name.clone(),
            fields: service.fields.len(),
            preprocessed: service.preprocessed_fields.len(),
            best_k: service.best_k(),
            representatives: service.representatives().map_or(0, <[String]>::len),
        })
        .collect())
}

/// Agreement of one service's selected partitions in two measurements.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsistencyRow {
    pub service: String,
    pub measurement_a: String,
    pub measurement_b: String,
    pub shared_metrics: usize,
    /// Adjusted mutual information of the two assignments.
    pub ami: f64,
}

/// Compare the best-k assignments of every service across every pair of
/// measurements, on the metrics both measurements clustered.
pub fn consistency(stores: &[MeasurementStore]) -> Result<Vec<ConsistencyRow>> {
    let mut assignments = Vec::with_capacity(stores.len());
    for store in stores {
        let measurement = store.load()?;
        let mut services = BTreeMap::new();
        for service in &measurement.services {
            if let Some(assignment) = assignment(store, service)? {
                services.insert(service.name.clone(), assignment);
            }
        }
        assignments.push((measurement.name, services));
    }

    let mut rows = Vec::new();
    for (i, (name_a, services_a)) in assignments.iter().enumerate() {
        for (name_b, services_b) in &assignments[i + 1..] {
            for (service, a) in services_a {
                let Some(b) = services_b.get(service) else { continue };
                let (labels_a, labels_b): (Vec<usize>, Vec<usize>) = a
                    .iter()
                    .filter_map(|(metric, la)| b.get(metric).map(|lb| (*la, *lb)))
                    .unzip();
                if labels_a.is_empty() {
                    continue;
                }
                rows.push(ConsistencyRow {
                    service: service.clone(),
                    measurement_a: name_a.clone(),
                    measurement_b: name_b.clone(),
                    shared_metrics: labels_a.len(),
                    ami: adjusted_mutual_info(&labels_a, &labels_b),
                });
            }
        }
    }
    Ok(rows)
}

/// Metric to cluster index of the service's best partition, read back from
/// the cluster artifacts.
fn assignment(
    store: &MeasurementStore,
    service: &Service,
) -> Result<Option<BTreeMap<String, usize>>> {
    let Some(record) = service.best_k().and_then(|k| service.clusters.get(&k)) else {
        return Ok(None);
    };
    let mut filenames: Vec<&str> = record.filenames.iter().map(String::as_str).collect();
    filenames.sort_by(|a, b| natural_cmp(a, b));

    let mut assignment = BTreeMap::new();
    for (cluster, name) in filenames.into_iter().enumerate() {
        let table = TimeTable::read(&store.artifact(name))?;
        for metric in table.column_names() {
            if metric != CENTROID_COLUMN {
                assignment.insert(metric, cluster);
            }
        }
    }
    Ok(Some(assignment))
}

/// Adjusted mutual information with arithmetic-mean normalization.
pub fn adjusted_mutual_info(a: &[usize], b: &[usize]) -> f64 {
    let n = a.len().min(b.len());
    let mut contingency: BTreeMap<(usize, usize), usize> = BTreeMap::new();
    let mut rows: BTreeMap<usize, usize> = BTreeMap::new();
    let mut cols: BTreeMap<usize, usize> = BTreeMap::new();
    for (x, y) in a.iter().zip(b) {
        *contingency.entry((*x, *y)).or_default() += 1;
        *rows.entry(*x).or_default() += 1;
        *cols.entry(*y).or_default() += 1;
    }
    // Two trivial labelings agree perfectly.
    if (rows.len() == 1 && cols.len() == 1) || n == 0 {
        return 1.0;
    }

    let total = n as f64;
    let mi: f64 = contingency
        .iter()
        .map(|(&(x, y), &nij)| {
            let nij = nij as f64;
            nij / total * (total * nij / (rows[&x] as f64 * cols[&y] as f64)).ln()
        })
        .sum();
    let entropy = |counts: &BTreeMap<usize, usize>| -> f64 {
        -counts
            .values()
            .map(|&c| {
                let p = c as f64 / total;
                p * p.ln()
            })
            .sum::<f64>()
    };
    let emi = expected_mutual_info(rows.values().copied(), cols.values().copied(), n);
    let normalizer = (entropy(&rows) + entropy(&cols)) / 2.0;

    let mut denominator = normalizer - emi;
    if denominator < 0.0 {
        denominator = denominator.min(-f64::EPSILON);
    } else {
        denominator = denominator.max(f64::EPSILON);
    }
    (mi - emi) / denominator
}

/// Expected mutual information of two random labelings with the given
/// cluster sizes (hypergeometric model).
fn expected_mutual_info(
    rows: impl Iterator<Item = usize>,
    cols: impl Iterator<Item = usize> + Clone,
    n: usize,
) -> f64 {
    let total = n as f64;
    let lg = |x: usize| ln_gamma(x as f64 + 1.0);
    let mut emi = 0.0;
    for ai in rows {
        for bj in cols.clone() {
            let start = (ai + bj).saturating_sub(n).max(1);
            for nij in start..=ai.min(bj) {
                let term = nij as f64 / total * (total * nij as f64 / (ai as f64 * bj as f64)).ln();
                let log_prob = lg(ai) + lg(bj) + lg(n - ai) + lg(n - bj)
                    - lg(n)
                    - lg(nij)
                    - lg(ai - nij)
                    - lg(bj - nij)
                    - lg(n + nij - ai - bj);
                emi += term * log_prob.exp();
            }
        }
    }
    emi
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::representative::cluster_artifact;
    use crate::store::{ClusterRecord, Measurement};
    use crate::table::Column;

    #[test]
    fn test_ami_identical_and_permuted() {
        let a = [0, 0, 1, 1, 2, 2];
        let permuted = [2, 2, 0, 0, 1, 1];
        assert!((adjusted_mutual_info(&a, &a) - 1.0).abs() < 1e-9);
        assert!((adjusted_mutual_info(&a, &permuted) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_ami_independent_labels_near_zero() {
        let a = [0, 0, 1, 1];
        let b = [0, 1, 0, 1];
        assert!(adjusted_mutual_info(&a, &b) < 1e-9);
        assert_eq!(adjusted_mutual_info(&[0, 0], &[3, 3]), 1.0);
    }

    fn measurement_with_clusters(
        dir: &std::path::Path,
        name: &str,
        groups: &[&[&str]],
    ) -> MeasurementStore {
        std::fs::create_dir_all(dir).unwrap();
        let mut filenames = Vec::new();
        for (i, group) in groups.iter().enumerate() {
            let file = cluster_artifact("web", groups.len(), i + 1);
            let mut columns: Vec<Column> =
                group.iter().map(|m| Column::dense(*m, &[0.0, 1.0])).collect();
            columns.push(Column::dense(CENTROID_COLUMN, &[0.0, 1.0]));
            TimeTable::new(vec![0, 500], columns).unwrap().write(&dir.join(&file)).unwrap();
            filenames.push(file);
        }
        let fields: Vec<String> =
            groups.iter().flat_map(|g| g.iter().map(|m| m.to_string())).collect();
        let measurement = Measurement {
            name: name.into(),
            services: vec![Service {
                name: "web".into(),
                fields: fields.clone(),
                filename: "web.tsv".into(),
                preprocessed_fields: fields,
                clusters: [(
                    groups.len(),
                    ClusterRecord {
                        silhouette_score: Some(0.6),
                        filenames,
                        granger_metrics: Some(
                            groups.iter().map(|g| g[0].to_string()).collect(),
                        ),
                    },
                )]
                .into(),
                ..Default::default()
            }],
            ..Default::default()
        };
        MeasurementStore::create(dir, &measurement).unwrap()
    }

    #[test]
    fn test_consistency_between_measurements() {
        let root = tempfile::tempdir().unwrap();
        let a = measurement_with_clusters(
            &root.path().join("a"),
            "a",
            &[&["cpu", "mem"], &["rx", "tx"]],
        );
        let b = measurement_with_clusters(
            &root.path().join("b"),
            "b",
            &[&["rx", "tx"], &["cpu", "mem", "disk"]],
        );
        let rows = consistency(&[a, b]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].shared_metrics, 4);
        assert!((rows[0].ami - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_reduction_counts() {
        let root = tempfile::tempdir().unwrap();
        let store = measurement_with_clusters(root.path(), "a", &[&["cpu", "mem"], &["rx"]]);
        let rows = reduction(&store).unwrap();
        assert_eq!(
            rows,
            vec![ReductionRow {
                measurement: "a".into(),
                service: "web".into(),
                fields: 3,
                preprocessed: 3,
                best_k: Some(2),
                representatives: 2,
            }]
        );
    }
}
