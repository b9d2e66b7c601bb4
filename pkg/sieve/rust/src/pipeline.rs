// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Stage orchestration over one measurement directory.
//!
//! Every stage splits its work into independent units (a service, or a pair
//! of services) and runs them on the rayon pool. Units skip work whose output
//! already exists, so a stage can be rerun after a partial failure. A failing
//! unit is logged and skipped; only unreadable metadata stops a stage.

use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::callgraph::CallGraph;
use crate::causality::{self, CausalityAnalyzer, CausalityResult, MetricSelection, ServiceSeries};
use crate::config::SieveConfig;
use crate::error::Result;
use crate::graph::{DependencyGraph, GraphBuilder};
use crate::preprocess::Preprocessor;
use crate::representative::{self, cluster_artifact, CENTROID_COLUMN};
use crate::selection::{ModelSelector, Partition};
use crate::shape::{KShape, ShapeClusterer};
use crate::stats;
use crate::store::{ClusterRecord, Measurement, MeasurementStore, Service};
use crate::table::{Column, TimeTable};

/// Outcome counts of one stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageSummary {
    pub completed: usize,
    pub skipped: usize,
    pub failed: usize,
}

enum Unit {
    Completed,
    Skipped,
}

impl StageSummary {
    fn collect(stage: &'static str, outcomes: Vec<Result<Unit>>) -> Self {
        let mut summary = Self::default();
        for outcome in outcomes {
            match outcome {
                Ok(Unit::Completed) => summary.completed += 1,
                Ok(Unit::Skipped) => summary.skipped += 1,
                Err(_) => summary.failed += 1,
            }
        }
        info!(
            stage,
            completed = summary.completed,
            skipped = summary.skipped,
            failed = summary.failed,
            "stage finished"
        );
        summary
    }
}

/// File name of a service's preprocessed table.
pub fn preprocessed_artifact(service: &str) -> String {
    format!("{service}-preprocessed.tsv.gz")
}

pub struct Pipeline<C = KShape> {
    config: SieveConfig,
    preprocessor: Preprocessor,
    selector: ModelSelector<C>,
    analyzer: CausalityAnalyzer,
}

impl Pipeline<KShape> {
    pub fn new(config: SieveConfig) -> Self {
        let clusterer = KShape::with_config(config.clustering.kshape.clone());
        Self::with_clusterer(config, clusterer)
    }
}

impl<C: ShapeClusterer> Pipeline<C> {
    pub fn with_clusterer(config: SieveConfig, clusterer: C) -> Self {
        Self {
            preprocessor: Preprocessor::with_config(
                config.sampling.clone(),
                config.classifier.clone(),
            ),
            selector: ModelSelector::new(clusterer, config.clustering.selection.clone()),
            analyzer: CausalityAnalyzer::with_config(
                config.causality.clone(),
                config.sampling.clone(),
            ),
            config,
        }
    }

    pub fn config(&self) -> &SieveConfig {
        &self.config
    }

    /// Preprocess, cluster, pick representatives and test causality.
    pub fn run(
        &self,
        store: &MeasurementStore,
        callgraph: Option<&CallGraph>,
    ) -> Result<[StageSummary; 4]> {
        Ok([
            self.preprocess(store)?,
            self.cluster(store)?,
            self.representatives(store)?,
            self.causality(store, callgraph)?,
        ])
    }

    /// Classify and clean every service's raw table.
    pub fn preprocess(&self, store: &MeasurementStore) -> Result<StageSummary> {
        let measurement = store.load()?;
        let outcomes = measurement
            .services
            .par_iter()
            .map(|service| {
                self.preprocess_service(store, service).inspect_err(|e| {
                    warn!(
                        service = %service.name,
                        error = %e,
                        "preprocessing failed, skipping service"
                    );
                })
            })
            .collect();
        Ok(StageSummary::collect("preprocess", outcomes))
    }

    fn preprocess_service(&self, store: &MeasurementStore, service: &Service) -> Result<Unit> {
        let name = preprocessed_artifact(&service.name);
        let path = store.artifact(&name);
        if path.exists() && service.classification.is_some() {
            debug!(service = %service.name, path = %path.display(), "already preprocessed");
            return Ok(Unit::Skipped);
        }

        let raw = TimeTable::read(&store.artifact(&service.filename))?;
        let preprocessed = self.preprocessor.preprocess(&raw, &service.fields)?;
        preprocessed.table.write(&path)?;
        let fields = preprocessed.fields();
        if fields.is_empty() {
            info!(service = %service.name, "no eligible metrics, service will not be clustered");
        }
        store.update(|m| {
            let entry = m.service_mut(&service.name)?;
            entry.preprocessed_filename = Some(name.clone());
            entry.preprocessed_fields = fields;
            entry.classification = Some(preprocessed.classification);
            Ok(())
        })?;
        info!(service = %service.name, path = %path.display(), "preprocessed");
        Ok(Unit::Completed)
    }

    /// Run model selection for every preprocessed service.
    pub fn cluster(&self, store: &MeasurementStore) -> Result<StageSummary> {
        let measurement = store.load()?;
        let outcomes = measurement
            .services
            .par_iter()
            .map(|service| {
                self.cluster_service(store, service).inspect_err(|e| {
                    warn!(
                        service = %service.name,
                        error = %e,
                        "clustering failed, skipping service"
                    );
                })
            })
            .collect();
        Ok(StageSummary::collect("cluster", outcomes))
    }

    fn cluster_service(&self, store: &MeasurementStore, service: &Service) -> Result<Unit> {
        let Some(table) = read_preprocessed(store, service)? else {
            debug!(service = %service.name, "nothing to cluster");
            return Ok(Unit::Skipped);
        };
        let series: Vec<Vec<f64>> = table
            .columns()
            .iter()
            .map(|c| Ok(stats::zscore(&c.present()?, 0)))
            .collect::<Result<_>>()?;

        let selection = self.selector.select(&series, &service.scores());
        if selection.partitions.is_empty() {
            debug!(service = %service.name, "every k already clustered");
        }
        let mut records = Vec::with_capacity(selection.partitions.len());
        for partition in &selection.partitions {
            let filenames = write_partition(store, &service.name, &table, &series, partition)?;
            records.push((
                partition.k,
                ClusterRecord {
                    silhouette_score: partition.score,
                    filenames,
                    granger_metrics: None,
                },
            ));
        }
        if !records.is_empty() {
            store.update(|m| {
                let entry = m.service_mut(&service.name)?;
                for (k, record) in records {
                    entry.clusters.entry(k).or_insert(record);
                }
                Ok(())
            })?;
        }

        match selection.best_k {
            Some(k) => info!(service = %service.name, best_k = k, "model selected"),
            None => warn!(
                service = %service.name,
                "no partition has a defined silhouette score, service is excluded from causality"
            ),
        }
        Ok(if selection.partitions.is_empty() {
            Unit::Skipped
        } else {
            Unit::Completed
        })
    }

    /// Record the representatives of every service's best partition.
    pub fn representatives(&self, store: &MeasurementStore) -> Result<StageSummary> {
        let measurement = store.load()?;
        let outcomes = measurement
            .services
            .par_iter()
            .map(|service| {
                representatives_of(store, service).inspect_err(|e| {
                    warn!(service = %service.name, error = %e, "representative selection failed");
                })
            })
            .collect();
        Ok(StageSummary::collect("representatives", outcomes))
    }

    /// Test every call-graph edge whose services are ready; without a call
    /// graph every service pair is tested.
    pub fn causality(
        &self,
        store: &MeasurementStore,
        callgraph: Option<&CallGraph>,
    ) -> Result<StageSummary> {
        let measurement = store.load()?;
        let complete;
        let graph = match callgraph {
            Some(graph) => graph,
            None => {
                let names: Vec<&str> =
                    measurement.services.iter().map(|s| s.name.as_str()).collect();
                complete = CallGraph::complete(&names);
                &complete
            }
        };
        let edges: Vec<(&str, &str)> = graph.edges().collect();
        let outcomes = edges
            .par_iter()
            .map(|&(a, b)| {
                self.causality_pair(store, &measurement, a, b).inspect_err(|e| {
                    warn!(a, b, error = %e, "causality failed, skipping service pair");
                })
            })
            .collect();
        Ok(StageSummary::collect("causality", outcomes))
    }

    fn causality_pair(
        &self,
        store: &MeasurementStore,
        measurement: &Measurement,
        a: &str,
        b: &str,
    ) -> Result<Unit> {
        let name = causality::causality_artifact(a, b, &self.config.causality.artifact_tag);
        let path = store.artifact(&name);
        if path.exists() {
            debug!(path = %path.display(), "causality already computed");
            if !measurement.causality_files.contains(&name) {
                store.update(|m| {
                    m.causality_files.insert(name.clone());
                    Ok(())
                })?;
            }
            return Ok(Unit::Skipped);
        }

        let (Some(left), Some(right)) = (
            self.service_series(store, measurement.service(a)?)?,
            self.service_series(store, measurement.service(b)?)?,
        ) else {
            return Ok(Unit::Skipped);
        };
        let results = self.analyzer.compare(&left, &right)?;
        causality::write_results(&path, &results, self.config.causality.max_lag)?;
        store.update(|m| {
            m.causality_files.insert(name.clone());
            Ok(())
        })?;
        info!(a, b, rows = results.len(), path = %path.display(), "causality written");
        Ok(Unit::Completed)
    }

    /// The metrics of `service` that enter causality testing, or `None` when
    /// the service is not ready.
    fn service_series(
        &self,
        store: &MeasurementStore,
        service: &Service,
    ) -> Result<Option<ServiceSeries>> {
        // Cluster order, each metric once.
        let mut ordered: Vec<String> = Vec::new();
        for metric in service.representatives().unwrap_or_default() {
            if !ordered.contains(metric) {
                ordered.push(metric.clone());
            }
        }
        let metrics = match self.config.causality.metrics {
            MetricSelection::Representatives if ordered.is_empty() => {
                warn!(service = %service.name, "no representatives selected, skipping");
                return Ok(None);
            }
            MetricSelection::Representatives => ordered.clone(),
            MetricSelection::All => service.preprocessed_fields.clone(),
        };
        let Some(table) = read_preprocessed(store, service)? else {
            debug!(service = %service.name, "no preprocessed metrics, skipping");
            return Ok(None);
        };
        Ok(Some(ServiceSeries {
            service: service.name.clone(),
            table: table.select(&metrics)?,
            representatives: ordered.into_iter().collect(),
        }))
    }

    /// Dependency graphs over every causality artifact of the measurement.
    pub fn graph(&self, store: &MeasurementStore) -> Result<Vec<DependencyGraph>> {
        let results = causality_results(store)?;
        Ok(GraphBuilder::with_config(self.config.graph.clone()).build(&results))
    }
}

/// Rows of every causality artifact recorded for the measurement. An artifact
/// that cannot be read is logged and left out.
pub fn causality_results(store: &MeasurementStore) -> Result<Vec<CausalityResult>> {
    let measurement = store.load()?;
    let mut results = Vec::new();
    for name in &measurement.causality_files {
        let path = store.artifact(name);
        match causality::read_results(&path) {
            Ok(rows) => results.extend(rows),
            Err(e) => warn!(
                path = %path.display(),
                error = %e,
                "unreadable causality artifact, skipping"
            ),
        }
    }
    debug!(rows = results.len(), "causality rows loaded");
    Ok(results)
}

fn read_preprocessed(store: &MeasurementStore, service: &Service) -> Result<Option<TimeTable>> {
    match &service.preprocessed_filename {
        Some(name) if !service.preprocessed_fields.is_empty() => {
            Ok(Some(TimeTable::read(&store.artifact(name))?))
        }
        _ => Ok(None),
    }
}

/// Write one artifact per cluster: member z-scored series plus the centroid.
fn write_partition(
    store: &MeasurementStore,
    service: &str,
    table: &TimeTable,
    series: &[Vec<f64>],
    partition: &Partition,
) -> Result<Vec<String>> {
    let names = table.column_names();
    let mut filenames = Vec::with_capacity(partition.clusters.len());
    for (i, cluster) in partition.clusters.iter().enumerate() {
        let mut columns: Vec<Column> = cluster
            .members
            .iter()
            .map(|m| Column::dense(names[*m].clone(), &series[*m]))
            .collect();
        columns.push(Column::dense(CENTROID_COLUMN, &cluster.centroid));
        let filename = cluster_artifact(service, partition.k, i + 1);
        TimeTable::new(table.index().to_vec(), columns)?.write(&store.artifact(&filename))?;
        filenames.push(filename);
    }
    Ok(filenames)
}

fn representatives_of(store: &MeasurementStore, service: &Service) -> Result<Unit> {
    let Some(k) = service.best_k() else {
        return Ok(Unit::Skipped);
    };
    let Some(record) = service.clusters.get(&k) else {
        return Ok(Unit::Skipped);
    };
    if record.granger_metrics.is_some() {
        debug!(service = %service.name, k, "representatives already selected");
        return Ok(Unit::Skipped);
    }
    let chosen = representative::representatives(store.dir(), &record.filenames)?;
    info!(service = %service.name, k, representatives = ?chosen, "representatives selected");
    store.update(|m| {
        let record = m.service_mut(&service.name)?.clusters.entry(k).or_default();
        record.granger_metrics.get_or_insert(chosen);
        Ok(())
    })?;
    Ok(Unit::Completed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::LinearFit;

    fn write_raw(store_dir: &std::path::Path, name: &str, columns: Vec<Column>) {
        let len = columns.first().map_or(0, |c| c.values().map_or(0, <[_]>::len));
        let index = (0..len as i64).map(|t| t * 500).collect();
        TimeTable::new(index, columns)
            .unwrap()
            .write(&store_dir.join(format!("{name}.tsv")))
            .unwrap();
    }

    fn service(name: &str, fields: &[&str]) -> Service {
        Service {
            name: name.into(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
            filename: format!("{name}.tsv"),
            ..Default::default()
        }
    }

    #[test]
    fn test_stages_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let waves: Vec<Column> = (0..4)
            .map(|i| {
                let values: Vec<f64> =
                    (0..120).map(|t| (t as f64 / (3.0 + i as f64)).sin()).collect();
                Column::dense(format!("m{i}"), &values)
            })
            .collect();
        write_raw(dir.path(), "web", waves);
        let store = MeasurementStore::create(
            dir.path(),
            &Measurement {
                name: "run".into(),
                services: vec![service("web", &["m0", "m1", "m2", "m3"])],
                ..Default::default()
            },
        )
        .unwrap();

        let pipeline = Pipeline::new(SieveConfig::default());
        assert_eq!(pipeline.preprocess(&store).unwrap().completed, 1);
        assert_eq!(pipeline.preprocess(&store).unwrap().skipped, 1);
        assert_eq!(pipeline.cluster(&store).unwrap().completed, 1);
        assert_eq!(pipeline.cluster(&store).unwrap().skipped, 1);

        let web = store.load().unwrap().services.remove(0);
        assert_eq!(web.clusters.keys().copied().collect::<Vec<_>>(), vec![1, 2, 3, 4]);
        assert_eq!(web.clusters[&1].silhouette_score, None);
        assert!(web.clusters[&4].silhouette_score.is_some());
        assert_eq!(web.clusters[&3].filenames.len(), 3);
    }

    #[test]
    fn test_missing_raw_table_fails_only_that_service() {
        let dir = tempfile::tempdir().unwrap();
        let queries: Vec<f64> = (0..50).map(|t| (t % 7) as f64).collect();
        write_raw(dir.path(), "db", vec![Column::dense("q", &queries)]);
        let store = MeasurementStore::create(
            dir.path(),
            &Measurement {
                name: "run".into(),
                services: vec![service("web", &["cpu"]), service("db", &["q"])],
                ..Default::default()
            },
        )
        .unwrap();
        let summary = Pipeline::new(SieveConfig::default()).preprocess(&store).unwrap();
        assert_eq!(summary, StageSummary { completed: 1, skipped: 0, failed: 1 });
        let db = store.load().unwrap().service("db").unwrap().clone();
        assert_eq!(db.preprocessed_fields, vec!["q".to_string()]);
    }

    fn result_row(from: (&str, &str), to: (&str, &str), p: f64) -> CausalityResult {
        CausalityResult {
            perpetrator_service: from.0.into(),
            perpetrator_metric: from.1.into(),
            consequence_service: to.0.into(),
            consequence_metric: to.1.into(),
            p_values: vec![p, 0.5],
            quotient: LinearFit::UNDEFINED,
            perpetrator_trend: LinearFit::UNDEFINED,
            consequence_trend: LinearFit::UNDEFINED,
            selected: true,
        }
    }

    #[test]
    fn test_truncated_causality_artifact_does_not_block_graph() {
        let dir = tempfile::tempdir().unwrap();
        let store = MeasurementStore::create(
            dir.path(),
            &Measurement {
                name: "run".into(),
                services: vec![service("web", &[]), service("db", &[]), service("cache", &[])],
                ..Default::default()
            },
        )
        .unwrap();
        let config = SieveConfig::default();
        let tag = &config.causality.artifact_tag;
        let (web, db, cache) = (("web", "load"), ("db", "queries"), ("cache", "hits"));

        let healthy = causality::causality_artifact("cache", "web", tag);
        let rows = [result_row(web, cache, 0.001), result_row(cache, web, 0.6)];
        causality::write_results(&store.artifact(&healthy), &rows, 2).unwrap();

        let broken = causality::causality_artifact("db", "web", tag);
        let rows = [result_row(web, db, 0.001), result_row(db, web, 0.6)];
        causality::write_results(&store.artifact(&broken), &rows, 2).unwrap();
        let bytes = std::fs::read(store.artifact(&broken)).unwrap();
        std::fs::write(store.artifact(&broken), &bytes[..bytes.len() / 2]).unwrap();
        assert!(causality::read_results(&store.artifact(&broken)).is_err());

        store
            .update(|m| {
                m.causality_files.extend([healthy.clone(), broken.clone()]);
                Ok(())
            })
            .unwrap();

        let graphs = Pipeline::new(config).graph(&store).unwrap();
        assert_eq!(graphs[0].significance, 0.01);
        let endpoints: Vec<(&str, &str)> = graphs[0]
            .edges
            .iter()
            .map(|e| (e.perpetrator_service.as_str(), e.consequence_service.as_str()))
            .collect();
        assert_eq!(endpoints, vec![("web", "cache")]);
    }

    #[test]
    fn test_failed_artifact_write_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("web-db-causality-callgraph.tsv.gz");
        assert!(causality::write_results(&path, &[], 2).is_err());
        assert!(!path.exists());

        let path = dir.path().join("web-db-causality-callgraph.tsv.gz");
        causality::write_results(&path, &[], 2).unwrap();
        let leftovers: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[test]
    fn test_representatives_keep_cluster_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = MeasurementStore::create(
            dir.path(),
            &Measurement {
                name: "run".into(),
                ..Default::default()
            },
        )
        .unwrap();
        let values: Vec<f64> = (0..30).map(|t| (t as f64).sin()).collect();
        let index = (0..30).map(|t| t * 500).collect();
        let columns = ["alpha", "mid", "zeta"].map(|name| Column::dense(name, &values));
        let name = preprocessed_artifact("web");
        TimeTable::new(index, Vec::from(columns))
            .unwrap()
            .write(&store.artifact(&name))
            .unwrap();

        let mut web = service("web", &["alpha", "mid", "zeta"]);
        web.preprocessed_filename = Some(name);
        web.preprocessed_fields = vec!["alpha".into(), "mid".into(), "zeta".into()];
        web.clusters.insert(
            2,
            ClusterRecord {
                silhouette_score: Some(0.4),
                filenames: Vec::new(),
                granger_metrics: Some(vec!["zeta".into(), "alpha".into(), "zeta".into()]),
            },
        );

        let series = Pipeline::new(SieveConfig::default())
            .service_series(&store, &web)
            .unwrap()
            .unwrap();
        assert_eq!(series.table.column_names(), vec!["zeta".to_string(), "alpha".to_string()]);
        assert!(series.representatives.contains("alpha"));
        assert!(!series.representatives.contains("mid"));
    }
}
