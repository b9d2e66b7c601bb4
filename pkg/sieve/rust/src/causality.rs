// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Pairwise Granger causality between the metrics of two services.
//!
//! Both services' tables are merged onto one time grid. For every ordered
//! metric pair across the two services the analyzer runs a Granger ssr
//! F-test at lags `1..=max_lag`, a regression of the consequence on the
//! perpetrator (the slope is the "quotient") and a trend regression of each
//! series against time.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::preprocess::{fill_gaps, resample, SamplingConfig};
use crate::stats::{self, LinearFit, NumericError};
use crate::store::write_atomically;
use crate::table::{Column, TimeTable};

/// Variance below which a failed test is attributed to a flat series.
const LOW_VARIANCE: f64 = 1e-30;

/// Which metrics of a service enter the pairwise tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricSelection {
    /// The representatives of the best partition.
    #[default]
    Representatives,
    /// Every preprocessed metric.
    All,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CausalityConfig {
    pub max_lag: usize,
    pub metrics: MetricSelection,
    /// Tag in causality artifact names.
    pub artifact_tag: String,
}

impl Default for CausalityConfig {
    fn default() -> Self {
        Self {
            max_lag: 5,
            metrics: MetricSelection::Representatives,
            artifact_tag: "callgraph".to_string(),
        }
    }
}

/// File name of the causality artifact for services `a` and `b`.
pub fn causality_artifact(a: &str, b: &str, tag: &str) -> String {
    format!("{a}-{b}-causality-{tag}.tsv.gz")
}

/// The metrics of one service that take part in a comparison.
#[derive(Debug, Clone)]
pub struct ServiceSeries {
    pub service: String,
    pub table: TimeTable,
    /// Metrics that are representatives of their service.
    pub representatives: BTreeSet<String>,
}

/// Outcome of testing one ordered metric pair.
#[derive(Debug, Clone, PartialEq)]
pub struct CausalityResult {
    pub perpetrator_service: String,
    pub perpetrator_metric: String,
    pub consequence_service: String,
    pub consequence_metric: String,
    /// Granger p-value for lags `1..=max_lag`.
    pub p_values: Vec<f64>,
    /// Consequence regressed on perpetrator.
    pub quotient: LinearFit,
    pub perpetrator_trend: LinearFit,
    pub consequence_trend: LinearFit,
    /// Both metrics are representatives of their service.
    pub selected: bool,
}

impl CausalityResult {
    pub fn perpetrator(&self) -> String {
        format!("{}-{}", self.perpetrator_service, self.perpetrator_metric)
    }

    pub fn consequence(&self) -> String {
        format!("{}-{}", self.consequence_service, self.consequence_metric)
    }

    /// p-value at `lag` (1-based), if tested.
    pub fn p_value(&self, lag: usize) -> Option<f64> {
        lag.checked_sub(1).and_then(|i| self.p_values.get(i)).copied()
    }
}

#[derive(Debug, Clone, Default)]
pub struct CausalityAnalyzer {
    config: CausalityConfig,
    sampling: SamplingConfig,
}

impl CausalityAnalyzer {
    pub fn with_config(config: CausalityConfig, sampling: SamplingConfig) -> Self {
        Self { config, sampling }
    }

    pub fn config(&self) -> &CausalityConfig {
        &self.config
    }

    /// Test every ordered metric pair between `a` and `b`, in both directions.
    ///
    /// Rows come out per pair `(x in a, y in b)` as `x -> y` then `y -> x`.
    /// Pairs whose tests cannot be computed are logged and left out.
    pub fn compare(&self, a: &ServiceSeries, b: &ServiceSeries) -> Result<Vec<CausalityResult>> {
        let (raw, normalized) = align(&a.table, &b.table, &self.sampling)?;
        let width = a.table.columns().len();
        let elapsed: Vec<f64> = raw
            .index()
            .iter()
            .map(|t| (t - raw.index().first().copied().unwrap_or(0)) as f64 / 1000.0)
            .collect();

        let mut pairs = Vec::new();
        for i in 0..width {
            for j in 0..b.table.columns().len() {
                pairs.push((i, width + j));
                pairs.push((width + j, i));
            }
        }

        let side = |column: usize| if column < width { a } else { b };
        let results = pairs
            .par_iter()
            .filter_map(|&(perpetrator, consequence)| {
                let (ps, cs) = (side(perpetrator), side(consequence));
                let p_metric = metric_name(&raw.columns()[perpetrator].name);
                let c_metric = metric_name(&raw.columns()[consequence].name);
                let p_raw = raw.columns()[perpetrator].present().ok()?;
                let c_raw = raw.columns()[consequence].present().ok()?;

                let p_values = match granger_p_values(
                    &normalized[consequence],
                    &normalized[perpetrator],
                    self.config.max_lag,
                ) {
                    Ok(p_values) => p_values,
                    Err(e) => {
                        let low_variance = stats::variance(&p_raw, 1) < LOW_VARIANCE
                            || stats::variance(&c_raw, 1) < LOW_VARIANCE;
                        tracing::warn!(
                            perpetrator = %format!("{}-{p_metric}", ps.service),
                            consequence = %format!("{}-{c_metric}", cs.service),
                            low_variance,
                            error = %e,
                            "granger test failed, skipping pair"
                        );
                        return None;
                    }
                };
                Some(CausalityResult {
                    selected: ps.representatives.contains(&p_metric)
                        && cs.representatives.contains(&c_metric),
                    perpetrator_service: ps.service.clone(),
                    perpetrator_metric: p_metric,
                    consequence_service: cs.service.clone(),
                    consequence_metric: c_metric,
                    p_values,
                    quotient: fit_or_undefined(&p_raw, &c_raw),
                    perpetrator_trend: fit_or_undefined(&elapsed, &p_raw),
                    consequence_trend: fit_or_undefined(&elapsed, &c_raw),
                })
            })
            .collect();
        Ok(results)
    }
}

fn fit_or_undefined(x: &[f64], y: &[f64]) -> LinearFit {
    stats::linregress(x, y).unwrap_or(LinearFit::UNDEFINED)
}

/// Aligned column names carry their side so equal metric names of the two
/// services do not collide.
fn metric_name(aligned: &str) -> String {
    aligned.split_once(':').map_or(aligned, |(_, m)| m).to_string()
}

/// Merge the rows of `a` and `b` onto one gap-free grid.
///
/// Returns the merged table (columns of `a` first, named `a:<metric>` and
/// `b:<metric>`) and the z-scored columns in the same order.
pub fn align(
    a: &TimeTable,
    b: &TimeTable,
    sampling: &SamplingConfig,
) -> Result<(TimeTable, Vec<Vec<f64>>)> {
    let mut rows: Vec<(i64, usize, usize)> = a
        .index()
        .iter()
        .enumerate()
        .map(|(row, t)| (*t, 0, row))
        .chain(b.index().iter().enumerate().map(|(row, t)| (*t, 1, row)))
        .collect();
    rows.sort();
    let index: Vec<i64> = rows.iter().map(|(t, _, _)| *t).collect();

    let mut columns = Vec::with_capacity(a.columns().len() + b.columns().len());
    for (side, (prefix, table)) in [("a", a), ("b", b)].into_iter().enumerate() {
        for column in table.columns() {
            let values = column.values()?;
            let merged = rows
                .iter()
                .map(|&(_, from, row)| if from == side { values[row] } else { None })
                .collect();
            columns.push(Column::numeric(format!("{prefix}:{}", column.name), merged));
        }
    }
    let merged = resample(&TimeTable::new(index, columns)?, sampling.interval_ms)?;

    let filled: Vec<Column> = merged
        .columns()
        .iter()
        .map(|column| {
            let values = fill_gaps(column.values()?, merged.index(), sampling.interpolation_limit);
            Ok(Column::dense(column.name.clone(), &values))
        })
        .collect::<Result<_>>()?;
    let normalized = filled
        .iter()
        .map(|c| Ok(stats::zscore(&c.present()?, 0)))
        .collect::<Result<_>>()?;
    Ok((TimeTable::new(merged.index().to_vec(), filled)?, normalized))
}

/// Granger ssr F-test p-values of "`cause` helps predict `effect`" for lags
/// `1..=max_lag`.
pub fn granger_p_values(
    effect: &[f64],
    cause: &[f64],
    max_lag: usize,
) -> std::result::Result<Vec<f64>, NumericError> {
    let n = effect.len().min(cause.len());
    (1..=max_lag)
        .map(|lag| {
            let observations = n.saturating_sub(lag);
            let df = observations as i64 - 2 * lag as i64 - 1;
            if df <= 0 {
                return Err(NumericError::InsufficientObservations {
                    needed: 3 * lag + 2,
                    got: n,
                });
            }
            let y: Vec<f64> = effect[lag..n].to_vec();
            let restricted: Vec<Vec<f64>> = (lag..n)
                .map(|t| {
                    let mut row = Vec::with_capacity(lag + 1);
                    row.extend((1..=lag).map(|l| effect[t - l]));
                    row.push(1.0);
                    row
                })
                .collect();
            let unrestricted: Vec<Vec<f64>> = (lag..n)
                .map(|t| {
                    let mut row = Vec::with_capacity(2 * lag + 1);
                    row.extend((1..=lag).map(|l| effect[t - l]));
                    row.extend((1..=lag).map(|l| cause[t - l]));
                    row.push(1.0);
                    row
                })
                .collect();
            let (_, ssr_restricted) = stats::least_squares(&restricted, &y)?;
            let (_, ssr_unrestricted) = stats::least_squares(&unrestricted, &y)?;
            if ssr_unrestricted <= 0.0 {
                return Err(NumericError::Singular);
            }
            let df = df as f64;
            let f = ((ssr_restricted - ssr_unrestricted) / ssr_unrestricted) / lag as f64 * df;
            Ok(stats::f_sf(f, lag as f64, df))
        })
        .collect()
}

const FIT_FIELDS: [&str; 5] = ["slope", "intercept", "r_value", "p_value", "std_err"];

fn header(max_lag: usize) -> Vec<String> {
    let mut header: Vec<String> = [
        "perpetrator",
        "consequence",
        "perpetrator_service",
        "perpetrator_metric",
        "consequence_service",
        "consequence_metric",
    ]
    .map(String::from)
    .to_vec();
    header.extend((1..=max_lag).map(|lag| format!("p_for_lag_{lag}")));
    for prefix in ["quotient", "perpetrator_trend", "consequence_trend"] {
        header.extend(FIT_FIELDS.iter().map(|f| format!("{prefix}_{f}")));
    }
    header.push("selected".to_string());
    header
}

fn fit_cells(fit: &LinearFit) -> [f64; 5] {
    [fit.slope, fit.intercept, fit.r_value, fit.p_value, fit.std_err]
}

/// Write causality rows as a gzip-compressed TSV, replacing `path` only once
/// every row is written.
pub fn write_results(path: &Path, results: &[CausalityResult], max_lag: usize) -> Result<()> {
    write_atomically(path, |file| {
        let mut out = GzEncoder::new(BufWriter::new(file), Compression::default());
        writeln!(out, "{}", header(max_lag).join("\t"))?;
        for r in results {
            let mut cells = vec![
                r.perpetrator(),
                r.consequence(),
                r.perpetrator_service.clone(),
                r.perpetrator_metric.clone(),
                r.consequence_service.clone(),
                r.consequence_metric.clone(),
            ];
            cells.extend((1..=max_lag).map(|lag| r.p_value(lag).unwrap_or(f64::NAN).to_string()));
            for fit in [&r.quotient, &r.perpetrator_trend, &r.consequence_trend] {
                cells.extend(fit_cells(fit).iter().map(f64::to_string));
            }
            cells.push(r.selected.to_string());
            writeln!(out, "{}", cells.join("\t"))?;
        }
        out.finish()?.flush()
    })
}

/// Read causality rows written by [`write_results`]; plain TSV is accepted too.
pub fn read_results(path: &Path) -> Result<Vec<CausalityResult>> {
    let file = File::open(path).map_err(|e| Error::io(path, e))?;
    let reader: Box<dyn Read> = if path.extension().is_some_and(|ext| ext == "gz") {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };
    let mut lines = BufReader::new(reader).lines();
    let header: Vec<String> = match lines.next() {
        Some(line) => line
            .map_err(|e| Error::io(path, e))?
            .split('\t')
            .map(str::to_string)
            .collect(),
        None => return Ok(Vec::new()),
    };
    let position = |name: &str| {
        header
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| Error::malformed(path, 1, format!("missing column {name}")))
    };
    let lags: Vec<usize> = (1..)
        .map_while(|lag| position(&format!("p_for_lag_{lag}")).ok())
        .collect();
    let fit_columns = |prefix: &str| -> Result<Vec<usize>> {
        FIT_FIELDS
            .iter()
            .map(|f| position(&format!("{prefix}_{f}")))
            .collect()
    };
    let names = [
        position("perpetrator_service")?,
        position("perpetrator_metric")?,
        position("consequence_service")?,
        position("consequence_metric")?,
        position("selected")?,
    ];
    let fits = [
        fit_columns("quotient")?,
        fit_columns("perpetrator_trend")?,
        fit_columns("consequence_trend")?,
    ];

    let mut results = Vec::new();
    for (i, line) in lines.enumerate() {
        let line_no = i + 2;
        let line = line.map_err(|e| Error::io(path, e))?;
        if line.is_empty() {
            continue;
        }
        let cells: Vec<&str> = line.split('\t').collect();
        let cell = |c: usize| {
            cells
                .get(c)
                .copied()
                .ok_or_else(|| {
                    Error::malformed(path, line_no, format!("missing cell {}", header[c]))
                })
        };
        let number = |c: usize| -> Result<f64> {
            let text = cell(c)?;
            text.parse()
                .map_err(|_| Error::malformed(path, line_no, format!("bad number {text:?}")))
        };
        let fit = |columns: &[usize]| -> Result<LinearFit> {
            Ok(LinearFit {
                slope: number(columns[0])?,
                intercept: number(columns[1])?,
                r_value: number(columns[2])?,
                p_value: number(columns[3])?,
                std_err: number(columns[4])?,
            })
        };
        results.push(CausalityResult {
            perpetrator_service: cell(names[0])?.to_string(),
            perpetrator_metric: cell(names[1])?.to_string(),
            consequence_service: cell(names[2])?.to_string(),
            consequence_metric: cell(names[3])?.to_string(),
            p_values: lags.iter().map(|c| number(*c)).collect::<Result<_>>()?,
            quotient: fit(&fits[0])?,
            perpetrator_trend: fit(&fits[1])?,
            consequence_trend: fit(&fits[2])?,
            selected: matches!(cell(names[4])?, "true" | "True" | "1"),
        });
    }
    Ok(results)
}
