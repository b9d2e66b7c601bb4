// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Turning raw, irregularly sampled service tables into gap-free series on a
//! fixed grid.
//!
//! Only `other` and `monotonic` columns survive. Counters are replaced by
//! their first difference (`<name>-diff`) and every column loses its first
//! sample so all columns stay aligned.

use serde::{Deserialize, Serialize};

use crate::classify::{Category, Classification, ClassifierConfig, TimeSeriesClassifier};
use crate::error::{Error, Result};
use crate::table::{Column, ColumnData, TimeTable};

/// Suffix of differenced counter columns.
pub const DIFF_SUFFIX: &str = "-diff";

/// Tag column whose per-core rows are dropped in favour of `cpu-total`.
const CPU_TAG: &str = "cpu";
const CPU_TOTAL: &str = "cpu-total";

/// Upper bound on the grid length produced by [`resample`], about 58 days at
/// the default interval.
pub const MAX_RESAMPLE_BINS: usize = 10_000_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SamplingConfig {
    /// Width of one resampling bin.
    pub interval_ms: i64,
    /// Maximum consecutive missing samples filled by interpolation per gap.
    pub interpolation_limit: usize,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            interval_ms: 500,
            // Two update periods at 0.5 Hz.
            interpolation_limit: 4,
        }
    }
}

/// Output of [`Preprocessor::preprocess`].
#[derive(Debug, Clone)]
pub struct Preprocessed {
    pub table: TimeTable,
    pub classification: Classification,
}

impl Preprocessed {
    pub fn fields(&self) -> Vec<String> {
        self.table.column_names()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Preprocessor {
    sampling: SamplingConfig,
    classifier: TimeSeriesClassifier,
}

impl Preprocessor {
    pub fn with_config(sampling: SamplingConfig, classifier: ClassifierConfig) -> Self {
        Self {
            sampling,
            classifier: TimeSeriesClassifier::with_config(classifier),
        }
    }

    /// Classify the declared `fields` of a raw table and build the cleaned table.
    pub fn preprocess<S: AsRef<str>>(&self, raw: &TimeTable, fields: &[S]) -> Result<Preprocessed> {
        let mut raw = raw.clone();
        keep_total_cpu_rows(&mut raw);
        let raw = raw.select(fields)?;
        let classification = self.classifier.classify_table(&raw)?;

        let eligible: Vec<&Column> = raw
            .columns()
            .iter()
            .filter(|c| {
                classification
                    .category_of(&c.name)
                    .is_some_and(Category::is_eligible)
            })
            .collect();
        if eligible.is_empty() {
            return Ok(Preprocessed {
                table: TimeTable::default(),
                classification,
            });
        }

        let names: Vec<&str> = eligible.iter().map(|c| c.name.as_str()).collect();
        let resampled = resample(&raw.select(&names)?, self.sampling.interval_ms)?;

        let index = resampled.index().get(1..).unwrap_or_default().to_vec();
        let mut columns = Vec::with_capacity(resampled.columns().len());
        for column in resampled.columns() {
            let filled = fill_gaps(
                column.values()?,
                resampled.index(),
                self.sampling.interpolation_limit,
            );
            let column = match classification.category_of(&column.name) {
                Some(Category::Monotonic) => Column::dense(
                    format!("{}{DIFF_SUFFIX}", column.name),
                    &filled.windows(2).map(|w| w[1] - w[0]).collect::<Vec<_>>(),
                ),
                _ => Column::dense(column.name.clone(), filled.get(1..).unwrap_or_default()),
            };
            columns.push(column);
        }
        Ok(Preprocessed {
            table: TimeTable::new(index, columns)?,
            classification,
        })
    }
}

/// Keep only aggregate rows when the table carries a populated `cpu` tag.
pub fn keep_total_cpu_rows(table: &mut TimeTable) {
    let cpu = match table.column(CPU_TAG) {
        Ok(Column {
            data: ColumnData::Text(values),
            ..
        }) if values.iter().any(Option::is_some) => values.clone(),
        _ => return,
    };
    table.retain_rows(|row| cpu[row].as_deref().is_none_or(|v| v == CPU_TOTAL));
}

/// Resample onto a contiguous grid of `interval_ms` bins, averaging the
/// present samples of each bin.
///
/// Fails with [`Error::TimeSpanTooLong`] when the index would need more than
/// [`MAX_RESAMPLE_BINS`] bins, which usually means a stray timestamp.
pub fn resample(table: &TimeTable, interval_ms: i64) -> Result<TimeTable> {
    if interval_ms <= 0 {
        return Err(Error::InvalidConfig(format!(
            "resampling interval must be positive, got {interval_ms}"
        )));
    }
    let (Some(&first), Some(&last)) = (table.index().iter().min(), table.index().iter().max())
    else {
        return Ok(table.clone());
    };
    let first_bin = first.div_euclid(interval_ms);
    let bins = last
        .div_euclid(interval_ms)
        .checked_sub(first_bin)
        .and_then(|span| usize::try_from(span).ok())
        .and_then(|span| span.checked_add(1))
        .filter(|&bins| bins <= MAX_RESAMPLE_BINS)
        .ok_or(Error::TimeSpanTooLong {
            first,
            last,
            interval_ms,
            limit: MAX_RESAMPLE_BINS,
        })?;
    let index: Vec<i64> = (0..bins as i64).map(|i| (first_bin + i) * interval_ms).collect();
    let slot = |time: i64| (time.div_euclid(interval_ms) - first_bin) as usize;

    let mut columns = Vec::with_capacity(table.columns().len());
    for column in table.columns() {
        let mut sums = vec![(0.0, 0usize); bins];
        for (time, value) in table.index().iter().zip(column.values()?) {
            if let Some(v) = value {
                let bin = &mut sums[slot(*time)];
                bin.0 += v;
                bin.1 += 1;
            }
        }
        let values = sums
            .into_iter()
            .map(|(sum, n)| (n > 0).then(|| sum / n as f64))
            .collect();
        columns.push(Column::numeric(column.name.clone(), values));
    }
    TimeTable::new(index, columns)
}

/// Interpolate linearly in time, at most `limit` samples into each gap, then
/// back-fill and forward-fill what remains.
///
/// A series without any present sample comes back as zeros.
pub fn fill_gaps(values: &[Option<f64>], times: &[i64], limit: usize) -> Vec<f64> {
    let mut out: Vec<Option<f64>> = values.to_vec();
    let mut last: Option<usize> = None;
    for i in 0..values.len() {
        let Some(current) = values[i] else {
            continue;
        };
        if let Some(prev) = last {
            let start = values[prev].unwrap_or(current);
            let span = (times[i] - times[prev]) as f64;
            for (filled, j) in (prev + 1..i).enumerate() {
                if filled >= limit {
                    break;
                }
                let t = (times[j] - times[prev]) as f64 / span;
                out[j] = Some(start + (current - start) * t);
            }
        }
        last = Some(i);
    }

    // Trailing gap: hold the last value for up to `limit` samples.
    if let Some(prev) = last {
        for j in (prev + 1..values.len()).take(limit) {
            out[j] = values[prev];
        }
    }

    let mut next: Option<f64> = None;
    for value in out.iter_mut().rev() {
        match value {
            Some(v) => next = Some(*v),
            None => *value = next,
        }
    }
    let mut prev: Option<f64> = None;
    out.into_iter()
        .map(|value| {
            let v = value.or(prev).unwrap_or(0.0);
            prev = Some(v);
            v
        })
        .collect()
}
