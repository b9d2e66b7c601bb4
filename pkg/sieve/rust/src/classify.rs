// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Behavioural classification of metric series.
//!
//! Each column of a service table falls into exactly one [`Category`]; the
//! category decides whether the preprocessor keeps, differences or drops it.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::stats;
use crate::table::{Column, TimeTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// No usable samples.
    Empty,
    /// Too few samples relative to the table length.
    LowFrequency,
    /// Present samples all share one value.
    Constant,
    /// Nearly flat once normalized.
    LowVariance,
    /// Never decreasing or never increasing, typically a cumulative counter.
    Monotonic,
    Other,
}

impl Category {
    pub fn as_str(self) -> &'static str {
        match self {
            Category::Empty => "empty",
            Category::LowFrequency => "low_frequency",
            Category::Constant => "constant",
            Category::LowVariance => "low_variance",
            Category::Monotonic => "monotonic",
            Category::Other => "other",
        }
    }

    /// Whether preprocessing keeps columns of this category.
    pub fn is_eligible(self) -> bool {
        matches!(self, Category::Monotonic | Category::Other)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How sparsely sampled columns are treated.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "policy")]
pub enum SparsePolicy {
    /// Only columns without any sample are `empty`.
    Disabled,
    /// Columns with `present / total <= ratio` are `empty`.
    Empty { ratio: f64 },
    /// Columns with `present / total <= ratio` are `low_frequency`.
    LowFrequency { ratio: f64 },
}

impl Default for SparsePolicy {
    fn default() -> Self {
        SparsePolicy::LowFrequency { ratio: 0.002 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClassifierConfig {
    pub sparse: SparsePolicy,
    /// Upper bound on the variance of the z-scored samples for `low_variance`.
    pub low_variance_threshold: f64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            sparse: SparsePolicy::default(),
            low_variance_threshold: 1e-2,
        }
    }
}

/// Field names per category; every classified column appears exactly once.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Classification(BTreeMap<Category, Vec<String>>);

impl Classification {
    pub fn insert(&mut self, category: Category, field: impl Into<String>) {
        self.0.entry(category).or_default().push(field.into());
    }

    pub fn fields(&self, category: Category) -> &[String] {
        self.0.get(&category).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn category_of(&self, field: &str) -> Option<Category> {
        self.0
            .iter()
            .find(|(_, fields)| fields.iter().any(|f| f == field))
            .map(|(category, _)| *category)
    }
}

/// Classifies individual series according to a [`ClassifierConfig`].
#[derive(Debug, Clone, Default)]
pub struct TimeSeriesClassifier {
    config: ClassifierConfig,
}

impl TimeSeriesClassifier {
    pub fn with_config(config: ClassifierConfig) -> Self {
        Self { config }
    }

    /// Classify one column; fails for non-numeric columns.
    pub fn classify_column(&self, column: &Column) -> Result<Category> {
        let values = column.values()?;
        let present: Vec<f64> = values.iter().flatten().copied().collect();
        Ok(self.classify(&present, values.len()))
    }

    /// Classify the present samples of a series that spans `total` index slots.
    pub fn classify(&self, present: &[f64], total: usize) -> Category {
        if present.is_empty() {
            return Category::Empty;
        }
        let ratio = present.len() as f64 / total.max(1) as f64;
        match self.config.sparse {
            SparsePolicy::Empty { ratio: limit } if ratio <= limit => return Category::Empty,
            SparsePolicy::LowFrequency { ratio: limit } if ratio <= limit => {
                return Category::LowFrequency;
            }
            _ => {}
        }

        // A lone sample has no spread and counts as constant.
        if present.len() < 2 || stats::variance(present, 1) == 0.0 {
            return Category::Constant;
        }
        if stats::variance(&stats::zscore(present, 0), 1) <= self.config.low_variance_threshold {
            return Category::LowVariance;
        }
        if stats::is_monotonic(present) {
            return Category::Monotonic;
        }
        Category::Other
    }

    /// Partition every column of `table` into categories, in column order.
    pub fn classify_table(&self, table: &TimeTable) -> Result<Classification> {
        let mut classification = Classification::default();
        for column in table.columns() {
            let category = self.classify_column(column)?;
            tracing::trace!(column = %column.name, %category, "classified column");
            classification.insert(category, column.name.clone());
        }
        Ok(classification)
    }
}
