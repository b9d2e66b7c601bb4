// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Picking one metric per cluster to stand in for the rest.

use std::cmp::Ordering;
use std::path::Path;

use crate::error::Result;
use crate::shape::sbd;
use crate::table::TimeTable;

/// Column holding the cluster centroid in a cluster artifact.
pub const CENTROID_COLUMN: &str = "centroid";

/// File name of the `i`-th (1-based) cluster artifact of a k-partition.
pub fn cluster_artifact(service: &str, k: usize, i: usize) -> String {
    format!("{service}-cluster-{k}_{i}.tsv")
}

/// The member closest to the centroid, first column on ties.
///
/// Returns `None` when the cluster has no member columns.
pub fn representative(cluster: &TimeTable) -> Result<Option<String>> {
    let centroid = dense(cluster, CENTROID_COLUMN)?;
    let mut best: Option<(f64, &str)> = None;
    for column in cluster.columns() {
        if column.name == CENTROID_COLUMN {
            continue;
        }
        let distance = sbd(&centroid, &dense(cluster, &column.name)?).0;
        if best.is_none_or(|(d, _)| distance < d) {
            best = Some((distance, &column.name));
        }
    }
    Ok(best.map(|(_, name)| name.to_string()))
}

/// Representatives of every cluster artifact in `filenames`, visiting the
/// artifacts in natural order.
pub fn representatives<S: AsRef<str>>(dir: &Path, filenames: &[S]) -> Result<Vec<String>> {
    let mut ordered: Vec<&str> = filenames.iter().map(AsRef::as_ref).collect();
    ordered.sort_by(|a, b| natural_cmp(a, b));

    let mut chosen = Vec::new();
    for name in ordered {
        let table = TimeTable::read(&dir.join(name))?;
        match representative(&table)? {
            Some(metric) => chosen.push(metric),
            None => tracing::debug!(artifact = name, "cluster has no members"),
        }
    }
    Ok(chosen)
}

fn dense(table: &TimeTable, column: &str) -> Result<Vec<f64>> {
    Ok(table
        .column(column)?
        .values()?
        .iter()
        .map(|v| v.unwrap_or(0.0))
        .collect())
}

/// Compare strings treating runs of digits as numbers, so `x_2` < `x_10`.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut a = a.chars().peekable();
    let mut b = b.chars().peekable();
    loop {
        match (a.peek().copied(), b.peek().copied()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) if x.is_ascii_digit() && y.is_ascii_digit() => {
                let take = |it: &mut std::iter::Peekable<std::str::Chars<'_>>| {
                    let mut digits = String::new();
                    while let Some(c) = it.next_if(char::is_ascii_digit) {
                        digits.push(c);
                    }
                    digits
                };
                let (x, y) = (take(&mut a), take(&mut b));
                let (xt, yt) = (x.trim_start_matches('0'), y.trim_start_matches('0'));
                let ordering = xt
                    .len()
                    .cmp(&yt.len())
                    .then_with(|| xt.cmp(yt))
                    .then_with(|| x.len().cmp(&y.len()));
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            (Some(x), Some(y)) => {
                if x != y {
                    return x.cmp(&y);
                }
                a.next();
                b.next();
            }
        }
    }
}
