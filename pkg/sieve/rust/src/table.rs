// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Time-indexed tables and their tab-separated on-disk form.
//!
//! Every artifact exchanged between stages (raw service series, preprocessed
//! series, cluster members) is a TSV file whose first column is `time`,
//! optionally gzip-compressed when the file name ends in `.gz`.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

use chrono::{DateTime, NaiveDateTime};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::{Error, Result};
use crate::store::write_atomically;

pub const TIME_COLUMN: &str = "time";

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Storage of a single column.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnData {
    Numeric {
        values: Vec<Option<f64>>,
        /// True when every present value was written as an integer.
        integer: bool,
    },
    Text(Vec<Option<String>>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub data: ColumnData,
}

impl Column {
    pub fn numeric(name: impl Into<String>, values: Vec<Option<f64>>) -> Self {
        Self {
            name: name.into(),
            data: ColumnData::Numeric {
                values,
                integer: false,
            },
        }
    }

    /// Dense float column without missing values.
    pub fn dense(name: impl Into<String>, values: &[f64]) -> Self {
        Self::numeric(name, values.iter().copied().map(Some).collect())
    }

    pub fn kind(&self) -> &'static str {
        match &self.data {
            ColumnData::Numeric { integer: true, .. } => "int64",
            ColumnData::Numeric { integer: false, .. } => "float64",
            ColumnData::Text(_) => "object",
        }
    }

    /// Numeric values, or `UnsupportedColumnType` for text columns.
    pub fn values(&self) -> Result<&[Option<f64>]> {
        match &self.data {
            ColumnData::Numeric { values, .. } => Ok(values),
            ColumnData::Text(_) => Err(Error::UnsupportedColumnType {
                column: self.name.clone(),
                kind: self.kind(),
            }),
        }
    }

    /// Present values in index order.
    pub fn present(&self) -> Result<Vec<f64>> {
        Ok(self.values()?.iter().flatten().copied().collect())
    }

    fn len(&self) -> usize {
        match &self.data {
            ColumnData::Numeric { values, .. } => values.len(),
            ColumnData::Text(values) => values.len(),
        }
    }

    fn retain_rows(&mut self, keep: &[bool]) {
        fn filter<T>(values: &mut Vec<T>, keep: &[bool]) {
            let mut i = 0;
            values.retain(|_| {
                let k = keep[i];
                i += 1;
                k
            });
        }
        match &mut self.data {
            ColumnData::Numeric { values, .. } => filter(values, keep),
            ColumnData::Text(values) => filter(values, keep),
        }
    }

    fn cell(&self, row: usize) -> String {
        match &self.data {
            ColumnData::Numeric { values, .. } => {
                values[row].map(|v| v.to_string()).unwrap_or_default()
            }
            ColumnData::Text(values) => values[row].clone().unwrap_or_default(),
        }
    }
}

/// Columns sharing one millisecond time index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimeTable {
    index: Vec<i64>,
    columns: Vec<Column>,
}

impl TimeTable {
    /// Build a table, checking that every column matches the index length.
    pub fn new(index: Vec<i64>, columns: Vec<Column>) -> Result<Self> {
        if let Some(column) = columns.iter().find(|c| c.len() != index.len()) {
            return Err(Error::LengthMismatch {
                column: column.name.clone(),
                expected: index.len(),
                got: column.len(),
            });
        }
        Ok(Self { index, columns })
    }

    pub fn index(&self) -> &[i64] {
        &self.index
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn column(&self, name: &str) -> Result<&Column> {
        self.columns
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| Error::MissingColumn(name.to_string()))
    }

    /// Keep only the named columns, in the requested order.
    pub fn select<S: AsRef<str>>(&self, names: &[S]) -> Result<TimeTable> {
        let columns = names
            .iter()
            .map(|name| self.column(name.as_ref()).cloned())
            .collect::<Result<Vec<_>>>()?;
        Ok(TimeTable {
            index: self.index.clone(),
            columns,
        })
    }

    /// Drop rows for which `keep` returns false.
    pub fn retain_rows(&mut self, keep: impl Fn(usize) -> bool) {
        let mask: Vec<bool> = (0..self.index.len()).map(keep).collect();
        let mut i = 0;
        self.index.retain(|_| {
            let k = mask[i];
            i += 1;
            k
        });
        for column in &mut self.columns {
            column.retain_rows(&mask);
        }
    }

    /// Read a TSV table, decompressing when the path ends in `.gz`.
    pub fn read(path: &Path) -> Result<TimeTable> {
        let file = File::open(path).map_err(|e| Error::io(path, e))?;
        let reader: Box<dyn Read> = if is_gzip(path) {
            Box::new(GzDecoder::new(file))
        } else {
            Box::new(file)
        };
        Self::parse(BufReader::new(reader), path)
    }

    fn parse(reader: impl BufRead, path: &Path) -> Result<TimeTable> {
        let mut lines = reader.lines();
        let header = match lines.next() {
            Some(line) => line.map_err(|e| Error::io(path, e))?,
            None => return Err(Error::malformed(path, 1, "missing header")),
        };
        let mut names = header.split('\t').map(str::to_string);
        match names.next() {
            Some(first) if first == TIME_COLUMN => {}
            _ => return Err(Error::malformed(path, 1, "first column must be `time`")),
        }
        let names: Vec<String> = names.collect();

        let mut rows: Vec<(i64, Vec<String>)> = Vec::new();
        for (i, line) in lines.enumerate() {
            let line_no = i + 2;
            let line = line.map_err(|e| Error::io(path, e))?;
            if line.is_empty() {
                continue;
            }
            let mut cells = line.split('\t');
            let time = cells.next().unwrap_or_default();
            let time = parse_time(time)
                .ok_or_else(|| Error::malformed(path, line_no, format!("bad timestamp {time:?}")))?;
            let mut cells: Vec<String> = cells.map(str::to_string).collect();
            if cells.len() > names.len() {
                return Err(Error::malformed(
                    path,
                    line_no,
                    format!("expected {} cells, got {}", names.len() + 1, cells.len() + 1),
                ));
            }
            cells.resize(names.len(), String::new());
            rows.push((time, cells));
        }
        rows.sort_by_key(|(time, _)| *time);

        let index = rows.iter().map(|(time, _)| *time).collect();
        let columns = names
            .into_iter()
            .enumerate()
            .map(|(c, name)| {
                let cells: Vec<&str> = rows.iter().map(|(_, cells)| cells[c].as_str()).collect();
                Column {
                    name,
                    data: infer_column(&cells),
                }
            })
            .collect();
        Ok(TimeTable { index, columns })
    }

    /// Write the table as TSV, compressing when the path ends in `.gz`.
    ///
    /// The output is a pure function of the table contents. The file appears
    /// at `path` only once it is complete.
    pub fn write(&self, path: &Path) -> Result<()> {
        write_atomically(path, |file| {
            if is_gzip(path) {
                // flate2 leaves the gzip mtime at zero.
                let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
                self.write_to(&mut encoder)?;
                encoder.finish()?.flush()
            } else {
                let mut writer = BufWriter::new(file);
                self.write_to(&mut writer)?;
                writer.flush()
            }
        })
    }

    fn write_to(&self, out: &mut impl Write) -> std::io::Result<()> {
        write!(out, "{TIME_COLUMN}")?;
        for column in &self.columns {
            write!(out, "\t{}", column.name)?;
        }
        writeln!(out)?;
        for (row, time) in self.index.iter().enumerate() {
            write!(out, "{}", format_time(*time))?;
            for column in &self.columns {
                write!(out, "\t{}", column.cell(row))?;
            }
            writeln!(out)?;
        }
        Ok(())
    }
}

fn is_gzip(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "gz")
}

fn is_missing(cell: &str) -> bool {
    matches!(cell, "" | "nan" | "NaN" | "null" | "None")
}

fn infer_column(cells: &[&str]) -> ColumnData {
    let mut values = Vec::with_capacity(cells.len());
    let mut integer = true;
    for cell in cells {
        if is_missing(cell) {
            values.push(None);
            continue;
        }
        if cell.parse::<i64>().is_ok() {
            values.push(cell.parse::<f64>().ok());
            continue;
        }
        match cell.parse::<f64>() {
            Ok(v) => {
                integer = false;
                values.push(Some(v));
            }
            Err(_) => {
                return ColumnData::Text(
                    cells
                        .iter()
                        .map(|c| (!is_missing(c)).then(|| c.to_string()))
                        .collect(),
                );
            }
        }
    }
    // An integer column with gaps is promoted to float, as a dataframe would.
    let integer = integer && values.iter().all(Option::is_some) && !values.is_empty();
    ColumnData::Numeric { values, integer }
}

/// Parse a timestamp into epoch milliseconds.
pub fn parse_time(cell: &str) -> Option<i64> {
    let cell = cell.trim();
    if let Ok(ms) = cell.parse::<i64>() {
        return Some(ms);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(cell) {
        return Some(dt.timestamp_millis());
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(cell, fmt).ok())
        .map(|dt| dt.and_utc().timestamp_millis())
}

pub fn format_time(ms: i64) -> String {
    match DateTime::from_timestamp_millis(ms) {
        Some(dt) => dt.format(TIME_FORMAT).to_string(),
        None => ms.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_time_formats() {
        assert_eq!(parse_time("1500"), Some(1500));
        assert_eq!(parse_time("1970-01-01 00:00:01.500"), Some(1500));
        assert_eq!(parse_time("1970-01-01T00:00:02"), Some(2000));
        assert_eq!(parse_time("1970-01-01T00:00:02+00:00"), Some(2000));
        assert_eq!(parse_time("yesterday"), None);
    }

    #[test]
    fn test_read_infers_column_types() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raw.tsv");
        std::fs::write(
            &path,
            "time\tcount\tload\thost\n\
             1970-01-01 00:00:01\t2\t0.5\ta\n\
             1970-01-01 00:00:00\t1\t\tb\n",
        )
        .unwrap();

        let table = TimeTable::read(&path).unwrap();
        assert_eq!(table.index(), &[0, 1000]);
        assert_eq!(table.column("count").unwrap().kind(), "int64");
        assert_eq!(table.column("load").unwrap().kind(), "float64");
        assert_eq!(table.column("load").unwrap().values().unwrap(), &[None, Some(0.5)]);
        assert!(matches!(
            table.column("host").unwrap().values(),
            Err(Error::UnsupportedColumnType { .. })
        ));
    }

    #[test]
    fn test_write_read_gzip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.tsv.gz");
        let table = TimeTable::new(
            vec![0, 500, 1000],
            vec![Column::numeric("a", vec![Some(1.25), None, Some(-3.0)])],
        )
        .unwrap();
        table.write(&path).unwrap();

        let read = TimeTable::read(&path).unwrap();
        assert_eq!(read.index(), table.index());
        assert_eq!(
            read.column("a").unwrap().values().unwrap(),
            table.column("a").unwrap().values().unwrap()
        );
    }

    #[test]
    fn test_write_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let table = TimeTable::new(vec![0, 500], vec![Column::dense("a", &[0.1, 0.2])]).unwrap();
        let first = dir.path().join("first.tsv.gz");
        let second = dir.path().join("second.tsv.gz");
        table.write(&first).unwrap();
        table.write(&second).unwrap();
        assert_eq!(std::fs::read(first).unwrap(), std::fs::read(second).unwrap());
    }

    #[test]
    fn test_rejects_missing_time_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.tsv");
        std::fs::write(&path, "timestamp\ta\n0\t1\n").unwrap();
        assert!(matches!(
            TimeTable::read(&path),
            Err(Error::MalformedTable { line: 1, .. })
        ));
    }

    #[test]
    fn test_select_and_retain_rows() {
        let mut table = TimeTable::new(
            vec![0, 1, 2],
            vec![Column::dense("a", &[1.0, 2.0, 3.0]), Column::dense("b", &[4.0, 5.0, 6.0])],
        )
        .unwrap();
        table.retain_rows(|row| row != 1);
        let selected = table.select(&["b"]).unwrap();
        assert_eq!(selected.index(), &[0, 2]);
        assert_eq!(selected.column_names(), vec!["b".to_string()]);
        assert_eq!(selected.column("b").unwrap().present().unwrap(), vec![4.0, 6.0]);
        assert!(matches!(table.select(&["c"]), Err(Error::MissingColumn(_))));
    }
}
