// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Per-measurement metadata shared between independently running stages.
//!
//! A measurement directory holds `metadata.json`. Readers take plain
//! snapshots with [`MeasurementStore::load`]; writers go through
//! [`MeasurementStore::update`], which serializes concurrent read-modify-write
//! cycles with an advisory lock on `metadata.json.lock` and replaces the
//! document atomically.
//!
//! The lock lives in its own file because `metadata.json` is replaced by
//! rename on every write and a lock on the old inode would not exclude a
//! writer that opened the new one.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::ser::PrettyFormatter;
use serde_json::Value;
use tempfile::NamedTempFile;

use crate::classify::Classification;
use crate::error::{Error, Result};
use crate::preprocess::DIFF_SUFFIX;
use crate::selection;

pub const METADATA_FILE: &str = "metadata.json";
pub const LOCK_FILE: &str = "metadata.json.lock";

/// One benchmark run and everything derived from it so far.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub services: Vec<Service>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autoscaling: Option<String>,
    /// Causality artifacts written for this measurement.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub causality_files: BTreeSet<String>,
    /// Keys owned by other tools, carried through unchanged.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Measurement {
    pub fn service(&self, name: &str) -> Result<&Service> {
        self.services
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| Error::ServiceNotFound(name.to_string()))
    }

    pub fn service_mut(&mut self, name: &str) -> Result<&mut Service> {
        self.services
            .iter_mut()
            .find(|s| s.name == name)
            .ok_or_else(|| Error::ServiceNotFound(name.to_string()))
    }

    fn validate(&self, path: &Path) -> Result<()> {
        let invalid = |reason: String| Error::InvalidMetadata {
            path: path.to_path_buf(),
            reason,
        };
        let mut names = HashSet::new();
        for service in &self.services {
            if !names.insert(service.name.as_str()) {
                return Err(invalid(format!("duplicate service {}", service.name)));
            }
            let fields: HashSet<&str> = service.fields.iter().map(String::as_str).collect();
            for derived in &service.preprocessed_fields {
                let source = derived.strip_suffix(DIFF_SUFFIX).unwrap_or(derived);
                if !fields.contains(source) && !fields.contains(derived.as_str()) {
                    return Err(invalid(format!(
                        "service {}: {derived} is not derived from a declared field",
                        service.name
                    )));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Raw table, relative to the measurement directory.
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preprocessed_filename: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub preprocessed_fields: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification: Option<Classification>,
    #[serde(
        default,
        skip_serializing_if = "BTreeMap::is_empty",
        deserialize_with = "cluster_sizes"
    )]
    pub clusters: BTreeMap<usize, ClusterRecord>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Service {
    /// Recorded silhouette score per k.
    pub fn scores(&self) -> BTreeMap<usize, Option<f64>> {
        self.clusters
            .iter()
            .map(|(k, record)| (*k, record.silhouette_score))
            .collect()
    }

    pub fn best_k(&self) -> Option<usize> {
        selection::best_k(&self.scores())
    }

    /// Representative metrics of the best partition, once selected.
    pub fn representatives(&self) -> Option<&[String]> {
        let k = self.best_k()?;
        self.clusters.get(&k)?.granger_metrics.as_deref()
    }
}

/// Cluster sizes are JSON object keys. They are parsed by hand because
/// flattened structs buffer keys as strings.
fn cluster_sizes<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<BTreeMap<usize, ClusterRecord>, D::Error> {
    BTreeMap::<String, ClusterRecord>::deserialize(deserializer)?
        .into_iter()
        .map(|(k, record)| {
            k.parse::<usize>()
                .map(|k| (k, record))
                .map_err(|_| D::Error::custom(format!("cluster size {k:?} is not an integer")))
        })
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterRecord {
    /// Absent for k = 1, -1 when undefined.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub silhouette_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filenames: Vec<String>,
    #[serde(
        rename = "grangercausality-metrics",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub granger_metrics: Option<Vec<String>>,
}

/// Handle on one measurement directory.
#[derive(Debug, Clone)]
pub struct MeasurementStore {
    dir: PathBuf,
}

impl MeasurementStore {
    /// Open a measurement directory; fails when it holds no metadata.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        let metadata = dir.join(METADATA_FILE);
        if !metadata.is_file() {
            return Err(Error::io(
                metadata,
                std::io::Error::new(std::io::ErrorKind::NotFound, "measurement metadata not found"),
            ));
        }
        Ok(Self { dir })
    }

    /// Create a measurement directory with initial metadata.
    pub fn create(dir: impl Into<PathBuf>, measurement: &Measurement) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;
        let store = Self { dir };
        store.with_lock(|| store.write(measurement))?;
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of an artifact stored alongside the metadata.
    pub fn artifact(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.dir.join(METADATA_FILE)
    }

    /// Read a snapshot of the metadata without locking.
    pub fn load(&self) -> Result<Measurement> {
        let path = self.metadata_path();
        let bytes = std::fs::read(&path).map_err(|e| Error::io(&path, e))?;
        let measurement: Measurement =
            serde_json::from_slice(&bytes).map_err(|source| Error::Json {
                path: path.clone(),
                source,
            })?;
        measurement.validate(&path)?;
        Ok(measurement)
    }

    /// Locked read-modify-write of the metadata.
    ///
    /// Nothing is written when `f` fails or panics; the lock is released in
    /// every case.
    pub fn update<T>(&self, f: impl FnOnce(&mut Measurement) -> Result<T>) -> Result<T> {
        self.with_lock(|| {
            let mut measurement = self.load()?;
            let value = f(&mut measurement)?;
            measurement.validate(&self.metadata_path())?;
            self.write(&measurement)?;
            Ok(value)
        })
    }

    fn with_lock<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let path = self.dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| Error::io(&path, e))?;
        let _lock = Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, source)| Error::Lock { path, source })?;
        f()
    }

    fn write(&self, measurement: &Measurement) -> Result<()> {
        let path = self.metadata_path();
        let json_err = |source| Error::Json {
            path: path.clone(),
            source,
        };
        let buf = to_pretty_json(measurement).map_err(json_err)?;
        write_atomically(&path, |file| file.write_all(&buf))?;
        tracing::trace!(path = %path.display(), "metadata written");
        Ok(())
    }
}

/// Fill a temporary file next to `path` and rename it into place once it is
/// complete and synced. An interrupted writer leaves `path` untouched.
pub(crate) fn write_atomically(
    path: &Path,
    write: impl FnOnce(&mut File) -> std::io::Result<()>,
) -> Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| Error::io(dir, e))?;
    write(tmp.as_file_mut()).map_err(|e| Error::io(path, e))?;
    tmp.as_file().sync_all().map_err(|e| Error::io(tmp.path(), e))?;
    tmp.persist(path).map_err(|e| Error::io(path, e.error))?;
    Ok(())
}

/// JSON with sorted object keys and 4-space indentation, newline terminated.
pub(crate) fn to_pretty_json<T: Serialize>(value: &T) -> serde_json::Result<Vec<u8>> {
    // Going through `Value` sorts every object's keys.
    let value = serde_json::to_value(value)?;
    let mut buf = Vec::new();
    let mut serializer =
        serde_json::Serializer::with_formatter(&mut buf, PrettyFormatter::with_indent(b"    "));
    value.serialize(&mut serializer)?;
    buf.push(b'\n');
    Ok(buf)
}
