// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::causality::CausalityConfig;
use crate::classify::{ClassifierConfig, SparsePolicy};
use crate::error::{Error, Result};
use crate::graph::GraphConfig;
use crate::preprocess::SamplingConfig;
use crate::selection::SelectionConfig;
use crate::shape::KShapeConfig;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClusteringConfig {
    pub selection: SelectionConfig,
    pub kshape: KShapeConfig,
}

/// Settings of every stage. Each key is optional in the YAML file.
///
/// ```yaml
/// sampling:
///   interval_ms: 500
///   interpolation_limit: 4
/// classifier:
///   sparse: { policy: low_frequency, ratio: 0.002 }
///   low_variance_threshold: 0.01
/// clustering:
///   selection: { min_k: 1, max_k: 7, extend_limit: 15 }
///   kshape: { max_iterations: 100, seed: 0 }
/// causality:
///   max_lag: 5
///   metrics: representatives
///   artifact_tag: callgraph
/// graph:
///   significance: [0.01, 0.05, 0.1]
///   lag: 1
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SieveConfig {
    pub sampling: SamplingConfig,
    pub classifier: ClassifierConfig,
    pub clustering: ClusteringConfig,
    pub causality: CausalityConfig,
    pub graph: GraphConfig,
}

impl SieveConfig {
    /// Load and validate a YAML configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        let config: SieveConfig = serde_yaml::from_str(&contents)
            .map_err(|e| Error::InvalidConfig(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| Err(Error::InvalidConfig(reason));
        if self.sampling.interval_ms <= 0 {
            return invalid(format!(
                "sampling.interval_ms must be positive, got {}",
                self.sampling.interval_ms
            ));
        }
        match self.classifier.sparse {
            SparsePolicy::Empty { ratio } | SparsePolicy::LowFrequency { ratio }
                if !(0.0..=1.0).contains(&ratio) =>
            {
                return invalid(format!("classifier.sparse.ratio must be in [0, 1], got {ratio}"));
            }
            _ => {}
        }
        if self.classifier.low_variance_threshold < 0.0 {
            return invalid("classifier.low_variance_threshold must not be negative".to_string());
        }
        let selection = &self.clustering.selection;
        if selection.min_k == 0 || selection.min_k > selection.max_k {
            return invalid(format!(
                "clustering.selection needs 1 <= min_k <= max_k, got {}..={}",
                selection.min_k, selection.max_k
            ));
        }
        if self.clustering.kshape.max_iterations == 0 {
            return invalid("clustering.kshape.max_iterations must be positive".to_string());
        }
        if self.causality.max_lag == 0 {
            return invalid("causality.max_lag must be positive".to_string());
        }
        if self.causality.artifact_tag.is_empty() || self.causality.artifact_tag.contains('/') {
            return invalid(format!(
                "causality.artifact_tag {:?} is not a valid file name part",
                self.causality.artifact_tag
            ));
        }
        if self.graph.lag == 0 || self.graph.lag > self.causality.max_lag {
            return invalid(format!(
                "graph.lag must be in 1..={}, got {}",
                self.causality.max_lag, self.graph.lag
            ));
        }
        if let Some(alpha) = self.graph.significance.iter().find(|a| !(**a > 0.0 && **a < 1.0)) {
            return invalid(format!("graph.significance values must be in (0, 1), got {alpha}"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::causality::MetricSelection;

    fn load(yaml: &str) -> Result<SieveConfig> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sieve.yaml");
        std::fs::write(&path, yaml).unwrap();
        SieveConfig::load(&path)
    }

    #[test]
    fn test_empty_file_gives_defaults() {
        assert_eq!(load("{}").unwrap(), SieveConfig::default());
        SieveConfig::default().validate().unwrap();
    }

    #[test]
    fn test_partial_sections() {
        let config = load(
            r#"
sampling:
  interval_ms: 1000
classifier:
  sparse: { policy: empty, ratio: 0.01 }
causality:
  metrics: all
graph:
  significance: [0.05]
"#,
        )
        .unwrap();
        assert_eq!(config.sampling.interval_ms, 1000);
        assert_eq!(config.sampling.interpolation_limit, 4);
        assert_eq!(config.classifier.sparse, SparsePolicy::Empty { ratio: 0.01 });
        assert_eq!(config.causality.metrics, MetricSelection::All);
        assert_eq!(config.causality.max_lag, 5);
        assert_eq!(config.graph.significance, vec![0.05]);
    }

    #[test]
    fn test_unknown_keys_rejected() {
        assert!(matches!(load("sampling:\n  rate: 2\n"), Err(Error::InvalidConfig(_))));
        assert!(matches!(load("plots: true\n"), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_validation() {
        assert!(load("graph:\n  lag: 6\n").is_err());
        assert!(load("clustering:\n  selection: { min_k: 3, max_k: 2 }\n").is_err());
        assert!(load("graph:\n  significance: [1.5]\n").is_err());
        assert!(load("sampling:\n  interval_ms: 0\n").is_err());
    }
}
