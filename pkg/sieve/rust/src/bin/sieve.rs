// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{error, info};

use sieve::causality::MetricSelection;
use sieve::graph::{self, GraphBuilder};
use sieve::{pipeline, report};
use sieve::{CallGraph, MeasurementStore, Pipeline, SieveConfig};

#[derive(Parser, Debug)]
#[command(name = "sieve")]
#[command(about = "Reduce service metrics and find causal dependencies between services")]
struct Cli {
    /// YAML configuration file
    #[arg(long, global = true, env = "SIEVE_CONFIG")]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Command,
}

/// Flags that take precedence over the configuration file.
#[derive(Args, Debug, Default)]
struct Overrides {
    /// Resampling interval in milliseconds
    #[arg(long, global = true)]
    interval_ms: Option<i64>,

    /// Largest cluster count tried before extension
    #[arg(long, global = true)]
    max_k: Option<usize>,

    /// k-Shape random seed
    #[arg(long, global = true)]
    seed: Option<u64>,

    /// Largest Granger lag
    #[arg(long, global = true)]
    max_lag: Option<usize>,

    /// Test every preprocessed metric instead of only representatives
    #[arg(long, global = true)]
    all_metrics: bool,

    /// Significance thresholds for dependency graphs
    #[arg(long, global = true, value_delimiter = ',')]
    significance: Option<Vec<f64>>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Classify and clean every service's raw metrics
    Preprocess(Measurements),
    /// Cluster preprocessed metrics and score each cluster count
    Cluster(Measurements),
    /// Pick one representative metric per cluster of the best partition
    Representatives(Measurements),
    /// Test service pairs for Granger causality
    Causality(CausalityArgs),
    /// Run preprocess, cluster, representatives and causality
    Run(CausalityArgs),
    /// Export dependency graphs as JSON and Graphviz
    Graph {
        #[command(flatten)]
        measurements: Measurements,
        /// Directory for the exports; defaults to each measurement directory
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
    /// Compare edge quotients of repeated runs against the first one
    Variability {
        #[command(flatten)]
        measurements: Measurements,
        /// Threshold for the compared graphs; defaults to the first configured one
        #[arg(long)]
        alpha: Option<f64>,
    },
    /// Print how many metrics each reduction step keeps
    Reduction(Measurements),
    /// Print how stable cluster assignments are between measurements
    Consistency(Measurements),
}

#[derive(Args, Debug)]
struct Measurements {
    /// Measurement directories; glob patterns are expanded
    #[arg(required = true)]
    measurements: Vec<String>,
}

#[derive(Args, Debug)]
struct CausalityArgs {
    #[command(flatten)]
    measurements: Measurements,
    /// Service call graph; every service pair is tested without one
    #[arg(long)]
    callgraph: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref(), &cli.overrides)?;
    let pipeline = Pipeline::new(config);

    match cli.command {
        Command::Preprocess(m) => for_each_store(&m, |store| pipeline.preprocess(store).map(drop)),
        Command::Cluster(m) => for_each_store(&m, |store| pipeline.cluster(store).map(drop)),
        Command::Representatives(m) => {
            for_each_store(&m, |store| pipeline.representatives(store).map(drop))
        }
        Command::Causality(args) => {
            let callgraph = load_callgraph(args.callgraph.as_deref())?;
            for_each_store(&args.measurements, |store| {
                pipeline.causality(store, callgraph.as_ref()).map(drop)
            })
        }
        Command::Run(args) => {
            let callgraph = load_callgraph(args.callgraph.as_deref())?;
            for_each_store(&args.measurements, |store| {
                pipeline.run(store, callgraph.as_ref()).map(drop)
            })
        }
        Command::Graph {
            measurements,
            output_dir,
        } => for_each_store(&measurements, |store| {
            export_graphs(&pipeline, store, output_dir.as_deref())
        }),
        Command::Variability {
            measurements,
            alpha,
        } => variability(&pipeline, &measurements, alpha),
        Command::Reduction(m) => {
            let mut rows = Vec::new();
            for store in open_stores(&m)? {
                rows.extend(report::reduction(&store)?);
            }
            let mut out = std::io::stdout().lock();
            writeln!(out, "measurement\tservice\tfields\tpreprocessed\tbest_k\trepresentatives")?;
            for row in rows {
                let best_k = row.best_k.map(|k| k.to_string()).unwrap_or_default();
                writeln!(
                    out,
                    "{}\t{}\t{}\t{}\t{}\t{}",
                    row.measurement,
                    row.service,
                    row.fields,
                    row.preprocessed,
                    best_k,
                    row.representatives
                )?;
            }
            Ok(())
        }
        Command::Consistency(m) => {
            let rows = report::consistency(&open_stores(&m)?)?;
            let mut out = std::io::stdout().lock();
            writeln!(out, "service\tmeasurement_a\tmeasurement_b\tshared_metrics\tami")?;
            for row in rows {
                writeln!(
                    out,
                    "{}\t{}\t{}\t{}\t{:.6}",
                    row.service, row.measurement_a, row.measurement_b, row.shared_metrics, row.ami
                )?;
            }
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>, overrides: &Overrides) -> Result<SieveConfig> {
    let mut config = match path {
        Some(path) => SieveConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => SieveConfig::default(),
    };
    if let Some(interval) = overrides.interval_ms {
        config.sampling.interval_ms = interval;
    }
    if let Some(max_k) = overrides.max_k {
        config.clustering.selection.max_k = max_k;
    }
    if let Some(seed) = overrides.seed {
        config.clustering.kshape.seed = seed;
    }
    if let Some(max_lag) = overrides.max_lag {
        config.causality.max_lag = max_lag;
    }
    if overrides.all_metrics {
        config.causality.metrics = MetricSelection::All;
    }
    if let Some(significance) = &overrides.significance {
        config.graph.significance = significance.clone();
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn load_callgraph(path: Option<&Path>) -> Result<Option<CallGraph>> {
    let Some(path) = path else {
        return Ok(None);
    };
    let graph = CallGraph::load(path)
        .with_context(|| format!("failed to load call graph from {}", path.display()))?;
    info!(path = %path.display(), edges = graph.len(), "call graph loaded");
    Ok(Some(graph))
}

/// Expand the measurement arguments into directories, keeping their order.
fn measurement_dirs(m: &Measurements) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for pattern in &m.measurements {
        let mut matched: Vec<PathBuf> = glob::glob(pattern)
            .with_context(|| format!("invalid measurement pattern {pattern:?}"))?
            .filter_map(|entry| entry.ok())
            .filter(|path| path.is_dir())
            .collect();
        if matched.is_empty() {
            bail!("no measurement directory matches {pattern:?}");
        }
        matched.sort();
        dirs.extend(matched);
    }
    Ok(dirs)
}

fn open_stores(m: &Measurements) -> Result<Vec<MeasurementStore>> {
    measurement_dirs(m)?
        .into_iter()
        .map(|dir| {
            MeasurementStore::open(&dir)
                .with_context(|| format!("failed to open measurement {}", dir.display()))
        })
        .collect()
}

/// Run `f` on every measurement. A failing measurement does not stop the
/// others but fails the command.
fn for_each_store(
    m: &Measurements,
    f: impl Fn(&MeasurementStore) -> sieve::Result<()>,
) -> Result<()> {
    let dirs = measurement_dirs(m)?;
    let mut failed = 0;
    for dir in &dirs {
        let outcome = MeasurementStore::open(dir).and_then(|store| f(&store));
        if let Err(e) = outcome {
            error!(measurement = %dir.display(), error = %e, "measurement failed");
            failed += 1;
        }
    }
    if failed > 0 {
        bail!("{failed} of {} measurements failed", dirs.len());
    }
    Ok(())
}

fn export_graphs(
    pipeline: &Pipeline,
    store: &MeasurementStore,
    output_dir: Option<&Path>,
) -> sieve::Result<()> {
    let dir = output_dir.unwrap_or(store.dir());
    std::fs::create_dir_all(dir).map_err(|source| sieve::Error::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let name = store.load()?.name;
    for graph in pipeline.graph(store)? {
        let stem = format!("{name}-dependencies-{}", graph.significance);
        let json = dir.join(format!("{stem}.json"));
        graph::write_json(&json, &graph.edges)?;
        let dot = dir.join(format!("{stem}.dot"));
        std::fs::write(&dot, graph::to_dot(&graph.edges)).map_err(|source| sieve::Error::Io {
            path: dot.clone(),
            source,
        })?;
        info!(
            significance = graph.significance,
            edges = graph.edges.len(),
            path = %json.display(),
            "dependency graph written"
        );
    }
    Ok(())
}

fn variability(pipeline: &Pipeline, m: &Measurements, alpha: Option<f64>) -> Result<()> {
    let config = pipeline.config();
    let Some(alpha) = alpha.or_else(|| config.graph.significance.first().copied()) else {
        bail!("no significance threshold configured");
    };
    let builder = GraphBuilder::with_config(config.graph.clone());
    let mut runs = Vec::new();
    for store in open_stores(m)? {
        let results = pipeline::causality_results(&store)?;
        runs.push(builder.edges(&results, alpha));
    }
    let Some(reference) = runs.first() else {
        bail!("no measurements given");
    };
    let report = graph::variability(reference, &runs);
    let mut out = std::io::stdout().lock();
    serde_json::to_writer_pretty(&mut out, &report).context("failed to write variability report")?;
    writeln!(out)?;
    Ok(())
}
