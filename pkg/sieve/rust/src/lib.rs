// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Metric reduction and cross-service causality analysis.
//!
//! A measurement directory holds one raw metric table per service and a
//! `metadata.json` describing them. The stages in [`pipeline`] shrink each
//! service's metrics to a few cluster representatives, then test the
//! representatives of neighbouring services for Granger causality. The
//! [`graph`] module turns the results into dependency graphs.

pub mod callgraph;
pub mod causality;
pub mod classify;
pub mod config;
pub mod error;
pub mod graph;
pub mod pipeline;
pub mod preprocess;
pub mod report;
pub mod representative;
pub mod selection;
pub mod shape;
pub mod stats;
pub mod store;
pub mod table;

pub use callgraph::CallGraph;
pub use config::SieveConfig;
pub use error::{Error, Result};
pub use pipeline::{Pipeline, StageSummary};
pub use store::{Measurement, MeasurementStore, Service};
