// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Undirected service call graph restricting which service pairs are tested.
//!
//! File format: one edge per line as `a b`, `a -> b` or `a -- b`. Text after
//! `#` is ignored. Direction is discarded and duplicate edges collapse.

use std::collections::BTreeSet;
use std::path::Path;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallGraph {
    /// Edges stored with the lexicographically smaller service first.
    edges: BTreeSet<(String, String)>,
}

impl CallGraph {
    /// Every pair of distinct services; used when no call graph is given.
    pub fn complete<S: AsRef<str>>(services: &[S]) -> Self {
        let mut graph = Self::default();
        for (i, a) in services.iter().enumerate() {
            for b in &services[i + 1..] {
                graph.insert(a.as_ref(), b.as_ref());
            }
        }
        graph
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        Self::parse(&text).map_err(|(line, reason)| {
            Error::InvalidConfig(format!("{}:{line}: {reason}", path.display()))
        })
    }

    /// Parse call graph text; errors carry the 1-based line number.
    pub fn parse(text: &str) -> std::result::Result<Self, (usize, String)> {
        let mut graph = Self::default();
        for (i, line) in text.lines().enumerate() {
            let line = line.split('#').next().unwrap_or_default().trim();
            if line.is_empty() {
                continue;
            }
            let tokens: Vec<&str> = line
                .split_whitespace()
                .filter(|t| !matches!(*t, "->" | "--"))
                .collect();
            match tokens.as_slice() {
                [a, b] if a != b => graph.insert(a, b),
                [a, _] => return Err((i + 1, format!("self edge on {a}"))),
                _ => return Err((i + 1, format!("expected `a b`, got {line:?}"))),
            }
        }
        Ok(graph)
    }

    pub fn insert(&mut self, a: &str, b: &str) {
        let (a, b) = if a <= b { (a, b) } else { (b, a) };
        self.edges.insert((a.to_string(), b.to_string()));
    }

    /// Edges in sorted order.
    pub fn edges(&self) -> impl Iterator<Item = (&str, &str)> {
        self.edges.iter().map(|(a, b)| (a.as_str(), b.as_str()))
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }
}
