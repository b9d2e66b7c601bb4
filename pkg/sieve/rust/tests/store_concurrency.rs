// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use serde_json::Value;

use sieve::{Measurement, MeasurementStore, Service};

const WRITERS: usize = 16;
const INCREMENTS: usize = 5;

#[test]
fn test_concurrent_updates_are_serialized() {
    let dir = tempfile::tempdir().unwrap();
    MeasurementStore::create(
        dir.path(),
        &Measurement {
            name: "contended".into(),
            services: vec![Service {
                name: "web".into(),
                filename: "web.tsv".into(),
                ..Default::default()
            }],
            ..Default::default()
        },
    )
    .unwrap();

    std::thread::scope(|scope| {
        for _ in 0..WRITERS {
            scope.spawn(|| {
                // Every writer holds its own handle, as separate processes would.
                let store = MeasurementStore::open(dir.path()).unwrap();
                for _ in 0..INCREMENTS {
                    store
                        .update(|m| {
                            let counter =
                                m.extra.entry("counter".to_string()).or_insert(Value::from(0));
                            *counter = Value::from(counter.as_u64().unwrap_or(0) + 1);
                            Ok(())
                        })
                        .unwrap();
                }
            });
        }
    });

    let measurement = MeasurementStore::open(dir.path()).unwrap().load().unwrap();
    assert_eq!(measurement.extra["counter"], Value::from(WRITERS * INCREMENTS));
    assert_eq!(measurement.services.len(), 1);
}

#[test]
fn test_readers_never_see_partial_documents() {
    let dir = tempfile::tempdir().unwrap();
    let store = MeasurementStore::create(
        dir.path(),
        &Measurement {
            name: "busy".into(),
            ..Default::default()
        },
    )
    .unwrap();

    std::thread::scope(|scope| {
        scope.spawn(|| {
            for i in 0..200 {
                store
                    .update(|m| {
                        m.causality_files.insert(format!("a-b{i}-causality-callgraph.tsv.gz"));
                        Ok(())
                    })
                    .unwrap();
            }
        });
        scope.spawn(|| {
            for _ in 0..200 {
                store.load().unwrap();
            }
        });
    });

    assert_eq!(store.load().unwrap().causality_files.len(), 200);
}
