// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use bytes::Bytes;

use protocol::{Blob, File, FileAndPath, InvocationSpec, Propagation};
use store::{GetBatch, Store};
use task_executor::Executor;

use crate::job::{run_invocation, WorkerEnv};

fn store() -> Store {
    Store::memory_for_testing(Executor::new())
}

fn spec(args: &[&str]) -> InvocationSpec {
    InvocationSpec {
        args: args.iter().map(|s| s.to_string()).collect(),
        ..InvocationSpec::default()
    }
}

async fn blob_bytes(store: &Store, blob: &Blob) -> Bytes {
    let mut batch = GetBatch::new();
    let source = batch.append(blob);
    batch.fetch(store).await.resolve(source).unwrap()
}

#[tokio::test]
async fn echo_invocation() {
    let store = store();
    let response = run_invocation(&store, &WorkerEnv::default(), spec(&["echo", "hello"]), true)
        .await
        .unwrap();

    assert_eq!(response.status, 0);
    assert_eq!(
        blob_bytes(&store, response.stdout.as_ref().unwrap()).await,
        Bytes::from_static(b"hello\n")
    );
    assert_eq!(
        blob_bytes(&store, response.stderr.as_ref().unwrap()).await,
        Bytes::new()
    );
    assert!(response.times.unwrap().cold_start);
}

#[tokio::test]
async fn file_round_trip_under_shell() {
    let store = store();
    let mut spec = spec(&[
        "/bin/sh",
        "-c",
        "cat in/a.txt > b.txt; echo World >> b.txt",
    ]);
    spec.files = vec![FileAndPath {
        file: File {
            blob: Blob::Inline("Hello, A\n".to_owned()),
            mode: 0,
        },
        path: "in/a.txt".to_owned(),
    }];
    spec.outputs = vec!["b.txt".to_owned(), "c.txt".to_owned()];

    let response = run_invocation(&store, &WorkerEnv::default(), spec, false)
        .await
        .unwrap();

    assert_eq!(response.status, 0);
    // Exactly one output: `c.txt` was not produced, which is not an error.
    assert_eq!(response.outputs.len(), 1);
    assert_eq!(response.outputs[0].path, "b.txt");
    assert_eq!(
        blob_bytes(&store, &response.outputs[0].file.blob).await,
        Bytes::from_static(b"Hello, A\nWorld\n")
    );
}

#[tokio::test]
async fn stdin_is_piped_to_the_command() {
    let store = store();
    let mut spec = spec(&["cat"]);
    spec.stdin = Some(Blob::Inline("from stdin\n".to_owned()));

    let response = run_invocation(&store, &WorkerEnv::default(), spec, false)
        .await
        .unwrap();

    assert_eq!(response.status, 0);
    assert_eq!(
        blob_bytes(&store, response.stdout.as_ref().unwrap()).await,
        Bytes::from_static(b"from stdin\n")
    );
}

#[tokio::test]
async fn nonzero_exit_status_is_not_an_error() {
    let store = store();
    let response = run_invocation(
        &store,
        &WorkerEnv::default(),
        spec(&["/bin/sh", "-c", "exit 17"]),
        false,
    )
    .await
    .unwrap();
    assert_eq!(response.status, 17);
}

#[tokio::test]
async fn input_modes_are_applied() {
    let store = store();
    let mut spec = spec(&["/bin/sh", "-c", "./tool.sh"]);
    spec.files = vec![FileAndPath {
        file: File {
            blob: Blob::Inline("#!/bin/sh\necho ran\n".to_owned()),
            mode: 0o755,
        },
        path: "tool.sh".to_owned(),
    }];

    let response = run_invocation(&store, &WorkerEnv::default(), spec, false)
        .await
        .unwrap();
    assert_eq!(response.status, 0);
    assert_eq!(
        blob_bytes(&store, response.stdout.as_ref().unwrap()).await,
        Bytes::from_static(b"ran\n")
    );
}

#[tokio::test]
async fn output_parent_directories_are_precreated() {
    let store = store();
    let mut spec = spec(&["/bin/sh", "-c", "echo nested > out/deep/d.txt"]);
    spec.outputs = vec!["out/deep/d.txt".to_owned()];

    let response = run_invocation(&store, &WorkerEnv::default(), spec, false)
        .await
        .unwrap();
    assert_eq!(response.status, 0);
    assert_eq!(response.outputs.len(), 1);
}

#[tokio::test]
async fn escaping_paths_are_rejected() {
    let store = store();
    let mut spec = spec(&["true"]);
    spec.files = vec![FileAndPath {
        file: File {
            blob: Blob::Inline("x".to_owned()),
            mode: 0,
        },
        path: "../escape.txt".to_owned(),
    }];

    let err = run_invocation(&store, &WorkerEnv::default(), spec, false)
        .await
        .unwrap_err();
    assert!(err.contains("escapes the job root"), "{err}");
}

#[tokio::test]
async fn missing_executable_is_a_function_error() {
    let store = store();
    let err = run_invocation(
        &store,
        &WorkerEnv::default(),
        spec(&["/no/such/binary"]),
        false,
    )
    .await
    .unwrap_err();
    assert!(err.contains("error launching"), "{err}");
}

#[tokio::test]
async fn usage_reports_ceiled_millis_times_memory() {
    let store = store();
    let env = WorkerEnv {
        memory_mb: 1792,
        ..WorkerEnv::default()
    };

    let response = run_invocation(&store, &env, spec(&["true"]), false)
        .await
        .unwrap();
    let usage = response.usage.unwrap();
    assert!(usage.millis >= 1);
    assert_eq!(usage.mb_millis, usage.millis * 1792);
}

#[tokio::test]
async fn spans_ride_inline_when_the_spec_carries_a_trace() {
    let store = store();
    let mut spec = spec(&["true"]);
    spec.trace = Some(Propagation {
        trace_id: "00000000deadbeef".to_owned(),
        parent_span_id: "cafe0000cafe0000".to_owned(),
    });

    let response = run_invocation(&store, &WorkerEnv::default(), spec, false)
        .await
        .unwrap();
    assert_eq!(response.inline_spans.len(), 1);
    assert_eq!(response.inline_spans[0].trace_id, "00000000deadbeef");
    assert!(response.spans.is_none());
}
