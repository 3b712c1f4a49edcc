// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tempfile::TempDir;

use store::{MappedFile, Store};
use task_executor::Executor;
use worker::WorkerEnv;

use crate::invoke::invoke_with_files;
use crate::invoker::{FunctionInvoker, InvokeOutput};
use crate::proto::InvokeWithFilesArgs;
use crate::server::Daemon;

///
/// An in-process stand-in for the function platform: runs the worker loop body directly
/// against the same store the daemon uses.
///
struct StubPlatform {
    store: Store,
}

#[async_trait]
impl FunctionInvoker for StubPlatform {
    async fn invoke(
        &self,
        _function: &str,
        payload: Bytes,
        tail_logs: bool,
    ) -> Result<InvokeOutput, String> {
        let spec = serde_json::from_slice(&payload).map_err(|e| e.to_string())?;
        match worker::run_invocation(&self.store, &WorkerEnv::default(), spec, false).await {
            Ok(response) => Ok(InvokeOutput {
                payload: Bytes::from(serde_json::to_vec(&response).unwrap()),
                function_error: None,
                logs: tail_logs.then(|| b"END RequestId: stub".to_vec()),
            }),
            Err(message) => Ok(InvokeOutput {
                payload: Bytes::from(serde_json::to_vec(&serde_json::json!({
                    "errorMessage": message,
                }))
                .unwrap()),
                function_error: Some("Unhandled".to_owned()),
                logs: None,
            }),
        }
    }
}

fn daemon() -> Arc<Daemon> {
    let store = Store::memory_for_testing(Executor::new());
    let invoker = Arc::new(StubPlatform {
        store: store.clone(),
    });
    Arc::new(Daemon::new(store, invoker))
}

fn invoke_args(args: &[&str]) -> InvokeWithFilesArgs {
    InvokeWithFilesArgs {
        function: "llama-runtime".to_owned(),
        args: args.iter().map(|s| s.to_string()).collect(),
        stdin: None,
        files: vec![],
        outputs: vec![],
        trace: None,
        return_logs: false,
        drop_semaphore: false,
    }
}

#[tokio::test]
async fn echo_through_the_whole_stack() {
    let daemon = daemon();
    let reply = invoke_with_files(&daemon, invoke_args(&["echo", "hello"])).await;

    assert_eq!(reply.invoke_err, None);
    assert_eq!(reply.exit_status, 0);
    assert_eq!(reply.stdout, b"hello\n".to_vec());
    assert_eq!(reply.stderr, Vec::<u8>::new());

    let stats = daemon.stats.snapshot(false);
    assert_eq!(stats.invocations, 1);
    assert_eq!(stats.in_flight, 0);
    assert_eq!(stats.exit_statuses[&0], 1);
    assert_eq!(stats.function_errors, 0);
}

#[tokio::test]
async fn files_round_trip_to_local_disk() {
    let daemon = daemon();
    let dir = TempDir::new().unwrap();
    let out = dir.path().join("b.txt");

    let mut args = invoke_args(&[
        "/bin/sh",
        "-c",
        "cat in/a.txt > b.txt; echo World >> b.txt",
    ]);
    args.files = vec![MappedFile::from_bytes(
        b"Hello, A\n".to_vec(),
        0o644,
        "in/a.txt",
    )];
    args.outputs = vec![
        MappedFile::from_path(&out, "b.txt"),
        MappedFile::from_path(dir.path().join("c.txt"), "c.txt"),
    ];

    let reply = invoke_with_files(&daemon, args).await;
    assert_eq!(reply.invoke_err, None);
    assert_eq!(reply.exit_status, 0);

    assert_eq!(
        std::fs::read_to_string(&out).unwrap(),
        "Hello, A\nWorld\n"
    );
    // Requested but not produced: silently absent locally too.
    assert!(!dir.path().join("c.txt").exists());
}

#[tokio::test]
async fn stdin_rides_the_spec() {
    let daemon = daemon();
    let mut args = invoke_args(&["cat"]);
    args.stdin = Some(b"ferried\n".to_vec());

    let reply = invoke_with_files(&daemon, args).await;
    assert_eq!(reply.invoke_err, None);
    assert_eq!(reply.stdout, b"ferried\n".to_vec());
}

#[tokio::test]
async fn relative_paths_are_a_validation_error() {
    let daemon = daemon();
    let mut args = invoke_args(&["true"]);
    args.files = vec![MappedFile::from_path("relative/input.c", "input.c")];

    let reply = invoke_with_files(&daemon, args).await;
    let err = reply.invoke_err.unwrap();
    assert!(err.contains("must be absolute"), "{err}");
}

#[tokio::test]
async fn outputs_mapped_to_bytes_are_rejected() {
    let daemon = daemon();
    let mut args = invoke_args(&["true"]);
    args.outputs = vec![MappedFile::from_bytes(vec![], 0, "out.txt")];

    let reply = invoke_with_files(&daemon, args).await;
    assert!(reply.invoke_err.is_some());
}

#[tokio::test]
async fn worker_failures_count_as_function_errors() {
    let daemon = daemon();
    let reply = invoke_with_files(&daemon, invoke_args(&["/no/such/binary"])).await;

    let err = reply.invoke_err.unwrap();
    assert!(err.contains("function error"), "{err}");
    let stats = daemon.stats.snapshot(false);
    assert_eq!(stats.function_errors, 1);
    assert_eq!(stats.other_errors, 0);
}

#[tokio::test]
async fn nonzero_exits_are_counted_not_errored() {
    let daemon = daemon();
    let reply = invoke_with_files(&daemon, invoke_args(&["/bin/sh", "-c", "exit 3"])).await;

    assert_eq!(reply.invoke_err, None);
    assert_eq!(reply.exit_status, 3);
    let stats = daemon.stats.snapshot(false);
    assert_eq!(stats.exit_statuses[&3], 1);
    assert_eq!(stats.function_errors, 0);
    assert_eq!(stats.other_errors, 0);
}

#[tokio::test]
async fn phase_timings_sum_within_the_end_to_end_time() {
    let daemon = daemon();
    let reply = invoke_with_files(&daemon, invoke_args(&["echo", "timed"])).await;

    let timings = reply.timings.unwrap();
    assert!(timings.upload + timings.invoke + timings.fetch <= timings.e2e);
    assert!(timings.remote.is_some());
}

#[tokio::test]
async fn tail_logs_are_returned_when_requested() {
    let daemon = daemon();
    let mut args = invoke_args(&["true"]);
    args.return_logs = true;

    let reply = invoke_with_files(&daemon, args).await;
    assert_eq!(reply.logs.unwrap(), b"END RequestId: stub".to_vec());
}

#[tokio::test]
async fn usage_accumulates_across_invocations() {
    let daemon = daemon();
    invoke_with_files(&daemon, invoke_args(&["true"])).await;
    invoke_with_files(&daemon, invoke_args(&["true"])).await;

    let stats = daemon.stats.snapshot(false);
    assert!(stats.usage.millis >= 2);
    assert!(stats.store_usage.write_requests == 0);
}

#[tokio::test]
async fn traces_propagate_and_collect_worker_spans() {
    let daemon = daemon();
    let mut args = invoke_args(&["true"]);
    args.trace = Some(protocol::Propagation {
        trace_id: "1111222233334444".to_owned(),
        parent_span_id: "aaaabbbbccccdddd".to_owned(),
    });

    let reply = invoke_with_files(&daemon, args).await;
    assert_eq!(reply.invoke_err, None);

    let spans = daemon.traces.take_spans();
    // The worker's span plus the daemon's own, all stitched to the caller's trace.
    assert!(spans.len() >= 2);
    assert!(spans.iter().all(|span| span.trace_id == "1111222233334444"));
    assert!(spans.iter().any(|span| span.name == "invoke_with_files"));
    assert!(spans.iter().any(|span| span.name == "worker_invocation"));
}
