// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::time::Instant;

use bytes::Bytes;

use protocol::{InvocationResponse, InvocationSpec, Span};
use store::{plan_fetch, upload_files, GetBatch, LocalSource};

use crate::proto::{InvokeTimings, InvokeWithFilesArgs, InvokeWithFilesReply};
use crate::server::Daemon;

#[cfg(test)]
mod invoke_tests;

///
/// The hot path: upload inputs, invoke the function, fetch outputs. Every failure is folded
/// into the reply's `invoke_err`; this function never fails the RPC itself.
///
pub async fn invoke_with_files(daemon: &Daemon, args: InvokeWithFilesArgs) -> InvokeWithFilesReply {
    let started = Instant::now();
    let _guard = daemon.stats.invocation_started();
    let mut span = daemon
        .traces
        .start_span("invoke_with_files", args.trace.as_ref());
    span.field("function", args.function.clone());
    span.field("args", args.args.len() as u64);

    // Remote work nests under this span, not directly under the caller's.
    let propagation = span.propagation();
    let reply = match run(daemon, &args, &propagation, started).await {
        Ok((reply, timings)) => {
            span.field("exit_status", reply.exit_status);
            if let Some(timings) = timings {
                span.field("upload_ms", timings.upload.as_millis() as u64);
                span.field("invoke_ms", timings.invoke.as_millis() as u64);
                span.field("fetch_ms", timings.fetch.as_millis() as u64);
                span.field("e2e_ms", timings.e2e.as_millis() as u64);
            }
            reply
        }
        Err(message) => {
            span.field("error", message.clone());
            InvokeWithFilesReply {
                invoke_err: Some(message),
                ..InvokeWithFilesReply::default()
            }
        }
    };
    span.finish();
    reply
}

fn validate(args: &InvokeWithFilesArgs) -> Result<(), String> {
    for file in &args.files {
        if let LocalSource::Path(path) = &file.local {
            if !path.is_absolute() {
                return Err(format!(
                    "input path {} must be absolute",
                    path.display()
                ));
            }
        }
    }
    for output in &args.outputs {
        match &output.local {
            LocalSource::Path(path) => {
                if path.as_os_str().is_empty() {
                    return Err(format!("output {:?} has an empty local path", output.remote));
                }
                if !path.is_absolute() {
                    return Err(format!(
                        "output path {} must be absolute",
                        path.display()
                    ));
                }
            }
            LocalSource::Bytes { .. } => {
                return Err(format!(
                    "output {:?} must map to a local path, not literal bytes",
                    output.remote
                ));
            }
        }
    }
    Ok(())
}

async fn run(
    daemon: &Daemon,
    args: &InvokeWithFilesArgs,
    propagation: &protocol::Propagation,
    started: Instant,
) -> Result<(InvokeWithFilesReply, Option<InvokeTimings>), String> {
    validate(args)?;

    let mut permit = Some(daemon.cpu_semaphore.acquire().await);

    // Upload phase.
    let upload_started = Instant::now();
    let spec = build_spec(daemon, args, propagation).await.map_err(|e| {
        daemon.stats.record_other_error();
        e
    })?;
    check_spec(&spec)?;
    let upload = upload_started.elapsed();

    // Invoke phase. A long-running call may yield its CPU permit while it blocks on the
    // platform.
    if args.drop_semaphore {
        if let Some(permit) = permit.take() {
            permit.release();
        }
    }
    let invoke_started = Instant::now();
    let payload = serde_json::to_vec(&spec).map_err(|e| format!("encoding spec: {e}"))?;
    let output = daemon
        .invoker
        .invoke(&args.function, Bytes::from(payload), args.return_logs)
        .await
        .map_err(|e| {
            daemon.stats.record_other_error();
            e
        })?;
    let invoke = invoke_started.elapsed();
    if permit.is_none() {
        permit = Some(daemon.cpu_semaphore.acquire().await);
    }

    if let Some(function_error) = output.function_error {
        daemon.stats.record_function_error();
        let detail = String::from_utf8_lossy(&output.payload).into_owned();
        return Ok((
            InvokeWithFilesReply {
                invoke_err: Some(format!("function error ({function_error}): {detail}")),
                logs: output.logs,
                ..InvokeWithFilesReply::default()
            },
            None,
        ));
    }

    let response: InvocationResponse =
        serde_json::from_slice(&output.payload).map_err(|e| {
            daemon.stats.record_other_error();
            format!("parsing invocation response: {e}")
        })?;

    if let Some(usage) = response.usage {
        daemon.stats.record_usage(usage);
    }
    daemon.stats.record_exit_status(response.status);

    // Fetch phase: one batched store call covers every output blob plus stdout and stderr.
    let fetch_started = Instant::now();
    let (stdout, stderr) = fetch_results(daemon, args, &response).await.map_err(|e| {
        daemon.stats.record_other_error();
        e
    })?;
    let fetch = fetch_started.elapsed();

    collect_worker_spans(daemon, &response).await;

    drop(permit);
    let timings = InvokeTimings {
        upload,
        invoke,
        fetch,
        e2e: started.elapsed(),
        remote: response.times,
    };
    Ok((
        InvokeWithFilesReply {
            invoke_err: None,
            exit_status: response.status,
            stdout: stdout.to_vec(),
            stderr: stderr.to_vec(),
            logs: output.logs,
            timings: Some(timings),
        },
        Some(timings),
    ))
}

async fn build_spec(
    daemon: &Daemon,
    args: &InvokeWithFilesArgs,
    propagation: &protocol::Propagation,
) -> Result<InvocationSpec, String> {
    let files = upload_files(&daemon.store, args.files.clone()).await?;

    let stdin = match &args.stdin {
        Some(bytes) => Some(
            daemon
                .store
                .store_blob(Bytes::from(bytes.clone()))
                .await
                .map_err(String::from)?,
        ),
        None => None,
    };

    Ok(InvocationSpec {
        args: args.args.clone(),
        stdin,
        files,
        outputs: args
            .outputs
            .iter()
            .map(|output| output.remote.clone())
            .collect(),
        trace: args.trace.as_ref().map(|_| propagation.clone()),
    })
}

async fn fetch_results(
    daemon: &Daemon,
    args: &InvokeWithFilesArgs,
    response: &InvocationResponse,
) -> Result<(Bytes, Bytes), String> {
    let mut batch = GetBatch::new();
    let stdout = response.stdout.as_ref().map(|blob| batch.append(blob));
    let stderr = response.stderr.as_ref().map(|blob| batch.append(blob));
    let plan = plan_fetch(&mut batch, &args.outputs, &response.outputs);

    let fetched = batch.fetch(&daemon.store).await;
    store::execute_fetch(&daemon.store, &fetched, plan).await?;

    let stdout = match stdout {
        Some(source) => fetched.resolve(source).map_err(|e| format!("fetching stdout: {e}"))?,
        None => Bytes::new(),
    };
    let stderr = match stderr {
        Some(source) => fetched.resolve(source).map_err(|e| format!("fetching stderr: {e}"))?,
        None => Bytes::new(),
    };
    Ok((stdout, stderr))
}

///
/// Unpack worker-collected spans into the daemon's collector: small batches ride inline in the
/// response, large ones arrive Snappy-compressed through the object store.
///
async fn collect_worker_spans(daemon: &Daemon, response: &InvocationResponse) {
    if !response.inline_spans.is_empty() {
        daemon.traces.submit_all(response.inline_spans.iter().cloned());
    }
    let Some(blob) = &response.spans else {
        return;
    };
    let mut batch = GetBatch::new();
    let source = batch.append(blob);
    let fetched = batch.fetch(&daemon.store).await;
    let spans: Result<Vec<Span>, String> = fetched
        .resolve(source)
        .and_then(|compressed| {
            snap::raw::Decoder::new()
                .decompress_vec(&compressed)
                .map_err(|e| format!("decompressing spans: {e}"))
        })
        .and_then(|encoded| {
            serde_json::from_slice(&encoded).map_err(|e| format!("parsing spans: {e}"))
        });
    match spans {
        Ok(spans) => daemon.traces.submit_all(spans),
        Err(e) => log::warn!("dropping undecodable span batch: {e}"),
    }
}

///
/// Spec invariant enforcement: declared outputs may not repeat, and each shipped file path is
/// unique.
///
fn check_spec(spec: &InvocationSpec) -> Result<(), String> {
    let mut seen = std::collections::HashSet::new();
    for output in &spec.outputs {
        if !seen.insert(output.as_str()) {
            return Err(format!("duplicate output {output:?}"));
        }
    }
    let mut seen = std::collections::HashSet::new();
    for file in &spec.files {
        if !seen.insert(file.path.as_str()) {
            return Err(format!("duplicate file {:?}", file.path));
        }
    }
    Ok(())
}
