// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use protocol::{Blob, File, FileAndPath, FunctionUsage, InvocationResponse, InvocationSpec, WorkerTimings};
use store::{BlobSource, GetBatch, Store};
use trace_store::TraceStore;

#[cfg(test)]
mod job_tests;

/// At most this many spans ride inline in a response; larger batches are compressed and
/// uploaded through the object store instead.
pub const MAX_INLINE_SPANS: usize = 100;

///
/// The pieces of the function platform's environment a job consults: the handler configured for
/// the function (if any) and the memory size used for usage self-reporting.
///
#[derive(Clone, Debug, Default)]
pub struct WorkerEnv {
    /// `_HANDLER`: when set, resolved against `task_root` as the executable, with the spec's
    /// args appended.
    pub handler: Option<String>,
    /// `LAMBDA_TASK_ROOT`.
    pub task_root: Option<PathBuf>,
    /// `AWS_LAMBDA_FUNCTION_MEMORY_SIZE`, in megabytes.
    pub memory_mb: u64,
}

impl WorkerEnv {
    pub fn from_env() -> WorkerEnv {
        WorkerEnv {
            handler: std::env::var("_HANDLER").ok().filter(|h| !h.is_empty()),
            task_root: std::env::var("LAMBDA_TASK_ROOT").ok().map(PathBuf::from),
            memory_mb: std::env::var("AWS_LAMBDA_FUNCTION_MEMORY_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
        }
    }
}

///
/// Run one invocation end to end: materialise, execute, upload. Never returns an error for a
/// failing command; the exit status is part of the response. Errors mean the job itself could
/// not be run and surface to the platform as a function error.
///
pub async fn run_invocation(
    store: &Store,
    env: &WorkerEnv,
    spec: InvocationSpec,
    cold_start: bool,
) -> Result<InvocationResponse, String> {
    let started = Instant::now();
    let traces = TraceStore::new();
    let root_span = spec
        .trace
        .as_ref()
        .map(|propagation| traces.start_span("worker_invocation", Some(propagation)));

    let fetch_started = Instant::now();
    let job = parse_job(store, env, &spec).await?;
    let fetch = fetch_started.elapsed();

    let exec_started = Instant::now();
    let (status, stdout, stderr) = execute(&job).await?;
    let exec = exec_started.elapsed();

    let upload_started = Instant::now();
    let stdout = store.store_blob(stdout).await.map_err(String::from)?;
    let stderr = store.store_blob(stderr).await.map_err(String::from)?;
    let outputs = collect_outputs(store, job.root.path(), &spec.outputs).await?;
    let upload = upload_started.elapsed();

    if let Some(mut span) = root_span {
        span.field("status", status);
        span.field("outputs", spec.outputs.len() as u64);
        span.finish();
    }
    let (inline_spans, spans) = pack_spans(store, &traces).await?;

    let e2e = started.elapsed();
    let millis = e2e.as_millis() as u64 + u64::from(e2e.subsec_nanos() % 1_000_000 != 0);
    Ok(InvocationResponse {
        status,
        stdout: Some(stdout),
        stderr: Some(stderr),
        outputs,
        inline_spans,
        spans,
        usage: Some(FunctionUsage {
            millis,
            mb_millis: millis * env.memory_mb,
        }),
        times: Some(WorkerTimings {
            cold_start,
            fetch,
            exec,
            upload,
            e2e,
        }),
    })
}

struct Job {
    root: tempfile::TempDir,
    argv: Vec<String>,
    stdin: Bytes,
}

///
/// Reject paths which would escape the job root.
///
fn rooted(root: &Path, path: &str) -> Result<PathBuf, String> {
    let relative = Path::new(path);
    if relative.is_absolute()
        || relative
            .components()
            .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(format!("path {path:?} escapes the job root"));
    }
    Ok(root.join(relative))
}

///
/// Create a fresh job root and materialise the spec into it: all input files and stdin come
/// down in one batched store read, files are written with their declared modes, and parent
/// directories for every declared output are pre-created.
///
async fn parse_job(store: &Store, env: &WorkerEnv, spec: &InvocationSpec) -> Result<Job, String> {
    let root = tempfile::Builder::new()
        .prefix("llama-job-")
        .tempdir()
        .map_err(|e| format!("failed to create job root: {e:?}"))?;

    let argv = match &env.handler {
        Some(handler) => {
            let task_root = env.task_root.clone().unwrap_or_else(|| PathBuf::from("."));
            let mut argv = vec![task_root.join(handler).to_string_lossy().into_owned()];
            argv.extend(spec.args.iter().cloned());
            argv
        }
        None => spec.args.clone(),
    };
    if argv.is_empty() {
        return Err("invocation has no argv".to_owned());
    }

    let mut batch = GetBatch::new();
    let mut writes: Vec<(PathBuf, u32, BlobSource)> = Vec::new();
    for entry in &spec.files {
        let target = rooted(root.path(), &entry.path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| format!("mkdir {}: {e}", parent.display()))?;
        }
        let source = batch.append(&entry.file.blob);
        writes.push((target, entry.file.effective_mode(), source));
    }
    let stdin_source = spec.stdin.as_ref().map(|blob| batch.append(blob));

    let fetched = batch.fetch(store).await;

    for (target, mode, source) in writes {
        let bytes = fetched
            .resolve(source)
            .map_err(|e| format!("fetching input {}: {e}", target.display()))?;
        write_file(&target, mode, &bytes).await?;
    }
    let stdin = match stdin_source {
        Some(source) => fetched.resolve(source).map_err(|e| format!("fetching stdin: {e}"))?,
        None => Bytes::new(),
    };

    for output in &spec.outputs {
        let target = rooted(root.path(), output)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| format!("mkdir {}: {e}", parent.display()))?;
        }
    }

    Ok(Job { root, argv, stdin })
}

async fn write_file(path: &Path, mode: u32, bytes: &[u8]) -> Result<(), String> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true).mode(mode);
    let mut file = options
        .open(path)
        .await
        .map_err(|e| format!("creating {}: {e}", path.display()))?;
    file.write_all(bytes)
        .await
        .map_err(|e| format!("writing {}: {e}", path.display()))?;
    Ok(())
}

///
/// Run the resolved argv with the job root as its working directory, piping the materialised
/// stdin in and capturing stdout/stderr in memory.
///
async fn execute(job: &Job) -> Result<(i32, Bytes, Bytes), String> {
    let mut command = Command::new(&job.argv[0]);
    command
        .args(&job.argv[1..])
        .current_dir(job.root.path())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command
        .spawn()
        .map_err(|e| format!("error launching {:?}: {e}", job.argv[0]))?;

    let mut stdin_pipe = child.stdin.take().expect("stdin was requested piped");
    let stdin = job.stdin.clone();
    let stdin_writer = tokio::spawn(async move {
        // The child may exit without draining stdin; a broken pipe here is not an error.
        let _ = stdin_pipe.write_all(&stdin).await;
        let _ = stdin_pipe.shutdown().await;
    });

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| format!("error waiting for {:?}: {e}", job.argv[0]))?;
    let _ = stdin_writer.await;

    let status = output.status.code().unwrap_or_else(|| {
        use std::os::unix::process::ExitStatusExt;
        output.status.signal().map(|s| -s).unwrap_or(-1)
    });
    Ok((
        status,
        Bytes::from(output.stdout),
        Bytes::from(output.stderr),
    ))
}

///
/// Read back the declared outputs. A missing output is omitted; an unreadable one is encoded as
/// an error blob so the caller can report it per-file.
///
async fn collect_outputs(
    store: &Store,
    root: &Path,
    outputs: &[String],
) -> Result<Vec<FileAndPath>, String> {
    let mut collected = Vec::new();
    for output in outputs {
        let path = rooted(root, output)?;
        let metadata = match tokio::fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => {
                collected.push(error_output(output, format!("stat {output}: {e}")));
                continue;
            }
        };
        let (blob, mode) = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                use std::os::unix::fs::PermissionsExt;
                let mode = metadata.permissions().mode() & 0o777;
                (
                    store
                        .store_blob(Bytes::from(bytes))
                        .await
                        .map_err(String::from)?,
                    mode,
                )
            }
            Err(e) => (Blob::Err(format!("read {output}: {e}")), 0),
        };
        collected.push(FileAndPath {
            file: File { blob, mode },
            path: output.clone(),
        });
    }
    Ok(collected)
}

fn error_output(path: &str, message: String) -> FileAndPath {
    FileAndPath {
        file: File {
            blob: Blob::Err(message),
            mode: 0,
        },
        path: path.to_owned(),
    }
}

///
/// Spans collected during the invocation ride inline when few, else Snappy-compressed through
/// the object store.
///
async fn pack_spans(
    store: &Store,
    traces: &TraceStore,
) -> Result<(Vec<protocol::Span>, Option<Blob>), String> {
    let spans = traces.take_spans();
    if spans.is_empty() {
        return Ok((Vec::new(), None));
    }
    if spans.len() <= MAX_INLINE_SPANS {
        return Ok((spans, None));
    }
    let encoded = serde_json::to_vec(&spans).map_err(|e| format!("encoding spans: {e}"))?;
    let compressed = snap::raw::Encoder::new()
        .compress_vec(&encoded)
        .map_err(|e| format!("compressing spans: {e}"))?;
    let blob = store
        .store_blob(Bytes::from(compressed))
        .await
        .map_err(String::from)?;
    Ok((Vec::new(), Some(blob)))
}
