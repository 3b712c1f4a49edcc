// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use protocol::{duration_nanos, FunctionUsage, Propagation, Span, WorkerTimings};
use store::{MappedFile, StoreUsage};

#[cfg(test)]
mod proto_tests;

///
/// The local procedure-call surface: one length-framed JSON request per call over the daemon's
/// stream socket, answered by one framed `Response`.
///
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum Request {
    Ping,
    Shutdown,
    InvokeWithFiles(InvokeWithFilesArgs),
    GetDaemonStats {
        #[serde(default)]
        reset: bool,
    },
    TraceSpans {
        spans: Vec<Span>,
    },
    PreloadPaths(PreloadArgs),
    GetCompilerIncludePath {
        compiler: String,
        language: String,
    },
}

#[derive(Debug, Serialize, Deserialize)]
pub enum Response {
    Pong {
        pid: u32,
    },
    ShuttingDown,
    Invoked(InvokeWithFilesReply),
    Stats(DaemonStatsSnapshot),
    SpansAccepted,
    Preloaded {
        uploaded: usize,
    },
    IncludePaths {
        paths: Vec<PathBuf>,
    },
    Error {
        message: String,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InvokeWithFilesArgs {
    /// The platform function to invoke.
    pub function: String,
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin: Option<Vec<u8>>,
    /// Input files to ship, each mapping local content to a remote logical path.
    #[serde(default)]
    pub files: Vec<MappedFile>,
    /// Declared outputs, each mapping a remote logical path back to an absolute local path.
    #[serde(default)]
    pub outputs: Vec<MappedFile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<Propagation>,
    #[serde(default)]
    pub return_logs: bool,
    /// Yield the local-CPU semaphore while blocked on the remote platform.
    #[serde(default)]
    pub drop_semaphore: bool,
}

///
/// The hot path's reply. A failed invocation is reported through `invoke_err`, never as a
/// transport-level error; a non-zero `exit_status` is an ordinary outcome.
///
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct InvokeWithFilesReply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoke_err: Option<String>,
    #[serde(default)]
    pub exit_status: i32,
    #[serde(default)]
    pub stdout: Vec<u8>,
    #[serde(default)]
    pub stderr: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timings: Option<InvokeTimings>,
}

///
/// Per-phase daemon-side timings, plus the worker's own self-reported ones.
///
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct InvokeTimings {
    #[serde(with = "duration_nanos")]
    pub upload: Duration,
    #[serde(with = "duration_nanos")]
    pub invoke: Duration,
    #[serde(with = "duration_nanos")]
    pub fetch: Duration,
    #[serde(with = "duration_nanos")]
    pub e2e: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<WorkerTimings>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PreloadArgs {
    #[serde(default)]
    pub paths: Vec<PathBuf>,
    #[serde(default)]
    pub trees: Vec<PreloadTree>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PreloadTree {
    pub root: PathBuf,
    pub regex: String,
}

///
/// A point-in-time copy of the daemon's counters.
///
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DaemonStatsSnapshot {
    pub pid: u32,
    pub invocations: u64,
    pub in_flight: u64,
    pub max_in_flight: u64,
    pub function_errors: u64,
    pub other_errors: u64,
    /// Exit status -> count of invocations which returned it.
    pub exit_statuses: std::collections::HashMap<i32, u64>,
    pub usage: FunctionUsage,
    pub store_usage: StoreUsage,
}
