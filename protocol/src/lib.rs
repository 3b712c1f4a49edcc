// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
// Enable all clippy lints except for many of the pedantic ones. It's a shame this needs to be copied and pasted across crates, but there doesn't appear to be a way to include inner attributes from a common source.
#![deny(
    clippy::all,
    clippy::default_trait_access,
    clippy::expl_impl_clone_on_copy,
    clippy::if_not_else,
    clippy::needless_continue,
    clippy::unseparated_literal_suffix,
    clippy::used_underscore_binding
)]
// It is often more clear to show that nothing is being moved.
#![allow(clippy::match_ref_pats)]
// Subjective style.
#![allow(
    clippy::len_without_is_empty,
    clippy::redundant_field_names,
    clippy::too_many_arguments
)]
// Default isn't as big a deal as people seem to think it is.
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]
// Arc<Mutex> can be more clear than needing to grok Orderings:
#![allow(clippy::mutex_atomic)]

//! The JSON wire format shared by the daemon and the remote worker.
//!
//! An `InvocationSpec` is serialised once per remote call and becomes the function payload; the
//! worker answers with an `InvocationResponse`. Key names are deliberately terse: a spec is
//! shipped for every compile, and inline blobs ride inside it.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use hashing::ObjectId;

pub mod span;

pub use span::{Propagation, Span};

#[cfg(test)]
mod wire_tests;

/// The default file mode for files which were stored without one.
pub const DEFAULT_FILE_MODE: u32 = 0o644;

///
/// A value representing bytes either inline in the payload or by reference to the object store.
///
/// Exactly one variant is ever set; the choice is fixed at creation time by the codec's size
/// rule. `Err` carries a per-file failure (for example an unreadable output) in place of
/// content, so that the other side can report it without failing the whole invocation.
///
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Blob {
    /// Valid UTF-8, small enough to travel inline.
    #[serde(rename = "s")]
    Inline(String),
    /// Arbitrary bytes, base64-encoded on the wire.
    #[serde(rename = "b", with = "base64_bytes")]
    InlineBytes(Vec<u8>),
    /// A reference to the object store.
    #[serde(rename = "r")]
    Ref(ObjectId),
    /// A per-entry error message.
    #[serde(rename = "e")]
    Err(String),
}

impl Blob {
    pub fn is_err(&self) -> bool {
        matches!(self, Blob::Err(_))
    }
}

mod base64_bytes {
    use base64::prelude::{Engine, BASE64_STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64_STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64_STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

///
/// A `Blob` plus the POSIX mode bits to materialise it with. Directories are never shipped: the
/// worker recreates directory structure from file paths. A zero mode is read as 0644.
///
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct File {
    #[serde(flatten)]
    pub blob: Blob,
    #[serde(rename = "m", default, skip_serializing_if = "mode_is_zero")]
    pub mode: u32,
}

impl File {
    ///
    /// The mode to materialise this file with: stored mode, or 0644 where none was recorded.
    ///
    pub fn effective_mode(&self) -> u32 {
        if self.mode == 0 {
            DEFAULT_FILE_MODE
        } else {
            self.mode
        }
    }
}

fn mode_is_zero(mode: &u32) -> bool {
    *mode == 0
}

///
/// A `File` bound to a logical path inside the worker's job root. The path is relative,
/// forward-slash separated, and may not escape the root.
///
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct FileAndPath {
    #[serde(flatten)]
    pub file: File,
    #[serde(rename = "p")]
    pub path: String,
}

///
/// One remote execution of a command with specified inputs and declared outputs.
///
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct InvocationSpec {
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin: Option<Blob>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FileAndPath>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<Propagation>,
}

///
/// The worker's answer to one `InvocationSpec`.
///
/// Every entry of `outputs` names a path that appeared in the request's `outputs` list; paths
/// which the command did not produce are omitted rather than errored.
///
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct InvocationResponse {
    pub status: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<Blob>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<Blob>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<FileAndPath>,
    /// Spans collected during the invocation, when few enough to ride inline.
    #[serde(
        rename = "inlinespans",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub inline_spans: Vec<Span>,
    /// A reference to a compressed span batch, when too many to ride inline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spans: Option<Blob>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<FunctionUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub times: Option<WorkerTimings>,
}

///
/// The worker's self-reported billing figures: wall milliseconds, rounded up the way the
/// platform rounds, and megabyte-milliseconds against its configured memory size.
///
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct FunctionUsage {
    pub millis: u64,
    pub mb_millis: u64,
}

///
/// Per-phase wall-clock timings measured inside the worker.
///
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct WorkerTimings {
    /// True for the first invocation served by a worker instance.
    pub cold_start: bool,
    #[serde(with = "duration_nanos")]
    pub fetch: Duration,
    #[serde(with = "duration_nanos")]
    pub exec: Duration,
    #[serde(with = "duration_nanos")]
    pub upload: Duration,
    #[serde(with = "duration_nanos")]
    pub e2e: Duration,
}

pub mod duration_nanos {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(d.as_nanos() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_nanos(u64::deserialize(deserializer)?))
    }
}

///
/// A free-form span field value: strings, numbers and bools only.
///
pub type FieldValue = serde_json::Value;

pub type Fields = HashMap<String, FieldValue>;
