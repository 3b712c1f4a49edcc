// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::{duration_nanos, Fields};

///
/// The minimal pair carried across process boundaries to stitch traces together: the trace the
/// caller is part of, and the span that should become the parent of whatever the callee starts.
///
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Propagation {
    pub trace_id: String,
    pub parent_span_id: String,
}

///
/// One completed unit of traced work. Span ids are random 64-bit values rendered as hex, unique
/// within their trace.
///
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Span {
    pub trace_id: String,
    pub span_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub name: String,
    /// Nanoseconds since the unix epoch.
    pub start: u64,
    #[serde(with = "duration_nanos")]
    pub duration: Duration,
    #[serde(default, skip_serializing_if = "Fields::is_empty")]
    pub fields: Fields,
}

impl Span {
    pub fn start_time(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_nanos(self.start)
    }

    pub fn propagation(&self) -> Propagation {
        Propagation {
            trace_id: self.trace_id.clone(),
            parent_span_id: self.span_id.clone(),
        }
    }
}
