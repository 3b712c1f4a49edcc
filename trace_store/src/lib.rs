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

//! An in-memory span collector.
//!
//! Producers build an `ActiveSpan` (propagating a parent where one exists), attach fields, and
//! finish it; finished spans travel over a buffered channel so that submission never blocks the
//! hot path. The daemon owns the long-lived collector and drains it on demand; each worker owns
//! a short-lived one per invocation whose drained spans ride home in the response.
//!
//! The current span is threaded as an explicit value (`Propagation`), not thread-local state.

use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use protocol::{FieldValue, Fields, Propagation, Span};


///
/// A random 64-bit id rendered as 16 hex characters, the shape shared by trace and span ids.
///
pub fn new_id() -> String {
    format!("{:016x}", rand::thread_rng().gen::<u64>())
}

#[derive(Clone)]
pub struct TraceStore {
    sender: UnboundedSender<Span>,
    receiver: Arc<Mutex<UnboundedReceiver<Span>>>,
}

impl TraceStore {
    pub fn new() -> TraceStore {
        let (sender, receiver) = mpsc::unbounded_channel();
        TraceStore {
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
        }
    }

    ///
    /// Begin a span. With a parent, the span joins the parent's trace; without one it roots a
    /// new trace.
    ///
    pub fn start_span(&self, name: &str, parent: Option<&Propagation>) -> ActiveSpan {
        let (trace_id, parent_id) = match parent {
            Some(propagation) => (
                propagation.trace_id.clone(),
                Some(propagation.parent_span_id.clone()),
            ),
            None => (new_id(), None),
        };
        ActiveSpan {
            store: self.clone(),
            trace_id,
            span_id: new_id(),
            parent_id,
            name: name.to_owned(),
            start: SystemTime::now(),
            started: Instant::now(),
            fields: Fields::new(),
        }
    }

    ///
    /// Accept an already-completed span, e.g. one shipped from another process.
    ///
    pub fn submit(&self, span: Span) {
        // The receiver lives as long as the store, so the only send failure is shutdown.
        let _ = self.sender.send(span);
    }

    pub fn submit_all(&self, spans: impl IntoIterator<Item = Span>) {
        for span in spans {
            self.submit(span);
        }
    }

    ///
    /// Drain every span submitted so far. Spans drained once are gone.
    ///
    pub fn take_spans(&self) -> Vec<Span> {
        let mut receiver = self.receiver.lock();
        let mut spans = Vec::new();
        while let Ok(span) = receiver.try_recv() {
            spans.push(span);
        }
        spans
    }
}

///
/// A span that is still running. Finishing it computes the duration and submits it to the
/// store; dropping it without finishing discards it.
///
#[must_use]
pub struct ActiveSpan {
    store: TraceStore,
    trace_id: String,
    span_id: String,
    parent_id: Option<String>,
    name: String,
    start: SystemTime,
    started: Instant,
    fields: Fields,
}

impl ActiveSpan {
    ///
    /// The propagation to hand to work started under this span.
    ///
    pub fn propagation(&self) -> Propagation {
        Propagation {
            trace_id: self.trace_id.clone(),
            parent_span_id: self.span_id.clone(),
        }
    }

    pub fn field(&mut self, key: &str, value: impl Into<FieldValue>) {
        self.fields.insert(key.to_owned(), value.into());
    }

    pub fn finish(self) {
        let duration = self.started.elapsed();
        let start = self
            .start
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        self.store.submit(Span {
            trace_id: self.trace_id,
            span_id: self.span_id,
            parent_id: self.parent_id,
            name: self.name,
            start,
            duration,
            fields: self.fields,
        });
    }
}
