// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use protocol::FunctionUsage;

use crate::proto::DaemonStatsSnapshot;


///
/// Work-in-flight accounting for the daemon. Counters are monotonic between explicit resets and
/// updated with atomics; `max_in_flight` trails `in_flight` via a CAS loop so that
/// `max_in_flight >= in_flight` holds at every sampled instant.
///
#[derive(Default)]
pub struct DaemonStats {
    invocations: AtomicU64,
    in_flight: AtomicU64,
    max_in_flight: AtomicU64,
    function_errors: AtomicU64,
    other_errors: AtomicU64,
    usage_millis: AtomicU64,
    usage_mb_millis: AtomicU64,
    exit_statuses: Mutex<HashMap<i32, u64>>,
}

impl DaemonStats {
    pub fn new() -> DaemonStats {
        DaemonStats::default()
    }

    ///
    /// Record the start of an invocation. The returned guard decrements `in_flight` when the
    /// invocation completes, however it completes.
    ///
    pub fn invocation_started(&self) -> InFlightGuard<'_> {
        self.invocations.fetch_add(1, Ordering::Relaxed);
        let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let mut max = self.max_in_flight.load(Ordering::SeqCst);
        while now_in_flight > max {
            match self.max_in_flight.compare_exchange_weak(
                max,
                now_in_flight,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(observed) => max = observed,
            }
        }
        InFlightGuard { stats: self }
    }

    pub fn record_exit_status(&self, status: i32) {
        *self.exit_statuses.lock().entry(status).or_insert(0) += 1;
    }

    pub fn record_function_error(&self) {
        self.function_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_other_error(&self) {
        self.other_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_usage(&self, usage: FunctionUsage) {
        self.usage_millis.fetch_add(usage.millis, Ordering::Relaxed);
        self.usage_mb_millis
            .fetch_add(usage.mb_millis, Ordering::Relaxed);
    }

    ///
    /// Snapshot the counters, optionally zeroing them. `in_flight` is never reset: it tracks
    /// live work.
    ///
    pub fn snapshot(&self, reset: bool) -> DaemonStatsSnapshot {
        let snapshot = DaemonStatsSnapshot {
            pid: std::process::id(),
            invocations: self.invocations.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::SeqCst),
            max_in_flight: self.max_in_flight.load(Ordering::SeqCst),
            function_errors: self.function_errors.load(Ordering::Relaxed),
            other_errors: self.other_errors.load(Ordering::Relaxed),
            exit_statuses: self.exit_statuses.lock().clone(),
            usage: FunctionUsage {
                millis: self.usage_millis.load(Ordering::Relaxed),
                mb_millis: self.usage_mb_millis.load(Ordering::Relaxed),
            },
            store_usage: store::StoreUsage::default(),
        };
        if reset {
            self.invocations.store(0, Ordering::Relaxed);
            self.max_in_flight
                .store(self.in_flight.load(Ordering::SeqCst), Ordering::SeqCst);
            self.function_errors.store(0, Ordering::Relaxed);
            self.other_errors.store(0, Ordering::Relaxed);
            self.usage_millis.store(0, Ordering::Relaxed);
            self.usage_mb_millis.store(0, Ordering::Relaxed);
            self.exit_statuses.lock().clear();
        }
        snapshot
    }
}

#[must_use]
pub struct InFlightGuard<'a> {
    stats: &'a DaemonStats,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.stats.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}
