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

//! The content-addressed object store façade.
//!
//! Every file, stdin, stdout and output blob the system moves traverses a `Store`: writes are
//! deduplicated in-process and optionally probed for existence before upload, reads are batched
//! over a bounded worker pool, integrity-checked against their id, and served read-through from
//! a size-bounded compressed disk cache when one is configured.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};

use hashing::ObjectId;
use remote_provider::ByteStoreProvider;
pub use remote_provider::{Provider, RemoteStoreOptions, StoreError};
use task_executor::Executor;

mod blob;
mod cache;
mod dedup;
mod files;

pub use blob::{BlobSource, FetchedBlobs, GetBatch, MAX_INLINE};
pub use cache::DiskCache;
use dedup::{Reservation, WriteDedup};
pub use files::{
    execute_fetch, fetch_files, local_path_for, plan_fetch, remote_path_for, upload_files,
    FetchPlan, LocalSource, MappedFile, FILE_MOVE_CONCURRENCY,
};


/// How many object gets run concurrently within one batch.
const GET_CONCURRENCY: usize = 16;

///
/// Cumulative data-plane counters, surfaced through the daemon's stats.
///
#[derive(Default)]
struct UsageCounters {
    bytes_uploaded: AtomicU64,
    bytes_downloaded: AtomicU64,
    write_requests: AtomicU64,
    read_requests: AtomicU64,
}

///
/// A snapshot of `UsageCounters`.
///
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct StoreUsage {
    pub bytes_uploaded: u64,
    pub bytes_downloaded: u64,
    pub write_requests: u64,
    pub read_requests: u64,
}

#[derive(Clone)]
pub struct Store {
    provider: Arc<dyn ByteStoreProvider>,
    disk_cache: Option<Arc<DiskCache>>,
    dedup: WriteDedup,
    counters: Arc<UsageCounters>,
    executor: Executor,
    head_check: bool,
}

impl Store {
    pub fn new(executor: Executor, provider: Arc<dyn ByteStoreProvider>) -> Store {
        Store {
            provider,
            disk_cache: None,
            dedup: WriteDedup::new(),
            counters: Arc::new(UsageCounters::default()),
            executor,
            head_check: true,
        }
    }

    ///
    /// Interpose a read-through disk cache in front of the provider.
    ///
    pub fn with_disk_cache(self, disk_cache: DiskCache) -> Store {
        Store {
            disk_cache: Some(Arc::new(disk_cache)),
            ..self
        }
    }

    ///
    /// Disable the existence probe before uploads, trading round-trips for bandwidth.
    ///
    pub fn without_head_check(self) -> Store {
        Store {
            head_check: false,
            ..self
        }
    }

    ///
    /// An in-memory store for deterministic tests.
    ///
    pub fn memory_for_testing(executor: Executor) -> Store {
        let provider = Provider::memory().expect("memory provider init cannot fail");
        Store::new(executor, Arc::new(provider))
    }

    ///
    /// Store `bytes`, returning the id that addresses them.
    ///
    /// Concurrent callers storing the same bytes coalesce on one upload: whoever reserves the id
    /// first performs the write while the rest wait for its completion. An id is only ever
    /// recorded as stored after the provider acknowledged the write; a failed upload rolls the
    /// reservation back so that a later attempt can proceed.
    ///
    pub async fn store_bytes(&self, bytes: Bytes) -> Result<ObjectId, StoreError> {
        let id = ObjectId::of_bytes(&bytes);

        let token = match self.dedup.reserve(id).await {
            Reservation::AlreadyStored => return Ok(id),
            Reservation::Upload(token) => token,
        };

        if self.head_check {
            self.counters.read_requests.fetch_add(1, Ordering::Relaxed);
            match self.provider.exists(id).await {
                Ok(true) => {
                    token.complete();
                    return Ok(id);
                }
                Ok(false) => {}
                // A failed probe is not fatal: fall through to the write.
                Err(e) => log::debug!("existence probe for {id} failed: {e}"),
            }
        }

        let len = bytes.len() as u64;
        self.provider.store_bytes(id, bytes).await?;
        self.counters.write_requests.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_uploaded
            .fetch_add(len, Ordering::Relaxed);
        token.complete();
        Ok(id)
    }

    ///
    /// Load one object. See `get_batch` for the semantics.
    ///
    pub async fn get(&self, id: ObjectId) -> Result<Bytes, StoreError> {
        self.get_batch(&[id])
            .await
            .pop()
            .expect("one result per request")
    }

    ///
    /// Load a batch of objects concurrently. The result is positional: slot `i` answers request
    /// slot `i`. Cache hits are served locally; misses are fetched from the provider over a
    /// bounded pool, verified against their id, and populate the cache.
    ///
    pub async fn get_batch(&self, ids: &[ObjectId]) -> Vec<Result<Bytes, StoreError>> {
        // Split into cache hits and misses, preserving request positions.
        let mut results: Vec<Option<Result<Bytes, StoreError>>> = vec![None; ids.len()];
        let mut misses: Vec<(usize, ObjectId)> = Vec::with_capacity(ids.len());

        if let Some(disk_cache) = &self.disk_cache {
            for (i, &id) in ids.iter().enumerate() {
                let disk_cache = disk_cache.clone();
                let cached = self
                    .executor
                    .spawn_blocking(move || disk_cache.get(id), |e| {
                        log::warn!("disk cache read panicked: {e}");
                        None
                    })
                    .await;
                match cached {
                    Some(bytes) => results[i] = Some(Ok(bytes)),
                    None => misses.push((i, id)),
                }
            }
        } else {
            misses.extend(ids.iter().copied().enumerate());
        }

        let fetched: Vec<(usize, Result<Bytes, StoreError>)> = stream::iter(misses)
            .map(|(i, id)| async move { (i, self.load_and_verify(id).await) })
            .buffer_unordered(GET_CONCURRENCY)
            .collect()
            .await;

        // Zip the two result streams back into the caller's order.
        for (i, result) in fetched {
            if let (Some(disk_cache), Ok(bytes)) = (&self.disk_cache, &result) {
                let disk_cache = disk_cache.clone();
                let id = ids[i];
                let bytes = bytes.clone();
                self.executor
                    .spawn_blocking(move || disk_cache.put(id, &bytes), |e| {
                        log::warn!("disk cache write panicked: {e}");
                    })
                    .await;
            }
            results[i] = Some(result);
        }

        results
            .into_iter()
            .map(|slot| slot.expect("every request slot is filled"))
            .collect()
    }

    async fn load_and_verify(&self, id: ObjectId) -> Result<Bytes, StoreError> {
        self.counters.read_requests.fetch_add(1, Ordering::Relaxed);
        let bytes = self
            .provider
            .load_bytes(id)
            .await?
            .ok_or(StoreError::NotFound(id))?;
        if !id.matches(&bytes) {
            return Err(StoreError::Integrity(id));
        }
        self.counters
            .bytes_downloaded
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        Ok(bytes)
    }

    ///
    /// A snapshot of the cumulative data-plane counters.
    ///
    pub fn usage(&self) -> StoreUsage {
        StoreUsage {
            bytes_uploaded: self.counters.bytes_uploaded.load(Ordering::Relaxed),
            bytes_downloaded: self.counters.bytes_downloaded.load(Ordering::Relaxed),
            write_requests: self.counters.write_requests.load(Ordering::Relaxed),
            read_requests: self.counters.read_requests.load(Ordering::Relaxed),
        }
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }
}

///
/// Build a provider for an object-store URL: `s3://bucket/prefix/`, `file:///path` for a
/// directory-backed store, or `memory://` for tests.
///
pub fn provider_from_url(url: &str, region: Option<&str>) -> Result<Provider, String> {
    if let Some(rest) = url.strip_prefix("s3://") {
        let (bucket, prefix) = match rest.split_once('/') {
            Some((bucket, prefix)) => (bucket, prefix),
            None => (rest, ""),
        };
        if bucket.is_empty() {
            return Err(format!("object store url {url:?} has no bucket"));
        }
        let region = region.ok_or_else(|| {
            format!("an AWS region is required for the s3 object store {url:?}")
        })?;
        return Provider::s3(bucket, prefix, region, RemoteStoreOptions::default());
    }
    if let Some(path) = url.strip_prefix("file://") {
        return Provider::fs(path, RemoteStoreOptions::default());
    }
    if url.strip_prefix("memory://").is_some() {
        return Provider::memory();
    }
    Err(format!("unsupported object store url {url:?}"))
}
