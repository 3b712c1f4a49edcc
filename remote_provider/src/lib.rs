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

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use opendal::layers::{ConcurrentLimitLayer, RetryLayer, TimeoutLayer};
use opendal::{Builder, Operator};

use hashing::{ObjectId, EMPTY_OBJECT_ID};


///
/// Errors a store operation can surface. `NotFound` and `Integrity` are per-object and fatal
/// only to the request that hit them; `Network` and `Auth` describe the connection to the
/// backing service.
///
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum StoreError {
    /// The id is not present in the store.
    NotFound(ObjectId),
    /// The store returned bytes which do not hash to the requested id.
    Integrity(ObjectId),
    Network(String),
    Auth(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::NotFound(id) => write!(f, "object {id} not found"),
            StoreError::Integrity(id) => {
                write!(f, "store returned wrong bytes for object {id}")
            }
            StoreError::Network(msg) => write!(f, "network error: {msg}"),
            StoreError::Auth(msg) => write!(f, "authorization error: {msg}"),
        }
    }
}

impl From<StoreError> for String {
    fn from(err: StoreError) -> String {
        err.to_string()
    }
}

fn classify(context: &str, e: opendal::Error) -> StoreError {
    match e.kind() {
        opendal::ErrorKind::PermissionDenied => StoreError::Auth(format!("{context}: {e}")),
        _ => StoreError::Network(format!("{context}: {e}")),
    }
}

///
/// Tuning shared by every provider.
///
#[derive(Clone, Debug)]
pub struct RemoteStoreOptions {
    pub concurrency_limit: usize,
    pub timeout: Duration,
    pub retries: usize,
}

impl Default for RemoteStoreOptions {
    fn default() -> RemoteStoreOptions {
        RemoteStoreOptions {
            concurrency_limit: 32,
            timeout: Duration::from_secs(30),
            retries: 2,
        }
    }
}

///
/// The raw byte-addressed backend: one object per id under a key prefix. Content addressing
/// makes every operation idempotent, so providers treat "already exists" on write as success.
///
#[async_trait]
pub trait ByteStoreProvider: Send + Sync {
    async fn store_bytes(&self, id: ObjectId, bytes: Bytes) -> Result<(), StoreError>;

    async fn load_bytes(&self, id: ObjectId) -> Result<Option<Bytes>, StoreError>;

    /// An existence probe (HEAD), used to skip writes of objects known to be present.
    async fn exists(&self, id: ObjectId) -> Result<bool, StoreError>;
}

#[derive(Debug)]
pub struct Provider {
    operator: Operator,
    key_prefix: String,
}

impl Provider {
    pub fn new<B: Builder>(
        builder: B,
        key_prefix: String,
        options: RemoteStoreOptions,
    ) -> Result<Provider, String> {
        let operator = Operator::new(builder)
            .map_err(|e| {
                format!(
                    "failed to initialise {} object store provider: {e}",
                    B::SCHEME
                )
            })?
            .layer(ConcurrentLimitLayer::new(options.concurrency_limit))
            .layer(TimeoutLayer::new().with_timeout(options.timeout))
            .layer(RetryLayer::new().with_max_times(options.retries + 1))
            .finish();

        Ok(Provider {
            operator,
            key_prefix,
        })
    }

    ///
    /// A provider for an `s3://bucket/prefix/` URL: one object per id at `{prefix}{id}`.
    ///
    pub fn s3(
        bucket: &str,
        key_prefix: &str,
        region: &str,
        options: RemoteStoreOptions,
    ) -> Result<Provider, String> {
        let builder = opendal::services::S3::default()
            .bucket(bucket)
            .region(region);
        Provider::new(builder, key_prefix.to_owned(), options)
    }

    ///
    /// A provider rooted in a local directory: used by tests and the single-machine setup.
    ///
    pub fn fs(path: &str, options: RemoteStoreOptions) -> Result<Provider, String> {
        let builder = opendal::services::Fs::default().root(path);
        Provider::new(builder, String::new(), options)
    }

    ///
    /// A fully in-memory provider for deterministic tests.
    ///
    pub fn memory() -> Result<Provider, String> {
        let builder = opendal::services::Memory::default();
        Provider::new(builder, String::new(), RemoteStoreOptions::default())
    }

    fn path(&self, id: ObjectId) -> String {
        format!("{}{}", self.key_prefix, id)
    }
}

#[async_trait]
impl ByteStoreProvider for Provider {
    async fn store_bytes(&self, id: ObjectId, bytes: Bytes) -> Result<(), StoreError> {
        // Some backends dislike storing an empty object, so we don't store it here, and magic it
        // up when loading.
        if id == EMPTY_OBJECT_ID {
            return Ok(());
        }

        let path = self.path(id);
        match self.operator.write(&path, bytes).await {
            Ok(_) => Ok(()),
            // The object already exists, i.e. these bytes have already been stored: content
            // addressing means whichever writer won the race wrote the same payload.
            Err(e) if e.kind() == opendal::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(classify(&format!("failed to write {path}"), e)),
        }
    }

    async fn load_bytes(&self, id: ObjectId) -> Result<Option<Bytes>, StoreError> {
        if id == EMPTY_OBJECT_ID {
            return Ok(Some(Bytes::new()));
        }

        let path = self.path(id);
        match self.operator.read(&path).await {
            Ok(buffer) => Ok(Some(buffer.to_bytes())),
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(classify(&format!("failed to read {path}"), e)),
        }
    }

    async fn exists(&self, id: ObjectId) -> Result<bool, StoreError> {
        if id == EMPTY_OBJECT_ID {
            return Ok(true);
        }

        let path = self.path(id);
        self.operator
            .exists(&path)
            .await
            .map_err(|e| classify(&format!("failed to query {path}"), e))
    }
}
