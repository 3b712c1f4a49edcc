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

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

///
/// A counting semaphore used to bound how many CPU-bound sub-operations run concurrently on the
/// local machine, shared by every request the daemon serves.
///
/// A holder may temporarily yield its permit while it blocks on remote work (see
/// `Permit::release` and `AsyncSemaphore::acquire`): the daemon's invocation path drops the
/// permit for the duration of the remote call and reacquires it before touching local disk
/// again.
///
#[derive(Clone)]
pub struct AsyncSemaphore {
    inner: Arc<Semaphore>,
}

impl AsyncSemaphore {
    pub fn new(permits: usize) -> AsyncSemaphore {
        AsyncSemaphore {
            inner: Arc::new(Semaphore::new(permits)),
        }
    }

    ///
    /// The number of permits that are currently not held.
    ///
    pub fn available_permits(&self) -> usize {
        self.inner.available_permits()
    }

    ///
    /// Wait for a permit, suspending until one is available.
    ///
    pub async fn acquire(&self) -> Permit {
        let permit = self
            .inner
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore is never closed");
        Permit { permit }
    }

    ///
    /// Runs the given Future-creating function (and the Future it returns) under the semaphore.
    ///
    pub async fn with_acquired<F, B, O>(&self, f: F) -> O
    where
        F: FnOnce() -> B,
        B: Future<Output = O>,
    {
        let permit = self.acquire().await;
        let res = f().await;
        drop(permit);
        res
    }
}

pub struct Permit {
    permit: OwnedSemaphorePermit,
}

impl Permit {
    ///
    /// Explicitly give the permit back. Equivalent to dropping, but reads better at call sites
    /// that later reacquire.
    ///
    pub fn release(self) {
        drop(self.permit);
    }
}
