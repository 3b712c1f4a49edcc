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

//! The coordinating daemon: a long-lived local process that brokers work between many
//! transient client CLIs and the remote invocation platform, owning all shared state (the
//! object store and its caches, work-in-flight stats, the local-CPU semaphore, and the trace
//! sink).

use std::path::Path;
use std::sync::Arc;

use task_executor::Executor;

pub mod client;
pub mod config;
mod include_path;
mod invoke;
pub mod invoker;
mod preload;
pub mod proto;
pub mod server;
mod stats;

pub use client::{dial_with_autostart, DaemonClient};
pub use config::{llama_dir, socket_path, Config};
pub use invoker::{FunctionInvoker, HttpInvoker, InvokeOutput};
pub use server::{BindError, Daemon, DaemonServer};

///
/// Build a daemon from `llama.json` and serve until shutdown.
///
/// With `autostart`, losing the bind race to another daemon is a success: the caller only
/// wanted some daemon to exist.
///
pub async fn run_daemon(
    executor: Executor,
    llama_dir: &Path,
    autostart: bool,
) -> Result<(), String> {
    let config = Config::load(llama_dir)?;
    if config.object_store.is_empty() {
        return Err(format!(
            "no object_store configured in {}/{}",
            llama_dir.display(),
            config::CONFIG_NAME
        ));
    }

    let region = if config.aws_region.is_empty() {
        None
    } else {
        Some(config.aws_region.as_str())
    };
    let provider = store::provider_from_url(&config.object_store, region)?;
    let mut store = store::Store::new(executor.clone(), Arc::new(provider));
    if config.disk_cache_bytes > 0 {
        store = store.with_disk_cache(store::DiskCache::new(
            llama_dir.join("cache"),
            config.disk_cache_bytes,
        )?);
    }
    if config.disable_head_check {
        store = store.without_head_check();
    }

    let invoker = Arc::new(HttpInvoker::new(&config.invoke_endpoint));
    let daemon = Arc::new(Daemon::new(store, invoker));
    match DaemonServer::bind(
        executor,
        daemon,
        socket_path(llama_dir),
        config.idle_timeout(),
    ) {
        Ok(server) => server.serve().await,
        Err(BindError::AlreadyRunning) if autostart => {
            log::debug!("lost the daemon startup race; another daemon is serving");
            Ok(())
        }
        Err(e) => Err(e.to_string()),
    }
}
