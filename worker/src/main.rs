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

use std::sync::Arc;

use store::Store;
use task_executor::Executor;
use worker::{run_invocation, RuntimeClient, WorkerEnv};

///
/// The function bootstrap: initialise the object store from the environment, then serve jobs
/// until the platform recycles the instance.
///
#[tokio::main]
async fn main() {
    env_logger::init();

    let client = match RuntimeClient::from_env() {
        Ok(client) => client,
        Err(e) => {
            log::error!("{e}");
            std::process::exit(1);
        }
    };

    let store = match store_from_env() {
        Ok(store) => store,
        Err(e) => {
            log::error!("object store initialisation failed: {e}");
            let _ = client.post_init_error(&e).await;
            std::process::exit(1);
        }
    };

    let env = WorkerEnv::from_env();
    let mut cold_start = true;
    loop {
        let job = match client.next().await {
            Ok(job) => job,
            Err(e) => {
                log::error!("{e}");
                continue;
            }
        };

        match run_invocation(&store, &env, job.spec, cold_start).await {
            Ok(response) => {
                if let Err(e) = client.post_response(&job.request_id, &response).await {
                    log::error!("{e}");
                }
            }
            Err(message) => {
                log::error!("invocation {} failed: {message}", job.request_id);
                if let Err(e) = client.post_error(&job.request_id, &message).await {
                    log::error!("{e}");
                }
            }
        }
        cold_start = false;
    }
}

fn store_from_env() -> Result<Store, String> {
    let url = std::env::var("LLAMA_OBJECT_STORE")
        .map_err(|_| "LLAMA_OBJECT_STORE is not set".to_owned())?;
    let region = std::env::var("AWS_REGION")
        .or_else(|_| std::env::var("AWS_DEFAULT_REGION"))
        .ok();
    let provider = store::provider_from_url(&url, region.as_deref())?;
    Ok(Store::new(Executor::new(), Arc::new(provider)))
}
