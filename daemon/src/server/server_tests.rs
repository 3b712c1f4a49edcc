// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tempfile::TempDir;

use store::Store;
use task_executor::Executor;

use crate::client::DaemonClient;
use crate::invoker::{FunctionInvoker, InvokeOutput};
use crate::server::{BindError, Daemon, DaemonServer};

struct UnreachablePlatform;

#[async_trait]
impl FunctionInvoker for UnreachablePlatform {
    async fn invoke(
        &self,
        _function: &str,
        _payload: Bytes,
        _tail_logs: bool,
    ) -> Result<InvokeOutput, String> {
        Err("the test platform is unreachable".to_owned())
    }
}

fn daemon(executor: &Executor) -> Arc<Daemon> {
    Arc::new(Daemon::new(
        Store::memory_for_testing(executor.clone()),
        Arc::new(UnreachablePlatform),
    ))
}

#[tokio::test]
async fn the_bind_lock_admits_one_daemon() {
    let dir = TempDir::new().unwrap();
    let executor = Executor::new();
    let socket = dir.path().join("llama.sock");

    let winner = DaemonServer::bind(
        executor.clone(),
        daemon(&executor),
        socket.clone(),
        Duration::ZERO,
    )
    .unwrap();

    match DaemonServer::bind(executor.clone(), daemon(&executor), socket, Duration::ZERO) {
        Err(BindError::AlreadyRunning) => {}
        Err(e) => panic!("the loser must observe AlreadyRunning, got {e}"),
        Ok(_) => panic!("two daemons bound the same socket"),
    }

    drop(winner);
}

#[tokio::test]
async fn a_stale_socket_is_unlinked_before_bind() {
    let dir = TempDir::new().unwrap();
    let executor = Executor::new();
    let socket = dir.path().join("llama.sock");

    // A dead daemon left a socket file behind but no lock holder.
    std::fs::write(&socket, b"").unwrap();

    let server = DaemonServer::bind(
        executor.clone(),
        daemon(&executor),
        socket.clone(),
        Duration::ZERO,
    )
    .unwrap();
    let serving = tokio::spawn(server.serve());

    let mut client = DaemonClient::connect(&socket).await.unwrap();
    client.ping().await.unwrap();
    client.shutdown().await.unwrap();
    serving.await.unwrap().unwrap();
}

#[tokio::test]
async fn the_watchdog_shuts_an_idle_daemon_down() {
    let dir = TempDir::new().unwrap();
    let executor = Executor::new();
    let socket = dir.path().join("llama.sock");

    let server = DaemonServer::bind(
        executor.clone(),
        daemon(&executor),
        socket,
        Duration::from_millis(50),
    )
    .unwrap();

    tokio::time::timeout(Duration::from_secs(5), server.serve())
        .await
        .expect("an idle daemon should stop on its own")
        .unwrap();
}

#[tokio::test]
async fn requests_extend_the_idle_deadline() {
    let dir = TempDir::new().unwrap();
    let executor = Executor::new();
    let socket = dir.path().join("llama.sock");

    let server = DaemonServer::bind(
        executor.clone(),
        daemon(&executor),
        socket.clone(),
        Duration::from_millis(200),
    )
    .unwrap();
    let serving = tokio::spawn(server.serve());

    // Ping more often than the timeout for longer than the timeout: the daemon stays up.
    let mut client = DaemonClient::connect(&socket).await.unwrap();
    for _ in 0..8 {
        tokio::time::sleep(Duration::from_millis(60)).await;
        client.ping().await.unwrap();
    }
    assert!(!serving.is_finished());

    // Then let it idle out.
    tokio::time::timeout(Duration::from_secs(5), serving)
        .await
        .expect("the daemon should idle out once pings stop")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn a_second_daemon_can_bind_after_the_first_exits() {
    let dir = TempDir::new().unwrap();
    let executor = Executor::new();
    let socket = dir.path().join("llama.sock");

    let first = DaemonServer::bind(
        executor.clone(),
        daemon(&executor),
        socket.clone(),
        Duration::ZERO,
    )
    .unwrap();
    drop(first);

    DaemonServer::bind(executor.clone(), daemon(&executor), socket, Duration::ZERO)
        .expect("the lock should be free once the first server is gone");
}
