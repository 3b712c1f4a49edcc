// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use nix::errno::Errno;
use parking_lot::Mutex;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use async_semaphore::AsyncSemaphore;
use store::Store;
use task_executor::Executor;
use trace_store::TraceStore;

#[cfg(test)]
mod server_tests;

use crate::include_path::IncludePathCache;
use crate::invoke::invoke_with_files;
use crate::invoker::FunctionInvoker;
use crate::preload::preload;
use crate::proto::{Request, Response};
use crate::stats::DaemonStats;

///
/// The daemon's shared state: everything the procedures operate on. One `Daemon` outlives all
/// of the transient client CLIs it serves.
///
pub struct Daemon {
    pub(crate) store: Store,
    pub(crate) traces: TraceStore,
    pub(crate) stats: DaemonStats,
    pub(crate) invoker: Arc<dyn FunctionInvoker>,
    pub(crate) cpu_semaphore: AsyncSemaphore,
    include_paths: IncludePathCache,
    shutdown_tx: watch::Sender<bool>,
    extend_tx: mpsc::UnboundedSender<()>,
    extend_rx: Mutex<Option<mpsc::UnboundedReceiver<()>>>,
}

impl Daemon {
    pub fn new(store: Store, invoker: Arc<dyn FunctionInvoker>) -> Daemon {
        let (shutdown_tx, _) = watch::channel(false);
        let (extend_tx, extend_rx) = mpsc::unbounded_channel();
        Daemon {
            store,
            traces: TraceStore::new(),
            stats: DaemonStats::new(),
            invoker,
            // Shared with the user's preprocessor and editor: leave headroom beyond the core
            // count but not much.
            cpu_semaphore: AsyncSemaphore::new(2 * num_cpus::get()),
            include_paths: IncludePathCache::new(),
            shutdown_tx,
            extend_tx,
            extend_rx: Mutex::new(Some(extend_rx)),
        }
    }

    ///
    /// Ask the daemon to stop serving. In-flight calls complete first.
    ///
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn traces(&self) -> &TraceStore {
        &self.traces
    }

    fn extend(&self) {
        let _ = self.extend_tx.send(());
    }

    async fn handle(self: &Arc<Daemon>, request: Request) -> Response {
        // Every served request pushes the idle deadline out.
        self.extend();
        match request {
            Request::Ping => Response::Pong {
                pid: std::process::id(),
            },
            Request::Shutdown => {
                self.shutdown();
                Response::ShuttingDown
            }
            Request::InvokeWithFiles(args) => {
                Response::Invoked(invoke_with_files(self, args).await)
            }
            Request::GetDaemonStats { reset } => {
                let mut snapshot = self.stats.snapshot(reset);
                snapshot.store_usage = self.store.usage();
                Response::Stats(snapshot)
            }
            Request::TraceSpans { spans } => {
                self.traces.submit_all(spans);
                Response::SpansAccepted
            }
            Request::PreloadPaths(args) => match preload(&self.store, args).await {
                Ok(uploaded) => Response::Preloaded { uploaded },
                Err(message) => Response::Error { message },
            },
            Request::GetCompilerIncludePath { compiler, language } => {
                match self.include_paths.get(&compiler, &language).await {
                    Ok(paths) => Response::IncludePaths {
                        paths: paths.as_ref().clone(),
                    },
                    Err(message) => Response::Error { message },
                }
            }
        }
    }
}

#[derive(Debug)]
pub enum BindError {
    /// Another daemon holds the socket lock. Expected under concurrent starts; tolerated.
    AlreadyRunning,
    Other(String),
}

impl std::fmt::Display for BindError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BindError::AlreadyRunning => write!(f, "another daemon is already running"),
            BindError::Other(message) => write!(f, "{message}"),
        }
    }
}

///
/// A bound, not-yet-serving daemon. Holding the `.lock` flock is what makes this process the
/// authoritative daemon; the lock lives as long as the server.
///
pub struct DaemonServer {
    daemon: Arc<Daemon>,
    executor: Executor,
    listener: UnixListener,
    socket_path: PathBuf,
    idle_timeout: Duration,
    _lock_file: std::fs::File,
}

impl DaemonServer {
    ///
    /// Acquire the daemon lock and bind the socket. Two concurrent starts contend on the lock;
    /// the loser gets `AlreadyRunning`. Any stale socket left by a dead daemon is unlinked
    /// before binding.
    ///
    pub fn bind(
        executor: Executor,
        daemon: Arc<Daemon>,
        socket_path: PathBuf,
        idle_timeout: Duration,
    ) -> Result<DaemonServer, BindError> {
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| BindError::Other(format!("creating {}: {e}", parent.display())))?;
        }

        let lock_path = PathBuf::from(format!("{}.lock", socket_path.display()));
        let lock_file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&lock_path)
            .map_err(|e| BindError::Other(format!("opening {}: {e}", lock_path.display())))?;
        match nix::fcntl::flock(
            lock_file.as_raw_fd(),
            nix::fcntl::FlockArg::LockExclusiveNonblock,
        ) {
            Ok(()) => {}
            Err(e) if e == Errno::EWOULDBLOCK => return Err(BindError::AlreadyRunning),
            Err(e) => {
                return Err(BindError::Other(format!(
                    "locking {}: {e}",
                    lock_path.display()
                )))
            }
        }

        // Lock held: any existing socket is stale.
        match std::fs::remove_file(&socket_path) {
            Ok(()) => log::debug!("removed stale socket {}", socket_path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(BindError::Other(format!(
                    "removing stale socket {}: {e}",
                    socket_path.display()
                )))
            }
        }

        let listener = UnixListener::bind(&socket_path)
            .map_err(|e| BindError::Other(format!("binding {}: {e}", socket_path.display())))?;

        Ok(DaemonServer {
            daemon,
            executor,
            listener,
            socket_path,
            idle_timeout,
            _lock_file: lock_file,
        })
    }

    ///
    /// Serve until shutdown: either the `Shutdown` procedure or the idle watchdog. In-flight
    /// connections are drained before returning, and the socket is unlinked.
    ///
    pub async fn serve(self) -> Result<(), String> {
        let mut shutdown_rx = self.daemon.shutdown_signal();
        self.spawn_watchdog();

        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => {
                            let daemon = self.daemon.clone();
                            connections.spawn_on(
                                handle_connection(daemon, stream),
                                self.executor.handle(),
                            );
                        }
                        Err(e) => {
                            log::warn!("failed to accept connection: {e}");
                        }
                    }
                }
            }
        }

        log::info!("daemon shutting down");
        drop(self.listener);
        while connections.join_next().await.is_some() {}
        let _ = std::fs::remove_file(&self.socket_path);
        Ok(())
    }

    ///
    /// The idle-timeout watchdog: a timer that resets whenever a request extends it, and
    /// triggers shutdown on expiry. A zero timeout disables it.
    ///
    fn spawn_watchdog(&self) {
        if self.idle_timeout.is_zero() {
            // No watchdog: drop the receiver so extend signals don't accumulate.
            drop(self.daemon.extend_rx.lock().take());
            return;
        }
        let idle_timeout = self.idle_timeout;
        let daemon = self.daemon.clone();
        let mut extend_rx = daemon
            .extend_rx
            .lock()
            .take()
            .expect("the watchdog is spawned once");
        let _watchdog = self.executor.native_spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(idle_timeout) => {
                        log::info!(
                            "idle for {}s, shutting down",
                            idle_timeout.as_secs()
                        );
                        daemon.shutdown();
                        break;
                    }
                    extended = extend_rx.recv() => {
                        if extended.is_none() {
                            break;
                        }
                    }
                }
            }
        });
    }
}

///
/// One connection: a sequence of length-framed JSON requests, each answered in order. A request
/// in progress completes even under shutdown; the task only stops while idle between frames.
///
async fn handle_connection(daemon: Arc<Daemon>, stream: UnixStream) {
    let mut shutdown_rx = daemon.shutdown_signal();
    let mut framed = Framed::new(stream, frame_codec());
    loop {
        let frame = tokio::select! {
            _ = shutdown_rx.changed() => break,
            frame = framed.next() => frame,
        };
        let frame = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                log::debug!("connection read failed: {e}");
                break;
            }
            None => break,
        };
        let response = match serde_json::from_slice::<Request>(&frame) {
            Ok(request) => daemon.handle(request).await,
            Err(e) => Response::Error {
                message: format!("malformed request: {e}"),
            },
        };
        let encoded = match serde_json::to_vec(&response) {
            Ok(encoded) => encoded,
            Err(e) => {
                log::error!("failed to encode response: {e}");
                break;
            }
        };
        if let Err(e) = framed.send(Bytes::from(encoded)).await {
            log::debug!("connection write failed: {e}");
            break;
        }
    }
}

///
/// Inline blobs ride inside request frames, so the frame ceiling is far above the codec
/// default.
///
pub(crate) fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(256 * 1024 * 1024)
        .new_codec()
}
