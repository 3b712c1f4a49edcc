// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use protocol::Span;

use crate::config::socket_path;
use crate::proto::{
    DaemonStatsSnapshot, InvokeWithFilesArgs, InvokeWithFilesReply, PreloadArgs, Request, Response,
};


///
/// A connection to the daemon's socket: framed requests, one response per request.
///
pub struct DaemonClient {
    framed: Framed<UnixStream, LengthDelimitedCodec>,
}

impl DaemonClient {
    pub async fn connect(socket: &Path) -> std::io::Result<DaemonClient> {
        let stream = UnixStream::connect(socket).await?;
        Ok(DaemonClient {
            framed: Framed::new(stream, crate::server::frame_codec()),
        })
    }

    async fn call(&mut self, request: &Request) -> Result<Response, String> {
        let encoded = serde_json::to_vec(request).map_err(|e| format!("encoding request: {e}"))?;
        self.framed
            .send(Bytes::from(encoded))
            .await
            .map_err(|e| format!("sending request: {e}"))?;
        let frame = self
            .framed
            .next()
            .await
            .ok_or_else(|| "connection closed before a response arrived".to_owned())?
            .map_err(|e| format!("reading response: {e}"))?;
        let response =
            serde_json::from_slice(&frame).map_err(|e| format!("parsing response: {e}"))?;
        match response {
            Response::Error { message } => Err(message),
            response => Ok(response),
        }
    }

    pub async fn ping(&mut self) -> Result<u32, String> {
        match self.call(&Request::Ping).await? {
            Response::Pong { pid } => Ok(pid),
            other => Err(format!("unexpected reply to Ping: {other:?}")),
        }
    }

    pub async fn shutdown(&mut self) -> Result<(), String> {
        match self.call(&Request::Shutdown).await? {
            Response::ShuttingDown => Ok(()),
            other => Err(format!("unexpected reply to Shutdown: {other:?}")),
        }
    }

    pub async fn invoke_with_files(
        &mut self,
        args: InvokeWithFilesArgs,
    ) -> Result<InvokeWithFilesReply, String> {
        match self.call(&Request::InvokeWithFiles(args)).await? {
            Response::Invoked(reply) => Ok(reply),
            other => Err(format!("unexpected reply to InvokeWithFiles: {other:?}")),
        }
    }

    pub async fn get_daemon_stats(&mut self, reset: bool) -> Result<DaemonStatsSnapshot, String> {
        match self.call(&Request::GetDaemonStats { reset }).await? {
            Response::Stats(snapshot) => Ok(snapshot),
            other => Err(format!("unexpected reply to GetDaemonStats: {other:?}")),
        }
    }

    pub async fn trace_spans(&mut self, spans: Vec<Span>) -> Result<(), String> {
        match self.call(&Request::TraceSpans { spans }).await? {
            Response::SpansAccepted => Ok(()),
            other => Err(format!("unexpected reply to TraceSpans: {other:?}")),
        }
    }

    pub async fn preload_paths(&mut self, args: PreloadArgs) -> Result<usize, String> {
        match self.call(&Request::PreloadPaths(args)).await? {
            Response::Preloaded { uploaded } => Ok(uploaded),
            other => Err(format!("unexpected reply to PreloadPaths: {other:?}")),
        }
    }

    pub async fn get_compiler_include_path(
        &mut self,
        compiler: &str,
        language: &str,
    ) -> Result<Vec<PathBuf>, String> {
        let request = Request::GetCompilerIncludePath {
            compiler: compiler.to_owned(),
            language: language.to_owned(),
        };
        match self.call(&request).await? {
            Response::IncludePaths { paths } => Ok(paths),
            other => Err(format!(
                "unexpected reply to GetCompilerIncludePath: {other:?}"
            )),
        }
    }
}

/// How often a dialer polls the socket while the daemon comes up.
const AUTOSTART_POLL: Duration = Duration::from_millis(10);
/// How long a dialer keeps polling before giving up on the spawned daemon.
const AUTOSTART_DEADLINE: Duration = Duration::from_secs(30);

///
/// Connect to the daemon for `llama_dir`, starting one if none is running.
///
/// The spawned process is a detached session leader competing for the daemon's file lock, so
/// concurrent dialers are safe: losers of the lock race exit zero and are ignored, and every
/// dialer ends up connected to the single winner.
///
pub async fn dial_with_autostart(llama_dir: &Path) -> Result<DaemonClient, String> {
    let socket = socket_path(llama_dir);
    if let Ok(client) = DaemonClient::connect(&socket).await {
        return Ok(client);
    }

    let mut child = spawn_daemon(llama_dir)?;
    let mut child_running = true;
    let deadline = tokio::time::Instant::now() + AUTOSTART_DEADLINE;

    loop {
        if let Ok(client) = DaemonClient::connect(&socket).await {
            return Ok(client);
        }
        if child_running {
            match child.try_wait() {
                Ok(Some(status)) if !status.success() => {
                    return Err(format!("spawned daemon exited with {status}"));
                }
                // A zero exit means someone else won the startup race: keep polling.
                Ok(Some(_)) => child_running = false,
                Ok(None) => {}
                Err(e) => return Err(format!("waiting for spawned daemon: {e}")),
            }
        }
        if tokio::time::Instant::now() > deadline {
            return Err(format!(
                "daemon did not come up at {} within {}s",
                socket.display(),
                AUTOSTART_DEADLINE.as_secs()
            ));
        }
        tokio::time::sleep(AUTOSTART_POLL).await;
    }
}

///
/// Spawn `llama daemon -autostart` as a detached background process: its own session, HUP
/// ignored, stdio disconnected from the caller's terminal.
///
fn spawn_daemon(llama_dir: &Path) -> Result<std::process::Child, String> {
    use std::os::unix::process::CommandExt;

    let exe = std::env::current_exe().map_err(|e| format!("resolving current exe: {e}"))?;
    let mut command = std::process::Command::new(exe);
    command
        .arg("daemon")
        .arg("--autostart")
        .env("LLAMA_DIR", llama_dir)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());
    unsafe {
        command.pre_exec(|| {
            nix::unistd::setsid().map_err(std::io::Error::from)?;
            nix::sys::signal::signal(
                nix::sys::signal::Signal::SIGHUP,
                nix::sys::signal::SigHandler::SigIgn,
            )
            .map_err(std::io::Error::from)?;
            Ok(())
        });
    }
    command
        .spawn()
        .map_err(|e| format!("spawning daemon: {e}"))
}
