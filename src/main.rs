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

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use daemon::proto::{InvokeWithFilesArgs, PreloadArgs, PreloadTree};
use task_executor::Executor;

#[derive(Parser)]
#[command(name = "llama", about = "A distributed build accelerator.")]
struct Cli {
    /// Override the configuration directory (defaults to $LLAMA_DIR or $HOME/.llama).
    #[arg(long, global = true)]
    llama_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the coordinating daemon in the foreground.
    Daemon {
        /// Exit successfully if another daemon already holds the lock.
        #[arg(long)]
        autostart: bool,
    },
    /// Check that a daemon is running, starting one if needed.
    Ping,
    /// Ask the running daemon to shut down.
    Shutdown,
    /// Print the daemon's counters as JSON.
    Stats {
        /// Zero the counters after reading them.
        #[arg(long)]
        reset: bool,
    },
    /// Upload files (and matching files under --root) to prime the object store.
    Preload {
        paths: Vec<PathBuf>,
        /// A directory tree to walk.
        #[arg(long)]
        root: Option<PathBuf>,
        /// Upload only tree paths matching this regex.
        #[arg(long, default_value = ".")]
        regex: String,
    },
    /// Run a command remotely and print its stdout/stderr.
    Invoke {
        /// The platform function to invoke.
        #[arg(long, default_value = "llama-runtime")]
        function: String,
        #[arg(trailing_var_arg = true, required = true)]
        args: Vec<String>,
    },
    /// Print a compiler's default include search directories.
    IncludePath {
        compiler: String,
        #[arg(default_value = "c")]
        language: String,
    },
}

async fn execute(cli: Cli) -> Result<i32, String> {
    let llama_dir = match cli.llama_dir {
        Some(dir) => dir,
        None => daemon::llama_dir()?,
    };

    match cli.command {
        Command::Daemon { autostart } => {
            daemon::run_daemon(Executor::new(), &llama_dir, autostart).await?;
            Ok(0)
        }
        Command::Ping => {
            let mut client = daemon::dial_with_autostart(&llama_dir).await?;
            let pid = client.ping().await?;
            println!("pong from pid {pid}");
            Ok(0)
        }
        Command::Shutdown => {
            let mut client = daemon::DaemonClient::connect(&daemon::socket_path(&llama_dir))
                .await
                .map_err(|e| format!("no daemon to shut down: {e}"))?;
            client.shutdown().await?;
            Ok(0)
        }
        Command::Stats { reset } => {
            let mut client = daemon::dial_with_autostart(&llama_dir).await?;
            let stats = client.get_daemon_stats(reset).await?;
            let rendered = serde_json::to_string_pretty(&stats)
                .map_err(|e| format!("rendering stats: {e}"))?;
            println!("{rendered}");
            Ok(0)
        }
        Command::Preload { paths, root, regex } => {
            let mut client = daemon::dial_with_autostart(&llama_dir).await?;
            let trees = root
                .map(|root| vec![PreloadTree { root, regex }])
                .unwrap_or_default();
            let uploaded = client.preload_paths(PreloadArgs { paths, trees }).await?;
            println!("uploaded {uploaded} files");
            Ok(0)
        }
        Command::Invoke { function, args } => {
            let mut client = daemon::dial_with_autostart(&llama_dir).await?;
            let reply = client
                .invoke_with_files(InvokeWithFilesArgs {
                    function,
                    args,
                    stdin: None,
                    files: vec![],
                    outputs: vec![],
                    trace: None,
                    return_logs: false,
                    drop_semaphore: false,
                })
                .await?;
            if let Some(err) = reply.invoke_err {
                return Err(err);
            }
            use std::io::Write;
            std::io::stdout()
                .write_all(&reply.stdout)
                .and_then(|()| std::io::stderr().write_all(&reply.stderr))
                .map_err(|e| format!("writing output: {e}"))?;
            // The remote command's exit status is the caller's exit status.
            Ok(reply.exit_status)
        }
        Command::IncludePath { compiler, language } => {
            let mut client = daemon::dial_with_autostart(&llama_dir).await?;
            for path in client
                .get_compiler_include_path(&compiler, &language)
                .await?
            {
                println!("{}", path.display());
            }
            Ok(0)
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let cli = Cli::parse();
    match execute(cli).await {
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(1);
        }
        Ok(exit_code) => std::process::exit(exit_code),
    }
}
