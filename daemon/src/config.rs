// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[cfg(test)]
mod config_tests;

pub const SOCKET_NAME: &str = "llama.sock";
pub const CONFIG_NAME: &str = "llama.json";

///
/// The configuration directory: `$LLAMA_DIR`, defaulting to `$HOME/.llama`.
///
pub fn llama_dir() -> Result<PathBuf, String> {
    if let Ok(dir) = std::env::var("LLAMA_DIR") {
        if !dir.is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }
    let home = std::env::var("HOME").map_err(|_| "neither LLAMA_DIR nor HOME is set".to_owned())?;
    Ok(Path::new(&home).join(".llama"))
}

pub fn socket_path(dir: &Path) -> PathBuf {
    dir.join(SOCKET_NAME)
}

///
/// `llama.json`, the per-user configuration shared by the daemon and the thin CLIs.
///
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// An `s3://bucket/prefix/` URL for the object store.
    #[serde(default)]
    pub object_store: String,
    #[serde(default)]
    pub aws_region: String,
    #[serde(default)]
    pub ecr_repository: String,
    #[serde(default)]
    pub iam_role: String,
    /// The HTTP endpoint the daemon invokes functions against.
    #[serde(default)]
    pub invoke_endpoint: String,
    /// Idle seconds before the daemon shuts itself down; zero disables the watchdog.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// The disk cache byte budget; zero disables the cache.
    #[serde(default = "default_disk_cache_bytes")]
    pub disk_cache_bytes: u64,
    /// Skip existence probes before uploads, trading round-trips for bandwidth.
    #[serde(default)]
    pub disable_head_check: bool,
}

fn default_idle_timeout_secs() -> u64 {
    15 * 60
}

fn default_disk_cache_bytes() -> u64 {
    10 * 1024 * 1024 * 1024
}

impl Config {
    pub fn load(dir: &Path) -> Result<Config, String> {
        let path = dir.join(CONFIG_NAME);
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Config::default());
            }
            Err(e) => return Err(format!("failed to read {}: {e}", path.display())),
        };
        serde_json::from_str(&contents).map_err(|e| format!("failed to parse {}: {e}", path.display()))
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}
