// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;


///
/// Run-once-and-memoise discovery of a compiler's default include search directories, keyed by
/// `(compiler, language)`.
///
/// Discovery invokes the compiler with diagnostic flags and parses the indented block of search
/// paths from its error stream. Concurrent first callers may race the discovery; the cache is
/// double-checked on insert so exactly one result wins.
///
#[derive(Clone, Default)]
pub struct IncludePathCache {
    inner: Arc<Mutex<HashMap<(String, String), Arc<Vec<PathBuf>>>>>,
}

impl IncludePathCache {
    pub fn new() -> IncludePathCache {
        IncludePathCache::default()
    }

    pub async fn get(&self, compiler: &str, language: &str) -> Result<Arc<Vec<PathBuf>>, String> {
        let key = (compiler.to_owned(), language.to_owned());
        if let Some(paths) = self.inner.lock().get(&key) {
            return Ok(paths.clone());
        }

        let discovered = Arc::new(discover(compiler, language).await?);

        let mut inner = self.inner.lock();
        // Re-check: another caller may have finished discovery while we ran ours.
        Ok(inner.entry(key).or_insert(discovered).clone())
    }
}

async fn discover(compiler: &str, language: &str) -> Result<Vec<PathBuf>, String> {
    let output = tokio::process::Command::new(compiler)
        .args(["-E", "-Wp,-v", "-x", language, "/dev/null", "-o", "/dev/null"])
        .output()
        .await
        .map_err(|e| format!("running {compiler}: {e}"))?;

    let stderr = String::from_utf8_lossy(&output.stderr);
    Ok(parse_search_paths(&stderr))
}

///
/// The compiler prints its search directories as indented lines between two marker lines; a
/// framework-directory annotation may trail the path.
///
fn parse_search_paths(stderr: &str) -> Vec<PathBuf> {
    stderr
        .lines()
        .filter(|line| line.starts_with(' '))
        .map(|line| line.trim())
        .filter(|line| !line.is_empty())
        .map(|line| line.trim_end_matches(" (framework directory)"))
        .map(PathBuf::from)
        .collect()
}
