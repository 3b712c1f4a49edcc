// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use futures::stream::{self, StreamExt, TryStreamExt};
use store::Store;
use walkdir::WalkDir;

use crate::proto::PreloadArgs;


/// How many preload uploads run concurrently.
const PRELOAD_CONCURRENCY: usize = 32;

///
/// Proactively upload anticipated input files to prime the object store: the given files, plus
/// every file under each tree root whose path matches the tree's regex. Returns the number of
/// files uploaded; the first failure cancels the rest of the batch.
///
pub async fn preload(store: &Store, args: PreloadArgs) -> Result<usize, String> {
    let mut files: Vec<PathBuf> = args.paths;

    for tree in &args.trees {
        let matcher = regex::Regex::new(&tree.regex)
            .map_err(|e| format!("invalid preload regex {:?}: {e}", tree.regex))?;
        for entry in WalkDir::new(&tree.root) {
            let entry = entry.map_err(|e| format!("walking {}: {e}", tree.root.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            if matcher.is_match(&entry.path().to_string_lossy()) {
                files.push(entry.path().to_owned());
            }
        }
    }

    let uploaded = AtomicUsize::new(0);
    stream::iter(files)
        .map(Ok::<PathBuf, String>)
        .try_for_each_concurrent(PRELOAD_CONCURRENCY, |path| {
            let uploaded = &uploaded;
            async move {
                let bytes = tokio::fs::read(&path)
                    .await
                    .map_err(|e| format!("reading {}: {e}", path.display()))?;
                store
                    .store_bytes(Bytes::from(bytes))
                    .await
                    .map_err(|e| format!("storing {}: {e}", path.display()))?;
                uploaded.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
        })
        .await?;

    Ok(uploaded.load(Ordering::Relaxed))
}
