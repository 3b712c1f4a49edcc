// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};

use protocol::{Blob, File, FileAndPath};

use crate::{BlobSource, GetBatch, Store};

#[cfg(test)]
mod files_tests;

/// How many files are read or written concurrently by one move.
pub const FILE_MOVE_CONCURRENCY: usize = 32;

///
/// Where a mapped file's content lives on the client: a path to read, or literal bytes carried
/// in the request. The two are mutually exclusive by construction.
///
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum LocalSource {
    Path(PathBuf),
    Bytes { bytes: Vec<u8>, mode: u32 },
}

///
/// A client-side mapping between local content and a remote logical path.
///
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MappedFile {
    pub local: LocalSource,
    pub remote: String,
}

impl MappedFile {
    pub fn from_path(local: impl Into<PathBuf>, remote: impl Into<String>) -> MappedFile {
        MappedFile {
            local: LocalSource::Path(local.into()),
            remote: remote.into(),
        }
    }

    pub fn from_bytes(bytes: Vec<u8>, mode: u32, remote: impl Into<String>) -> MappedFile {
        MappedFile {
            local: LocalSource::Bytes { bytes, mode },
            remote: remote.into(),
        }
    }
}

///
/// The remote logical path for a local path: absolute paths are projected under `_root/` so
/// that the worker's job root acts as a virtual filesystem overlay.
///
pub fn remote_path_for(path: &Path) -> String {
    let rendered = path.to_string_lossy();
    match rendered.strip_prefix('/') {
        Some(rest) => format!("_root/{rest}"),
        None => rendered.into_owned(),
    }
}

///
/// The inverse of `remote_path_for`: recover the absolute local path from an `_root/` overlay
/// path, or None for a plain relative path.
///
pub fn local_path_for(remote: &str) -> Option<PathBuf> {
    remote
        .strip_prefix("_root/")
        .map(|rest| PathBuf::from(format!("/{rest}")))
}

///
/// Load and encode a list of mapped files in parallel, preserving input order.
///
/// A file that fails to read is encoded as an error blob rather than failing the batch: the
/// remote side reports it in context. Store failures (a reference upload going wrong) do fail
/// the batch.
///
pub async fn upload_files(
    store: &Store,
    files: Vec<MappedFile>,
) -> Result<Vec<FileAndPath>, String> {
    stream::iter(files)
        .map(|mapped| async move {
            let (blob, mode) = match mapped.local {
                LocalSource::Bytes { bytes, mode } => {
                    (store.store_blob(Bytes::from(bytes)).await?, mode)
                }
                LocalSource::Path(path) => match read_with_mode(&path).await {
                    Ok((bytes, mode)) => (store.store_blob(bytes).await?, mode),
                    Err(message) => (Blob::Err(message), 0),
                },
            };
            Ok(FileAndPath {
                file: File { blob, mode },
                path: mapped.remote,
            })
        })
        .buffered(FILE_MOVE_CONCURRENCY)
        .try_collect()
        .await
        .map_err(|e: crate::StoreError| e.to_string())
}

async fn read_with_mode(path: &Path) -> Result<(Bytes, u32), String> {
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|e| format!("stat {}: {e}", path.display()))?;
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| format!("read {}: {e}", path.display()))?;
    Ok((Bytes::from(bytes), metadata.permissions().mode() & 0o777))
}

///
/// The local projection of a batch of returned files: which path each lands at, with what
/// mode, from which blob source. Built against a shared `GetBatch` so that a caller can cover
/// additional blobs (stdout, stderr) with the same batched store call.
///
pub struct FetchPlan {
    writes: Vec<(PathBuf, u32, BlobSource)>,
}

///
/// Plan the materialisation of `returned` files. `local_list` declares which remote paths were
/// requested and where each lands locally. Returned paths that were never requested are logged
/// and dropped. Requested paths that were not returned are accepted silently: a compiler may
/// legitimately not produce an optional output.
///
pub fn plan_fetch(
    batch: &mut GetBatch,
    local_list: &[MappedFile],
    returned: &[FileAndPath],
) -> FetchPlan {
    let targets: HashMap<&str, &Path> = local_list
        .iter()
        .filter_map(|mapped| match &mapped.local {
            LocalSource::Path(path) => Some((mapped.remote.as_str(), path.as_path())),
            LocalSource::Bytes { .. } => None,
        })
        .collect();

    let mut writes: Vec<(PathBuf, u32, BlobSource)> = Vec::new();
    for entry in returned {
        let Some(&target) = targets.get(entry.path.as_str()) else {
            log::warn!("dropping unrequested output {:?}", entry.path);
            continue;
        };
        let source = batch.append(&entry.file.blob);
        writes.push((target.to_owned(), entry.file.effective_mode(), source));
    }
    FetchPlan { writes }
}

///
/// Write the planned files to disk, atomically and with their modes, resolving each against
/// the fetched batch.
///
pub async fn execute_fetch(
    store: &Store,
    fetched: &crate::FetchedBlobs,
    plan: FetchPlan,
) -> Result<(), String> {
    let resolved: Vec<(PathBuf, u32, Bytes)> = plan
        .writes
        .into_iter()
        .map(|(path, mode, source)| {
            let bytes = fetched
                .resolve(source)
                .map_err(|e| format!("fetching {}: {e}", path.display()))?;
            Ok((path, mode, bytes))
        })
        .collect::<Result<_, String>>()?;

    store
        .executor()
        .spawn_blocking(
            move || {
                for (path, mode, bytes) in resolved {
                    write_atomic(&path, mode, &bytes)?;
                }
                Ok(())
            },
            |e| Err(format!("file write task failed: {e}")),
        )
        .await
}

///
/// Materialise returned files onto local disk in one batched store call.
///
pub async fn fetch_files(
    store: &Store,
    local_list: &[MappedFile],
    returned: &[FileAndPath],
) -> Result<(), String> {
    let mut batch = GetBatch::new();
    let plan = plan_fetch(&mut batch, local_list, returned);
    let fetched = batch.fetch(store).await;
    execute_fetch(store, &fetched, plan).await
}

fn write_atomic(path: &Path, mode: u32, bytes: &[u8]) -> Result<(), String> {
    let parent = path
        .parent()
        .ok_or_else(|| format!("output path {} has no parent", path.display()))?;
    std::fs::create_dir_all(parent).map_err(|e| format!("mkdir {}: {e}", parent.display()))?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .map_err(|e| format!("creating temp file in {}: {e}", parent.display()))?;
    tmp.write_all(bytes)
        .map_err(|e| format!("writing {}: {e}", path.display()))?;
    tmp.as_file()
        .set_permissions(std::fs::Permissions::from_mode(mode))
        .map_err(|e| format!("chmod {}: {e}", path.display()))?;
    tmp.persist(path)
        .map_err(|e| format!("renaming into {}: {e}", path.display()))?;
    Ok(())
}
