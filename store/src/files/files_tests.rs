// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use protocol::{Blob, File, FileAndPath};
use task_executor::Executor;

use crate::files::{
    fetch_files, local_path_for, remote_path_for, upload_files, MappedFile,
};
use crate::Store;

fn store() -> Store {
    Store::memory_for_testing(Executor::new())
}

#[tokio::test]
async fn upload_reads_contents_and_mode() {
    let store = store();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("tool.sh");
    std::fs::write(&path, "#!/bin/sh\n").unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

    let uploaded = upload_files(&store, vec![MappedFile::from_path(&path, "bin/tool.sh")])
        .await
        .unwrap();

    assert_eq!(uploaded.len(), 1);
    assert_eq!(uploaded[0].path, "bin/tool.sh");
    assert_eq!(uploaded[0].file.mode, 0o755);
    assert_eq!(
        uploaded[0].file.blob,
        Blob::Inline("#!/bin/sh\n".to_owned())
    );
}

#[tokio::test]
async fn upload_accepts_literal_bytes() {
    let store = store();
    let uploaded = upload_files(
        &store,
        vec![MappedFile::from_bytes(b"carried".to_vec(), 0o600, "in/a")],
    )
    .await
    .unwrap();
    assert_eq!(uploaded[0].file.mode, 0o600);
}

#[tokio::test]
async fn unreadable_input_becomes_an_error_blob() {
    let store = store();
    let uploaded = upload_files(
        &store,
        vec![MappedFile::from_path("/no/such/file", "in/missing")],
    )
    .await
    .unwrap();
    assert!(uploaded[0].file.blob.is_err());
}

#[tokio::test]
async fn fetch_materialises_requested_outputs() {
    let store = store();
    let dir = TempDir::new().unwrap();
    let target = dir.path().join("out/b.txt");

    let requested = vec![MappedFile::from_path(&target, "b.txt")];
    let returned = vec![FileAndPath {
        file: File {
            blob: Blob::Inline("Hello, A\nWorld\n".to_owned()),
            mode: 0,
        },
        path: "b.txt".to_owned(),
    }];

    fetch_files(&store, &requested, &returned).await.unwrap();

    assert_eq!(
        std::fs::read_to_string(&target).unwrap(),
        "Hello, A\nWorld\n"
    );
    // Mode 0 materialises as 0644.
    let mode = std::fs::metadata(&target).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o644);
}

#[tokio::test]
async fn fetch_resolves_referenced_blobs_in_one_batch() {
    let store = store();
    let dir = TempDir::new().unwrap();
    let target = dir.path().join("big.bin");

    let payload = vec![0x42u8; 64 * 1024];
    let blob = store
        .store_blob(bytes::Bytes::from(payload.clone()))
        .await
        .unwrap();
    assert!(matches!(blob, Blob::Ref(_)));

    let requested = vec![MappedFile::from_path(&target, "big.bin")];
    let returned = vec![FileAndPath {
        file: File { blob, mode: 0o644 },
        path: "big.bin".to_owned(),
    }];

    fetch_files(&store, &requested, &returned).await.unwrap();
    assert_eq!(std::fs::read(&target).unwrap(), payload);
}

#[tokio::test]
async fn unrequested_outputs_are_dropped_and_missing_ones_accepted() {
    let store = store();
    let dir = TempDir::new().unwrap();

    // `c.txt` was requested but not returned; `stray.txt` was returned but never requested.
    let requested = vec![
        MappedFile::from_path(dir.path().join("b.txt"), "b.txt"),
        MappedFile::from_path(dir.path().join("c.txt"), "c.txt"),
    ];
    let returned = vec![
        FileAndPath {
            file: File {
                blob: Blob::Inline("b".to_owned()),
                mode: 0,
            },
            path: "b.txt".to_owned(),
        },
        FileAndPath {
            file: File {
                blob: Blob::Inline("stray".to_owned()),
                mode: 0,
            },
            path: "stray.txt".to_owned(),
        },
    ];

    fetch_files(&store, &requested, &returned).await.unwrap();

    assert!(dir.path().join("b.txt").exists());
    assert!(!dir.path().join("c.txt").exists());
    assert!(!dir.path().join("stray.txt").exists());
}

#[test]
fn absolute_paths_project_under_the_overlay_root() {
    assert_eq!(
        remote_path_for(Path::new("/usr/include/stdio.h")),
        "_root/usr/include/stdio.h"
    );
    assert_eq!(remote_path_for(Path::new("src/main.c")), "src/main.c");

    assert_eq!(
        local_path_for("_root/usr/include/stdio.h"),
        Some(PathBuf::from("/usr/include/stdio.h"))
    );
    assert_eq!(local_path_for("src/main.c"), None);
}
