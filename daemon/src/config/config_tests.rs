// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use tempfile::TempDir;

use crate::config::Config;

#[test]
fn missing_config_file_yields_defaults() {
    let dir = TempDir::new().unwrap();
    let config = Config::load(dir.path()).unwrap();
    assert_eq!(config.object_store, "");
    assert_eq!(config.idle_timeout_secs, 15 * 60);
    assert!(!config.disable_head_check);
}

#[test]
fn partial_config_keeps_defaults_for_the_rest() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("llama.json"),
        r#"{"object_store": "s3://bucket/llama/", "aws_region": "us-west-2"}"#,
    )
    .unwrap();

    let config = Config::load(dir.path()).unwrap();
    assert_eq!(config.object_store, "s3://bucket/llama/");
    assert_eq!(config.aws_region, "us-west-2");
    assert_eq!(config.disk_cache_bytes, 10 * 1024 * 1024 * 1024);
}

#[test]
fn malformed_config_is_an_error() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("llama.json"), "{not json").unwrap();
    assert!(Config::load(dir.path()).is_err());
}
