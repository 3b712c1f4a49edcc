// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::time::Duration;

use store::MappedFile;

use crate::proto::{InvokeTimings, InvokeWithFilesArgs, Request, Response};

#[test]
fn requests_are_tagged_by_method() {
    let encoded = serde_json::to_value(Request::Ping).unwrap();
    assert_eq!(encoded, serde_json::json!({"method": "Ping"}));

    let encoded = serde_json::to_value(Request::GetDaemonStats { reset: true }).unwrap();
    assert_eq!(
        encoded,
        serde_json::json!({"method": "GetDaemonStats", "params": {"reset": true}})
    );
}

#[test]
fn invoke_args_round_trip() {
    let args = InvokeWithFilesArgs {
        function: "llama-runtime".to_owned(),
        args: vec!["cc".to_owned(), "-c".to_owned(), "main.c".to_owned()],
        stdin: Some(b"\x00raw".to_vec()),
        files: vec![MappedFile::from_path("/src/main.c", "main.c")],
        outputs: vec![MappedFile::from_path("/out/main.o", "main.o")],
        trace: None,
        return_logs: true,
        drop_semaphore: true,
    };

    let encoded = serde_json::to_vec(&Request::InvokeWithFiles(args)).unwrap();
    let decoded: Request = serde_json::from_slice(&encoded).unwrap();
    let Request::InvokeWithFiles(args) = decoded else {
        panic!("wrong method decoded");
    };
    assert_eq!(args.function, "llama-runtime");
    assert_eq!(args.stdin, Some(b"\x00raw".to_vec()));
    assert_eq!(args.files.len(), 1);
    assert_eq!(args.outputs[0].remote, "main.o");
    assert!(args.return_logs && args.drop_semaphore);
}

#[test]
fn omitted_optional_fields_default() {
    let decoded: Request = serde_json::from_str(
        r#"{"method": "InvokeWithFiles", "params": {"function": "f", "args": ["true"]}}"#,
    )
    .unwrap();
    let Request::InvokeWithFiles(args) = decoded else {
        panic!("wrong method decoded");
    };
    assert_eq!(args.stdin, None);
    assert!(args.files.is_empty());
    assert!(!args.drop_semaphore);
}

#[test]
fn timings_serialise_as_nanos() {
    let timings = InvokeTimings {
        upload: Duration::from_millis(5),
        invoke: Duration::from_millis(40),
        fetch: Duration::from_millis(3),
        e2e: Duration::from_millis(50),
        remote: None,
    };
    let encoded = serde_json::to_value(timings).unwrap();
    assert_eq!(encoded["upload"], 5_000_000);
    assert_eq!(encoded["e2e"], 50_000_000);
}

#[test]
fn error_responses_round_trip() {
    let encoded = serde_json::to_vec(&Response::Error {
        message: "no such function".to_owned(),
    })
    .unwrap();
    let decoded: Response = serde_json::from_slice(&encoded).unwrap();
    match decoded {
        Response::Error { message } => assert_eq!(message, "no such function"),
        other => panic!("expected an error, got {other:?}"),
    }
}
