// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use maplit::hashmap;
use serde_json::json;

use hashing::ObjectId;

use crate::{Blob, File, FileAndPath, InvocationResponse, InvocationSpec};

#[test]
fn blob_tags() {
    assert_eq!(
        serde_json::to_value(Blob::Inline("hello".to_owned())).unwrap(),
        json!({"s": "hello"})
    );
    assert_eq!(
        serde_json::to_value(Blob::InlineBytes(vec![0xff, 0x00, 0x01])).unwrap(),
        json!({"b": "/wAB"})
    );
    let id = ObjectId::of_bytes(b"referenced");
    assert_eq!(
        serde_json::to_value(Blob::Ref(id)).unwrap(),
        json!({"r": id.to_hex()})
    );
    assert_eq!(
        serde_json::to_value(Blob::Err("boom".to_owned())).unwrap(),
        json!({"e": "boom"})
    );
}

#[test]
fn blob_round_trips() {
    for blob in [
        Blob::Inline("text".to_owned()),
        Blob::InlineBytes(b"\x00\x01\x02raw".to_vec()),
        Blob::Ref(ObjectId::of_bytes(b"x")),
        Blob::Err("nope".to_owned()),
    ] {
        let encoded = serde_json::to_string(&blob).unwrap();
        let decoded: Blob = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, blob);
    }
}

#[test]
fn file_flattens_blob_and_mode() {
    let file = FileAndPath {
        file: File {
            blob: Blob::Inline("content".to_owned()),
            mode: 0o755,
        },
        path: "bin/tool".to_owned(),
    };
    assert_eq!(
        serde_json::to_value(&file).unwrap(),
        json!({"s": "content", "m": 0o755, "p": "bin/tool"})
    );

    // A zero mode is omitted on the wire, and reads back as 0644.
    let plain: FileAndPath = serde_json::from_value(json!({"s": "x", "p": "a.txt"})).unwrap();
    assert_eq!(plain.file.mode, 0);
    assert_eq!(plain.file.effective_mode(), 0o644);
}

#[test]
fn spec_field_keys() {
    let spec = InvocationSpec {
        args: vec!["echo".to_owned(), "hello".to_owned()],
        stdin: Some(Blob::Inline("in".to_owned())),
        files: vec![],
        outputs: vec!["b.txt".to_owned()],
        trace: None,
    };
    let value = serde_json::to_value(&spec).unwrap();
    assert_eq!(
        value,
        json!({"args": ["echo", "hello"], "stdin": {"s": "in"}, "outputs": ["b.txt"]})
    );
}

#[test]
fn response_field_keys() {
    let response = InvocationResponse {
        status: 1,
        stdout: Some(Blob::Inline("out".to_owned())),
        stderr: None,
        outputs: vec![],
        inline_spans: vec![],
        spans: None,
        usage: None,
        times: None,
    };
    let value = serde_json::to_value(&response).unwrap();
    assert_eq!(value, json!({"status": 1, "stdout": {"s": "out"}}));

    let decoded: InvocationResponse =
        serde_json::from_value(json!({"status": 0, "outputs": [{"s": "data", "p": "b.txt"}]}))
            .unwrap();
    assert_eq!(decoded.outputs.len(), 1);
    assert_eq!(decoded.outputs[0].path, "b.txt");
}

#[test]
fn span_fields_round_trip() {
    let span = crate::Span {
        trace_id: "00c0ffee00c0ffee".to_owned(),
        span_id: "0123456789abcdef".to_owned(),
        parent_id: None,
        name: "upload".to_owned(),
        start: 1_700_000_000_000_000_000,
        duration: std::time::Duration::from_millis(12),
        fields: hashmap! {
            "files".to_owned() => serde_json::Value::from(3),
            "hot".to_owned() => serde_json::Value::from(true),
        },
    };
    let encoded = serde_json::to_string(&span).unwrap();
    let decoded: crate::Span = serde_json::from_str(&encoded).unwrap();
    assert_eq!(decoded.span_id, span.span_id);
    assert_eq!(decoded.duration, span.duration);
    assert_eq!(decoded.fields, span.fields);
}
