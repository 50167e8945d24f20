use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use evr_adapters::{CandidateSource, FileCandidateSource, GenerationRequest};
use evr_core::{validate, RejectReason};
use serde_json::Value as JsonValue;

fn fixture_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/candidates-file/sample")
}

fn names(value: &JsonValue) -> Vec<String> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(ToOwned::to_owned))
                .collect()
        })
        .unwrap_or_default()
}

#[tokio::test]
async fn captured_reply_matches_snapshot() {
    let dir = fixture_dir();
    let expected: JsonValue =
        serde_json::from_str(&std::fs::read_to_string(dir.join("expected.json")).unwrap()).unwrap();

    let source = FileCandidateSource::new(dir.join("reply.txt"));
    let request = GenerationRequest::new(5, NaiveDate::from_ymd_opt(2027, 6, 30).unwrap());
    let batch = source.fetch_batch(&request).await.expect("batch");

    assert_eq!(batch.candidates.len() as u64, expected["candidates"].as_u64().unwrap());

    let mut valid = Vec::new();
    let mut incomplete = Vec::new();
    for raw in &batch.candidates {
        match validate(raw) {
            Ok(event) => valid.push(event.name),
            Err(RejectReason::Incomplete { missing }) => {
                assert_eq!(missing, vec!["location"]);
                incomplete.push(raw.label());
            }
            Err(other) => panic!("unexpected rejection {other}"),
        }
    }
    assert_eq!(valid, names(&expected["valid"]));
    assert_eq!(incomplete, names(&expected["incomplete"]));
}
