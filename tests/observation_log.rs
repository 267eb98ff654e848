mod common;

use axum::body::Body;
use axum::http::Request;
use common::{test_config, ScriptedOracle};
use tower::ServiceExt;
use turnstile::{app, build_state};

#[tokio::test]
async fn every_request_writes_one_observation_line() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("observations.jsonl");
    let mut config = test_config(1);
    config.log_file = Some(path.to_string_lossy().to_string());
    let state = build_state(&config, ScriptedOracle::allowing()).unwrap();
    let router = app(state.clone());

    for _ in 0..2 {
        let req = Request::builder()
            .method("POST")
            .uri("/api/v1/hello")
            .header("content-type", "application/json")
            .header("x-forwarded-for", "10.4.0.1")
            .header("X-User-ID", "alice")
            .body(Body::from(r#"{"name":"world"}"#))
            .unwrap();
        router.clone().oneshot(req).await.unwrap();
    }

    state.observation_log.flush().await;
    assert_eq!(state.observation_log.lines_total(), 2);
    let content = std::fs::read_to_string(&path).unwrap();
    let outcomes: Vec<String> = content
        .lines()
        .map(|line| {
            let v: serde_json::Value = serde_json::from_str(line).unwrap();
            assert_eq!(v["transport"], "http");
            assert_eq!(v["method"], "POST /api/v1/hello");
            assert_eq!(v["schemaVersion"], 1);
            v["outcome"].as_str().unwrap().to_string()
        })
        .collect();
    assert_eq!(outcomes, vec!["success", "rate_limited"]);
}

#[tokio::test]
async fn unwritable_log_path_does_not_block_startup() {
    let mut config = test_config(5);
    config.log_file = Some("/nonexistent-dir/turnstile/obs.jsonl".to_string());
    let state = build_state(&config, ScriptedOracle::allowing()).unwrap();
    assert!(!state.observation_log.is_enabled());
    assert_eq!(state.observation_log.lines_total(), 0);
}
