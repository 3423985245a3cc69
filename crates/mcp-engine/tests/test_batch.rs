use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use mcp_engine::{
    Engine, EngineConfig, EngineError, ExecutionMode, Permission, SequentialFaultPolicy, Session,
    TransportKind,
    codec::{self, Shape},
    model::ErrorCode,
};
use serde_json::{Value, json};

mod common;
use common::{init_tracing, open_session, test_registry, to_value};

fn engine_with(config: EngineConfig) -> (Engine, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let engine = Engine::builder()
        .registry(test_registry(calls.clone()))
        .config(config)
        .build();
    (engine, calls)
}

async fn call(engine: &Engine, session: &Arc<Session>, body: Value) -> anyhow::Result<Option<Value>> {
    let result = engine.handle_bytes(session, &serde_json::to_vec(&body)?).await?;
    match codec::encode(&result)? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

#[tokio::test]
async fn test_batch_responses_follow_input_order() -> anyhow::Result<()> {
    init_tracing();
    let (engine, calls) = engine_with(EngineConfig::default());
    let (session, _rx) = open_session(&engine, TransportKind::HttpStateful, json!({}))?;

    let response = call(
        &engine,
        &session,
        json!([
            {"jsonrpc": "2.0", "id": 1, "method": "echo", "params": {"n": 1}},
            {"jsonrpc": "2.0", "method": "count"},
            {"jsonrpc": "2.0", "id": 2, "method": "echo", "params": {"n": 2}}
        ]),
    )
    .await?
    .expect("batch with requests has a response");

    let responses = response.as_array().expect("array in, array out");
    assert_eq!(responses.len(), 2);
    assert_eq!(responses[0]["id"], 1);
    assert_eq!(responses[0]["result"], json!({"n": 1}));
    assert_eq!(responses[1]["id"], 2);
    assert_eq!(responses[1]["result"], json!({"n": 2}));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn test_single_object_gets_single_object() -> anyhow::Result<()> {
    let (engine, _) = engine_with(EngineConfig::default());
    let (session, _rx) = open_session(&engine, TransportKind::HttpStateful, json!({}))?;

    let response = call(
        &engine,
        &session,
        json!({"jsonrpc": "2.0", "id": "a", "method": "echo", "params": {"x": true}}),
    )
    .await?
    .expect("request has a response");
    assert!(response.is_object());
    assert_eq!(response["id"], "a");
    assert_eq!(response["result"]["x"], true);

    // a batch of one is still a batch
    let response = call(
        &engine,
        &session,
        json!([{"jsonrpc": "2.0", "id": "b", "method": "echo"}]),
    )
    .await?
    .expect("request has a response");
    assert_eq!(response.as_array().map(Vec::len), Some(1));
    Ok(())
}

#[tokio::test]
async fn test_notification_only_batch_has_no_body() -> anyhow::Result<()> {
    let (engine, calls) = engine_with(EngineConfig::default());
    let (session, _rx) = open_session(&engine, TransportKind::HttpStateful, json!({}))?;

    let result = engine
        .handle_bytes(
            &session,
            br#"[{"jsonrpc":"2.0","method":"count"},{"jsonrpc":"2.0","method":"count"}]"#,
        )
        .await?;
    assert_eq!(result.shape, Shape::Batch);
    assert!(result.is_empty());
    assert_eq!(codec::encode(&result)?, None);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    Ok(())
}

#[tokio::test]
async fn test_oversized_batch_runs_nothing() -> anyhow::Result<()> {
    let (engine, calls) = engine_with(EngineConfig {
        max_batch_size: 2,
        ..Default::default()
    });
    let (session, _rx) = open_session(&engine, TransportKind::HttpStateful, json!({}))?;

    let outcome = engine
        .handle_bytes(
            &session,
            br#"[
                {"jsonrpc":"2.0","id":1,"method":"count"},
                {"jsonrpc":"2.0","id":2,"method":"count"},
                {"jsonrpc":"2.0","id":3,"method":"count"}
            ]"#,
        )
        .await;
    let Err(EngineError::AdmissionRejected { size, max }) = outcome else {
        panic!("expected admission rejection, got {outcome:?}");
    };
    assert_eq!((size, max), (3, 2));
    tokio::task::yield_now().await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let error = EngineError::AdmissionRejected { size, max }.to_error_data();
    assert_eq!(error.code, ErrorCode::ADMISSION_REJECTED);

    // exactly at the limit is fine
    let response = call(
        &engine,
        &session,
        json!([
            {"jsonrpc": "2.0", "id": 1, "method": "count"},
            {"jsonrpc": "2.0", "id": 2, "method": "count"}
        ]),
    )
    .await?;
    assert_eq!(response.and_then(|r| r.as_array().map(Vec::len)), Some(2));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_parallel_batch_runs_concurrently_and_keeps_order() -> anyhow::Result<()> {
    let (engine, _) = engine_with(EngineConfig::default());
    let (session, _rx) = open_session(&engine, TransportKind::HttpStateful, json!({}))?;

    let started = tokio::time::Instant::now();
    let response = call(
        &engine,
        &session,
        json!([
            {"jsonrpc": "2.0", "id": 1, "method": "sleep", "params": {"ms": 300}},
            {"jsonrpc": "2.0", "id": 2, "method": "sleep", "params": {"ms": 100}},
            {"jsonrpc": "2.0", "id": 3, "method": "sleep", "params": {"ms": 200}}
        ]),
    )
    .await?
    .expect("batch with requests has a response");
    let elapsed = started.elapsed();

    let ids: Vec<&Value> = response
        .as_array()
        .expect("array")
        .iter()
        .map(|r| &r["id"])
        .collect();
    assert_eq!(ids, [&json!(1), &json!(2), &json!(3)]);
    assert!(elapsed < Duration::from_millis(600), "took {elapsed:?}");
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_sequential_batch_runs_one_at_a_time() -> anyhow::Result<()> {
    let (engine, _) = engine_with(EngineConfig {
        execution_mode: ExecutionMode::Sequential,
        ..Default::default()
    });
    let (session, _rx) = open_session(&engine, TransportKind::HttpStateful, json!({}))?;

    let started = tokio::time::Instant::now();
    call(
        &engine,
        &session,
        json!([
            {"jsonrpc": "2.0", "id": 1, "method": "sleep", "params": {"ms": 100}},
            {"jsonrpc": "2.0", "id": 2, "method": "sleep", "params": {"ms": 100}}
        ]),
    )
    .await?;
    assert!(started.elapsed() >= Duration::from_millis(200));
    Ok(())
}

#[tokio::test]
async fn test_sequential_skip_after_fault() -> anyhow::Result<()> {
    let (engine, calls) = engine_with(EngineConfig {
        execution_mode: ExecutionMode::Sequential,
        sequential_fault_policy: SequentialFaultPolicy::SkipRemaining,
        ..Default::default()
    });
    let (session, _rx) = open_session(&engine, TransportKind::HttpStateful, json!({}))?;

    let response = call(
        &engine,
        &session,
        json!([
            {"jsonrpc": "2.0", "id": 1, "method": "count"},
            {"jsonrpc": "2.0", "id": 2, "method": "fail"},
            {"jsonrpc": "2.0", "id": 3, "method": "count"},
            {"jsonrpc": "2.0", "method": "count"}
        ]),
    )
    .await?
    .expect("batch with requests has a response");
    let responses = response.as_array().expect("array");

    assert_eq!(responses.len(), 3);
    assert_eq!(responses[0]["result"]["count"], 1);
    assert_eq!(responses[1]["error"]["code"], ErrorCode::INTERNAL_ERROR.0);
    assert_eq!(responses[2]["id"], 3);
    assert_eq!(responses[2]["error"]["code"], ErrorCode::SKIPPED.0);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn test_sequential_continue_after_fault() -> anyhow::Result<()> {
    let (engine, calls) = engine_with(EngineConfig {
        execution_mode: ExecutionMode::Sequential,
        ..Default::default()
    });
    let (session, _rx) = open_session(&engine, TransportKind::HttpStateful, json!({}))?;

    let response = call(
        &engine,
        &session,
        json!([
            {"jsonrpc": "2.0", "id": 1, "method": "fail"},
            {"jsonrpc": "2.0", "id": 2, "method": "count"}
        ]),
    )
    .await?
    .expect("batch with requests has a response");
    assert_eq!(response[0]["error"]["code"], ErrorCode::INTERNAL_ERROR.0);
    assert_eq!(response[1]["result"]["count"], 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn test_item_errors_are_isolated() -> anyhow::Result<()> {
    let (engine, _) = engine_with(EngineConfig::default());
    let (session, _rx) = open_session(&engine, TransportKind::HttpStateful, json!({}))?;

    let response = call(
        &engine,
        &session,
        json!([
            {"jsonrpc": "2.0", "id": 1, "method": "panic"},
            {"jsonrpc": "2.0", "id": 2, "method": "nope"},
            {"jsonrpc": "2.0", "id": 3},
            42,
            {"jsonrpc": "2.0", "id": 4, "method": "initialize"},
            {"jsonrpc": "2.0", "id": 5, "method": "echo", "params": {"ok": true}}
        ]),
    )
    .await?
    .expect("batch with requests has a response");
    let responses = response.as_array().expect("array");

    assert_eq!(responses.len(), 6);
    assert_eq!(responses[0]["error"]["code"], ErrorCode::INTERNAL_ERROR.0);
    assert_eq!(responses[0]["error"]["message"], "handler panicked");
    assert_eq!(responses[1]["error"]["code"], ErrorCode::METHOD_NOT_FOUND.0);
    assert_eq!(responses[2]["id"], 3);
    assert_eq!(responses[2]["error"]["code"], ErrorCode::INVALID_REQUEST.0);
    assert_eq!(responses[3]["id"], Value::Null);
    assert_eq!(responses[3]["error"]["code"], ErrorCode::INVALID_REQUEST.0);
    assert_eq!(responses[4]["error"]["code"], ErrorCode::INVALID_REQUEST.0);
    assert_eq!(responses[5]["result"]["ok"], true);
    Ok(())
}

#[tokio::test]
async fn test_malformed_envelopes() -> anyhow::Result<()> {
    let (engine, _) = engine_with(EngineConfig::default());
    let (session, _rx) = open_session(&engine, TransportKind::HttpStateful, json!({}))?;

    let outcome = engine.handle_bytes(&session, b"[]").await;
    assert!(matches!(outcome, Err(EngineError::MalformedEnvelope(_))));

    let outcome = engine.handle_bytes(&session, b"{not json").await;
    let error = outcome.expect_err("garbage is rejected").to_error_data();
    assert_eq!(error.code, ErrorCode::PARSE_ERROR);

    let body = to_value(mcp_engine::engine::encode_outcome(
        engine.handle_bytes(&session, b"[]").await,
    ))?;
    assert_eq!(body["id"], Value::Null);
    assert_eq!(body["error"]["code"], ErrorCode::INVALID_REQUEST.0);
    Ok(())
}

#[tokio::test]
async fn test_permission_denied_is_per_item() -> anyhow::Result<()> {
    let calls = Arc::new(AtomicUsize::new(0));
    let engine = Engine::builder()
        .registry(test_registry(calls.clone()))
        .permission(|_: &Session, method: &str| {
            if method == "count" {
                Permission::Deny
            } else {
                Permission::Allow
            }
        })
        .build();
    let (session, _rx) = open_session(&engine, TransportKind::HttpStateful, json!({}))?;

    let response = call(
        &engine,
        &session,
        json!([
            {"jsonrpc": "2.0", "id": 1, "method": "count"},
            {"jsonrpc": "2.0", "id": 2, "method": "echo"}
        ]),
    )
    .await?
    .expect("batch with requests has a response");
    assert_eq!(response[0]["error"]["code"], ErrorCode::FORBIDDEN.0);
    assert_eq!(response[1]["result"], json!({}));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    Ok(())
}
