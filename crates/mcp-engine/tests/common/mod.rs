#![allow(dead_code)]

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use mcp_engine::{
    Engine, HandlerRegistry, Session, TransportKind,
    codec::Call,
    model::{ErrorData, JsonRpcMessage, RequestId, method},
    transport::{Outbound, OutboundReceiver, outbound_channel},
};
use serde_json::{Value, json};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "debug".to_string().into()),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

/// `echo`, `fail`, `panic` and `sleep`, plus `count` which bumps `calls`.
pub fn test_registry(calls: Arc<AtomicUsize>) -> HandlerRegistry {
    HandlerRegistry::new()
        .with_handler("echo", |params, _| async move {
            Ok::<_, ErrorData>(params.unwrap_or_else(|| json!({})))
        })
        .with_handler("fail", |_, _| async {
            Err::<Value, _>(ErrorData::internal_error("boom", None))
        })
        .with_handler("panic", |_, _| async {
            if true {
                panic!("handler blew up");
            }
            Ok::<_, ErrorData>(Value::Null)
        })
        .with_handler("sleep", |params, _| async move {
            let ms = params
                .as_ref()
                .and_then(|p| p.get("ms"))
                .and_then(Value::as_u64)
                .unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok::<_, ErrorData>(json!({ "slept": ms }))
        })
        .with_handler("count", move |_, _| {
            let calls = calls.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                Ok::<_, ErrorData>(json!({ "count": n }))
            }
        })
}

pub fn initialize_params(capabilities: Value) -> Value {
    json!({
        "protocolVersion": "2025-06-18",
        "capabilities": capabilities,
        "clientInfo": { "name": "test-client", "version": "1.0.0" }
    })
}

pub fn initialize_request(id: i64, capabilities: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "initialize",
        "params": initialize_params(capabilities),
    })
}

/// Initialize a session with an outbound queue, the way the stdio and stateful
/// HTTP transports do.
pub fn open_session(
    engine: &Engine,
    kind: TransportKind,
    capabilities: Value,
) -> anyhow::Result<(Arc<Session>, OutboundReceiver)> {
    let (tx, rx) = outbound_channel(engine.config().outbound_buffer);
    let call = Call {
        id: Some(RequestId::Number(0)),
        method: method::INITIALIZE.to_owned(),
        params: Some(initialize_params(capabilities)),
    };
    let (session, _) = engine.initialize(kind, &call, Some(tx), None)?;
    Ok((session, rx))
}

/// Next server-initiated message from the queue, failing after a second.
pub async fn next_message(rx: &mut OutboundReceiver) -> anyhow::Result<JsonRpcMessage> {
    match tokio::time::timeout(Duration::from_secs(1), rx.recv()).await? {
        Some(Outbound::Message(message)) => Ok(message),
        Some(Outbound::Response(bytes)) => Ok(serde_json::from_slice(&bytes)?),
        None => anyhow::bail!("outbound queue closed"),
    }
}

pub fn to_value(bytes: Option<Vec<u8>>) -> anyhow::Result<Value> {
    let bytes = bytes.ok_or_else(|| anyhow::anyhow!("expected a response body"))?;
    Ok(serde_json::from_slice(&bytes)?)
}
