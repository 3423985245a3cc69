use anyhow::Result;
use mcp_engine::{
    Engine, EngineConfig, HandlerRegistry,
    model::{ErrorData, ServerCapabilities},
    transport::{serve_stdio, stdio},
};
use serde_json::{Value, json};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries the protocol, so logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::DEBUG.into()))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let registry = HandlerRegistry::new()
        .with_handler("echo", |params, _| async move {
            Ok::<_, ErrorData>(params.unwrap_or(Value::Null))
        })
        .with_handler("countdown", |params, context| async move {
            let from = params
                .as_ref()
                .and_then(|p| p.get("from"))
                .and_then(Value::as_u64)
                .unwrap_or(3);
            for step in 0..from {
                context
                    .report_progress((step + 1) as f64, Some(from as f64), None)
                    .await?;
            }
            Ok::<_, ErrorData>(json!({ "done": from }))
        });

    let engine = Engine::builder()
        .registry(registry)
        .capabilities(ServerCapabilities::builder().enable_logging().build())
        .instructions("Echoes params back; `countdown` reports progress")
        .config(EngineConfig::from_env())
        .build();

    tracing::info!("serving on stdio");
    serve_stdio(engine.clone(), stdio())
        .await
        .inspect_err(|e| tracing::error!("serving error: {:?}", e))?;
    engine.shutdown();
    Ok(())
}
