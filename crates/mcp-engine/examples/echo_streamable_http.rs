use anyhow::Result;
use mcp_engine::{
    Engine, EngineConfig, HandlerRegistry,
    model::{ErrorData, ServerCapabilities},
    transport::{StreamableHttpServerConfig, StreamableHttpService},
};
use serde_json::Value;
use tracing_subscriber::{self, EnvFilter};

const BIND_ADDRESS: &str = "127.0.0.1:8000";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "debug".to_string().into()),
        )
        .init();

    let registry = HandlerRegistry::new().with_handler("echo", |params, _| async move {
        Ok::<_, ErrorData>(params.unwrap_or(Value::Null))
    });
    let engine = Engine::builder()
        .registry(registry)
        .capabilities(
            ServerCapabilities::builder()
                .enable_resources_subscribe()
                .enable_tools_list_changed()
                .build(),
        )
        .config(EngineConfig::from_env())
        .build();
    let reaper = engine.spawn_reaper();

    let service = StreamableHttpService::new(
        engine.clone(),
        StreamableHttpServerConfig {
            cancellation_token: engine.cancellation_token().child_token(),
            ..Default::default()
        },
    );
    let router = service.router();
    let listener = tokio::net::TcpListener::bind(BIND_ADDRESS).await?;
    tracing::info!("listening on http://{BIND_ADDRESS}/");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await?;

    engine.shutdown();
    if let Some(reaper) = reaper {
        let _ = reaper.await;
    }
    Ok(())
}
