use anyhow::Result;
use json_rpc_stream::config;
use json_rpc_stream::stream::{pipe, CorrelationEngine, EngineBuilder, HandlerRegistry};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn build_registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry
        .register_handler("echo", |params| async move { Ok(params.unwrap_or(Value::Null)) })
        .register_handler("add", |params| async move {
            let values: Vec<f64> = serde_json::from_value(params.unwrap_or_default())?;
            Ok(json!(values.iter().sum::<f64>()))
        })
        .register_notification_handler("log", |params| {
            info!(params = ?params, "Server received log notification");
        });
    registry
}

async fn client_task(client: CorrelationEngine) -> Result<()> {
    let echoed = client.call("echo", Some(json!({"hello": "world"}))).await?;
    info!(response = %serde_json::Value::Object(echoed), "Echo call finished");

    let sum = client.call("add", Some(json!([1.5, 2.5, 3.5]))).await?;
    info!(response = %serde_json::Value::Object(sum), "Add call finished");

    let missing = client.call("missing", None).await?;
    info!(response = %serde_json::Value::Object(missing), "Unknown method call finished");

    client
        .send(json!({"jsonrpc": "2.0", "method": "log", "params": ["client ready"]}))
        .await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::load();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&config.log_filter))
        .init();

    let registry = Arc::new(build_registry());
    let (server, server_stream) = EngineBuilder::new().dispatcher(registry.clone()).build();
    let (client, client_stream) = EngineBuilder::from_config(&config).build();

    // Connect both sides back to back.
    pipe(client_stream, server.clone());
    pipe(server_stream, client.clone());

    let mut notifications = client.subscribe_notifications();
    tokio::spawn(async move {
        while let Ok(notification) = notifications.recv().await {
            info!(method = %notification.method(), "Client received notification");
        }
    });

    let heartbeat_registry = registry.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(5));
        loop {
            interval.tick().await;
            heartbeat_registry.emit_notification("heartbeat", None);
        }
    });

    if let Err(e) = client_task(client.clone()).await {
        error!("Client task error: {}", e);
    }

    info!("Bridge running. Press Ctrl+C to exit.");
    tokio::signal::ctrl_c().await?;
    info!(pending = client.pending_count(), "Shutting down");

    Ok(())
}
