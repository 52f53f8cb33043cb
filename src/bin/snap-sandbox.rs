//! Sandbox program for the process runtime.
//!
//! Speaks the host protocol on stdin/stdout and serves a few compiled-in
//! snaps, selected by the `source` of each snap in the host config.

use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

use snap_exec::capability::builtin::{MANAGE_STATE, NOTIFY};
use snap_exec::guest::{Snap, SnapEnvironment, SnapExecutor, SnapRegistry};
use snap_exec::runtime::process::stdio_port;
use snap_exec::snap::HandlerType;

/// Returns what it was called with.
struct Echo;

#[async_trait]
impl Snap for Echo {
    async fn on_request(
        &self,
        handler: HandlerType,
        origin: &str,
        request: Value,
        env: &SnapEnvironment,
    ) -> Result<Value> {
        Ok(json!({
            "handler": handler,
            "origin": origin,
            "request": request,
            "endowments": env.endowments().collect::<Vec<_>>(),
        }))
    }
}

/// Persistent counter kept in the snap's managed state.
struct Counter;

#[async_trait]
impl Snap for Counter {
    async fn on_request(
        &self,
        _handler: HandlerType,
        _origin: &str,
        request: Value,
        env: &SnapEnvironment,
    ) -> Result<Value> {
        let state = env.request(MANAGE_STATE, json!({"operation": "get"})).await?;
        let count = state["count"].as_u64().unwrap_or(0);
        match request["method"].as_str() {
            Some("get") => Ok(json!(count)),
            Some("increment") => {
                let count = count + 1;
                env.request(
                    MANAGE_STATE,
                    json!({"operation": "update", "newState": {"count": count}}),
                )
                .await?;
                if env.has(NOTIFY) && count % 10 == 0 {
                    env.request(
                        NOTIFY,
                        json!({"type": "inApp", "message": format!("Counter reached {count}")}),
                    )
                    .await?;
                }
                Ok(json!(count))
            }
            Some("reset") => {
                env.request(MANAGE_STATE, json!({"operation": "clear"})).await?;
                Ok(json!(0))
            }
            other => bail!("unknown counter method: {other:?}"),
        }
    }
}

#[tokio::main]
async fn main() {
    // stdout carries the protocol; the host forwards stderr to its log
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("snap_exec=warn")),
        )
        .init();

    let snaps = SnapRegistry::new()
        .with("echo", Arc::new(Echo))
        .with("counter", Arc::new(Counter));

    SnapExecutor::new(stdio_port("sandbox"), Arc::new(snaps))
        .run()
        .await;
}
