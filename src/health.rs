use serde_json::{json, Map, Value};

use crate::context::Capability;
use crate::error::{display_chain, LogError, Result};
use crate::handler::{Context, HandlerError};
use crate::http::HttpServer;

pub const ALIVE_PATH: &str = "/.well-known/alive";
pub const HEALTH_PATH: &str = "/.well-known/health";

pub(crate) fn register(server: &HttpServer) -> Result<()> {
    server.get(ALIVE_PATH, alive)?;
    server.get(HEALTH_PATH, health)
}

async fn alive(_ctx: Context) -> anyhow::Result<Value> {
    Ok(json!({ "status": "alive" }))
}

/// Pings the database and reports every attached capability. Any failed
/// check turns the whole response into a 503.
async fn health(ctx: Context) -> anyhow::Result<Value> {
    let mut capabilities = Map::new();
    let mut failed = vec![];
    for capability in ctx.attached() {
        let status = match capability {
            Capability::Database => {
                let checked = match ctx.get_database() {
                    Ok(pool) => pool.ping().await,
                    Err(e) => Err(e.into()),
                };
                match checked.log_with_context_passthrough(|| "database health check".into()) {
                    Ok(()) => "up".to_string(),
                    Err(e) => {
                        failed.push(format!("{capability}: {}", display_chain(&e)));
                        "down".to_string()
                    }
                }
            }
            _ => "attached".to_string(),
        };
        capabilities.insert(capability.to_string(), Value::String(status));
    }
    if !failed.is_empty() {
        return Err(HandlerError::Unavailable(failed.join("; ")).into());
    }
    Ok(json!({
        "status": "ok",
        "service": ctx.settings().app_name(),
        "capabilities": capabilities,
    }))
}
