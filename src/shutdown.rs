use std::time::Duration;

use futures::lock::Mutex;

use crate::context::{AppContext, Capability};
use crate::error::{display_chain, Error, LogError, Result, ShutdownFailure};

/// Releases every attached capability exactly once.
///
/// The web server is drained first, bounded by the deadline, so no request
/// is still using the resources released after it. Then the broker, the
/// policy engine and the database are closed, each regardless of earlier
/// failures. All failures are reported together, web server first.
#[derive(Default)]
pub(crate) struct ShutdownCoordinator {
    finished: Mutex<bool>,
}

impl ShutdownCoordinator {
    pub async fn shutdown(&self, ctx: &AppContext, deadline: Duration) -> Result<()> {
        let mut finished = self.finished.lock().await;
        if *finished {
            tracing::debug!("shutdown already ran");
            return Ok(());
        }
        *finished = true;
        tracing::info!(attached = ?ctx.attached(), "shutting down");

        let mut failures = vec![];
        if let Ok(server) = ctx.get_http_server() {
            record(&mut failures, Capability::HttpServer, server.shutdown(deadline).await);
        }
        if let Ok(publisher) = ctx.get_publisher() {
            record(&mut failures, Capability::Broker, publisher.close().await);
        }
        if let Ok(manager) = ctx.get_policy_manager() {
            record(&mut failures, Capability::PolicyEngine, manager.close().await);
        }
        if let Ok(pool) = ctx.get_database() {
            record(&mut failures, Capability::Database, pool.close().await);
        }

        if failures.is_empty() {
            tracing::info!("shutdown complete");
            Ok(())
        } else {
            Err(Error::ShutdownPartialFailure(failures))
        }
    }
}

fn record<E: std::fmt::Display + 'static>(
    failures: &mut Vec<ShutdownFailure>,
    capability: Capability,
    result: std::result::Result<(), E>,
) {
    if let Err(e) = result.log_with_context_passthrough(|| format!("closing {capability}")) {
        failures.push(ShutdownFailure {
            capability,
            reason: display_chain(&e),
        });
    }
}
