//! App Kernel assembles a backend service from optional capabilities (web
//! server, relational pool, message-broker publisher, policy engine) around
//! one shared application context, and tears them down again in order.
//!
//! Configuration decides which capabilities are enabled; explicit options
//! can add or replace them. Request handlers receive a transport-agnostic
//! [`Context`](handler::Context) and return `anyhow::Result<T>` for any
//! serializable `T`.
//!
//! ```rust,no_run
//! use app_kernel::{handler::Context, options::with_instance, App};
//! use serde_json::{json, Value};
//!
//! struct Greeter {
//!     greeting: String,
//! }
//!
//! async fn hello(ctx: Context) -> anyhow::Result<Value> {
//!     let greeter = ctx.get_service_as::<Greeter>("greeter")?;
//!     let name = ctx.path_param("name")?;
//!     Ok(json!({ "message": format!("{}, {name}", greeter.greeting) }))
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     // config/config.yaml sets app.port, so a web server is attached
//!     let app = App::new(vec![with_instance(
//!         "greeter",
//!         Greeter {
//!             greeting: "hello".into(),
//!         },
//!     )])
//!     .await?;
//!     app.get("/hello/:name", hello)?;
//!     app.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! Services can also be declared with [`inject!`], which resolves each field
//! from the context by name:
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use app_kernel::{inject, logger::Logger, messaging::Publisher, options::with_injected};
//!
//! inject!(
//!     pub struct OrderEvents {
//!         publisher: Arc<Publisher>,
//!         logger: Logger,
//!     }
//! );
//!
//! let option = with_injected::<OrderEvents>("order_events");
//! ```

/// Assembled application, its builder and the run loop.
pub mod app;
/// Bearer-token authentication.
pub mod auth;
/// Layered configuration snapshot.
pub mod config;
/// Factories used to open external resources.
pub mod connectors;
/// The shared application context and capability kinds.
pub mod context;
/// Relational pool capability.
pub mod database;
/// Resolve dependencies from the application context.
pub mod dependency_injection;
/// Simple and versatile error handling and logging.
pub mod error;
/// Transport-agnostic request handling.
pub mod handler;
/// Liveness and health routes.
pub mod health;
/// hyper web-server capability.
pub mod http;
/// In-process transport.
pub mod local;
/// Structured logger owned by the application.
pub mod logger;
/// Broker publisher capability.
pub mod messaging;
/// NATS JetStream client.
#[cfg(feature = "nats")]
pub mod nats;
/// Built-in bootstrap options.
pub mod options;
/// Policy engine capability.
pub mod policy;
/// PostgreSQL pool and policy store.
#[cfg(feature = "postgres")]
pub mod postgres;
/// Concurrent store of named services.
pub mod registry;
mod shutdown;
/// Sleep dependencies that are easily swapped out and mocked.
pub mod time;

#[doc(hidden)]
pub use tracing as __tracing;

mod util;
pub use util::*;

pub use app::{App, AppBuilder};
pub use context::{AppContext, Capability};
pub use error::{Error, Result};
