//! Transport-agnostic request handling.
//!
//! A transport wraps each inbound unit of work in a [`Context`] (the shared
//! [`AppContext`] plus a [`Request`]), runs the [`Handler`] through
//! [`dispatch`], and turns the resulting [`Reply`] into its own response type
//! with a [`Responder`]. Every path through `dispatch` produces a reply,
//! including handler panics.

use std::future::Future;
use std::ops::Deref;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};

use crate::auth::Claims;
use crate::context::AppContext;
use crate::error::{display_error, Error};

pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

/// Read access to one inbound request, whatever carried it.
pub trait Request: Send + Sync {
    fn method(&self) -> &str;

    fn path(&self) -> &str;

    /// Named path parameter, e.g. `id` for a route `/orders/:id`.
    fn param(&self, name: &str) -> Option<&str>;

    fn query(&self, name: &str) -> Option<&str>;

    /// Header lookup; names are case-insensitive.
    fn header(&self, name: &str) -> Option<&str>;

    fn host_name(&self) -> &str;

    fn body(&self) -> &[u8];
}

/// What a handler sees: the application plus the current request.
pub struct Context {
    app: Arc<AppContext>,
    request: Box<dyn Request>,
    claims: Option<Claims>,
}

impl Context {
    pub fn new(app: Arc<AppContext>, request: Box<dyn Request>) -> Self {
        Self {
            app,
            request,
            claims: None,
        }
    }

    pub fn app(&self) -> &Arc<AppContext> {
        &self.app
    }

    pub fn request(&self) -> &dyn Request {
        self.request.as_ref()
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.request.param(name)
    }

    /// Path parameter that the route guarantees, as a `BadRequest` if absent.
    pub fn path_param(&self, name: &str) -> Result<&str, HandlerError> {
        self.param(name)
            .ok_or_else(|| HandlerError::BadRequest(format!("missing path parameter `{name}`")))
    }

    pub fn query(&self, name: &str) -> Option<&str> {
        self.request.query(name)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.request.header(name)
    }

    pub fn host_name(&self) -> &str {
        self.request.host_name()
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.request.header(CORRELATION_ID_HEADER)
    }

    /// Claims of the bearer token, for handlers wrapped with
    /// [`authenticated`](crate::auth::authenticated).
    pub fn claims(&self) -> Option<&Claims> {
        self.claims.as_ref()
    }

    pub fn user_id(&self) -> Result<&str, HandlerError> {
        self.claims
            .as_ref()
            .map(|c| c.user_id.as_str())
            .ok_or_else(|| HandlerError::Unauthorized("request is not authenticated".into()))
    }

    pub(crate) fn set_claims(&mut self, claims: Claims) {
        self.claims = Some(claims);
    }

    /// Deserializes the JSON body.
    pub fn bind<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        serde_json::from_slice(self.request.body())
            .map_err(|e| HandlerError::BadRequest(format!("invalid request body: {e}")))
    }
}

impl Deref for Context {
    type Target = AppContext;

    fn deref(&self) -> &AppContext {
        &self.app
    }
}

/// Errors with a fixed meaning to the caller. Anything else a handler
/// returns is treated as internal, unless it is one of the crate's own
/// errors, which carry their own status.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Unavailable(String),
    #[error("{0}")]
    Internal(String),
}

impl HandlerError {
    pub fn status_code(&self) -> u16 {
        match self {
            HandlerError::NotFound(_) => 404,
            HandlerError::BadRequest(_) => 400,
            HandlerError::Unauthorized(_) => 401,
            HandlerError::Unavailable(_) => 503,
            HandlerError::Internal(_) => 500,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            HandlerError::NotFound(_) => "not_found",
            HandlerError::BadRequest(_) => "bad_request",
            HandlerError::Unauthorized(_) => "unauthorized",
            HandlerError::Unavailable(_) => "unavailable",
            HandlerError::Internal(_) => "internal",
        }
    }
}

pub type HandlerFuture = BoxFuture<'static, anyhow::Result<Value>>;

/// Request handler. Implemented for every
/// `Fn(Context) -> impl Future<Output = anyhow::Result<T>>` with a
/// serializable `T`.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, ctx: Context) -> HandlerFuture;
}

impl<F, Fut, T> Handler for F
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    T: Serialize,
{
    fn call(&self, ctx: Context) -> HandlerFuture {
        let fut = self(ctx);
        Box::pin(async move {
            let value = fut.await?;
            Ok(serde_json::to_value(value)?)
        })
    }
}

/// Outcome of a handler, ready for a transport to encode.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub status: u16,
    /// `None` for an empty success body.
    pub body: Option<Value>,
}

impl Reply {
    pub fn error(status: u16, kind: &str, message: &str) -> Self {
        Self {
            status,
            body: Some(json!({
                "error": { "code": status, "kind": kind, "message": message }
            })),
        }
    }

    /// `Null` results become 204, other results 200, errors are mapped by
    /// kind.
    pub fn from_result(result: anyhow::Result<Value>) -> Self {
        match result {
            Ok(Value::Null) => Self {
                status: 204,
                body: None,
            },
            Ok(value) => Self {
                status: 200,
                body: Some(value),
            },
            Err(e) => Self::from_error(&e),
        }
    }

    fn from_error(e: &anyhow::Error) -> Self {
        let (status, kind) = if let Some(err) = e.downcast_ref::<HandlerError>() {
            (err.status_code(), err.kind())
        } else if let Some(err) = e.downcast_ref::<Error>() {
            (err.status_code(), err.kind())
        } else {
            (500, "internal")
        };
        if status >= 500 {
            tracing::error!(status, error = %display_error(e), "handler failed");
        } else {
            tracing::debug!(status, error = %e, "handler rejected request");
        }
        Self::error(status, kind, &e.to_string())
    }
}

/// Turns a [`Reply`] into a transport-specific response.
pub trait Responder {
    type Output;

    fn respond(self, reply: Reply) -> Self::Output;
}

/// Runs `handler` and hands its outcome to `responder`.
pub async fn dispatch<R: Responder>(handler: &dyn Handler, ctx: Context, responder: R) -> R::Output {
    let outcome = AssertUnwindSafe(handler.call(ctx)).catch_unwind().await;
    let reply = match outcome {
        Ok(result) => Reply::from_result(result),
        Err(_) => {
            tracing::error!("handler panicked");
            Reply::error(500, "internal", "internal error")
        }
    };
    responder.respond(reply)
}
