use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use futures::lock::Mutex;
use hyper::body::{Bytes, HttpBody};
use hyper::header::{HeaderName, HeaderValue, ALLOW, CONTENT_LENGTH};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Response, Server};
use parking_lot::RwLock;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::Instrument;

use super::request::{json_response, HttpRequest, HttpResponder};
use super::router::{Lookup, Router};
use crate::config::AppSection;
use crate::context::{AppContext, Capability};
use crate::error::{Error, Result};
use crate::handler::{dispatch, Context, Handler, Reply, CORRELATION_ID_HEADER};
use crate::logger::Logger;

enum State {
    Idle,
    Running {
        addr: SocketAddr,
        stop: oneshot::Sender<()>,
        task: JoinHandle<hyper::Result<()>>,
    },
    Stopped,
}

/// The web-server capability.
///
/// Routes may be added before and after `listen`. Each request gets its own
/// [`Context`] over the application the server was attached to.
pub struct HttpServer {
    read_timeout: Duration,
    write_timeout: Duration,
    body_limit: usize,
    cors: bool,
    logger: Logger,
    router: RwLock<Router>,
    app: OnceLock<Weak<AppContext>>,
    state: Mutex<State>,
}

impl HttpServer {
    pub fn new(app: &AppSection, logger: Logger) -> Self {
        Self {
            read_timeout: app.read_timeout(),
            write_timeout: app.write_timeout(),
            body_limit: app.body_limit,
            cors: app.is_dev(),
            logger,
            router: RwLock::new(Router::default()),
            app: OnceLock::new(),
            state: Mutex::new(State::Idle),
        }
    }

    pub fn route(&self, method: Method, pattern: &str, handler: impl Handler) -> Result<()> {
        self.router.write().add(method, pattern, Arc::new(handler))
    }

    pub fn get(&self, pattern: &str, handler: impl Handler) -> Result<()> {
        self.route(Method::GET, pattern, handler)
    }

    pub fn post(&self, pattern: &str, handler: impl Handler) -> Result<()> {
        self.route(Method::POST, pattern, handler)
    }

    pub fn put(&self, pattern: &str, handler: impl Handler) -> Result<()> {
        self.route(Method::PUT, pattern, handler)
    }

    pub fn delete(&self, pattern: &str, handler: impl Handler) -> Result<()> {
        self.route(Method::DELETE, pattern, handler)
    }

    pub fn patch(&self, pattern: &str, handler: impl Handler) -> Result<()> {
        self.route(Method::PATCH, pattern, handler)
    }

    pub(crate) fn bind_context(&self, app: Weak<AppContext>) {
        let _ = self.app.set(app);
    }

    /// Address the server is listening on, once started.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        match &*self.state.lock().await {
            State::Running { addr, .. } => Some(*addr),
            _ => None,
        }
    }

    /// Binds `0.0.0.0:port` and serves in the background. Port 0 picks a
    /// free port; the bound address is returned. Listening again while
    /// running returns the current address.
    pub async fn listen(self: &Arc<Self>, port: u16) -> Result<SocketAddr> {
        let mut state = self.state.lock().await;
        match &*state {
            State::Running { addr, .. } => return Ok(*addr),
            State::Stopped => {
                return Err(Error::connection(
                    Capability::HttpServer,
                    "server was already shut down",
                ))
            }
            State::Idle => {}
        }

        let bind = SocketAddr::from(([0, 0, 0, 0], port));
        let builder =
            Server::try_bind(&bind).map_err(|e| Error::connection(Capability::HttpServer, e))?;
        let server = self.clone();
        let make_svc = make_service_fn(move |_conn| {
            let server = server.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    let server = server.clone();
                    let logger = server.logger.clone();
                    logger.attach(async move { Ok::<_, Infallible>(server.handle(req).await) })
                }))
            }
        });
        let running = builder.serve(make_svc);
        let addr = running.local_addr();
        let (stop, stopped) = oneshot::channel::<()>();
        let graceful = running.with_graceful_shutdown(async move {
            let _ = stopped.await;
        });
        let task = tokio::spawn(graceful);
        crate::log_info!(self.logger, "web server listening", addr = addr);
        *state = State::Running { addr, stop, task };
        Ok(addr)
    }

    /// Stops accepting connections and waits up to `deadline` for in-flight
    /// requests. Does nothing if the server is not running.
    pub async fn shutdown(&self, deadline: Duration) -> Result<()> {
        let mut state = self.state.lock().await;
        let State::Running { stop, mut task, .. } = std::mem::replace(&mut *state, State::Stopped)
        else {
            return Ok(());
        };
        let _ = stop.send(());
        match tokio::time::timeout(deadline, &mut task).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(Error::connection(Capability::HttpServer, e)),
            Ok(Err(e)) => Err(Error::connection(Capability::HttpServer, e)),
            Err(_) => {
                task.abort();
                Err(Error::ShutdownTimeout {
                    capability: Capability::HttpServer,
                    deadline,
                })
            }
        }
    }

    async fn handle(&self, req: hyper::Request<Body>) -> Response<Body> {
        let started = Instant::now();
        let (mut parts, body) = req.into_parts();
        let correlation_id = parts
            .headers
            .get(CORRELATION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        if let Ok(value) = HeaderValue::from_str(&correlation_id) {
            parts
                .headers
                .insert(HeaderName::from_static(CORRELATION_ID_HEADER), value);
        }
        let method = parts.method.clone();
        let path = parts.uri.path().to_string();
        let span = tracing::info_span!(
            "request",
            method = %method,
            path = %path,
            correlation_id = %correlation_id
        );

        let mut response = self
            .respond(parts, body, &method, &path)
            .instrument(span.clone())
            .await;

        if let Ok(value) = HeaderValue::from_str(&correlation_id) {
            response
                .headers_mut()
                .insert(HeaderName::from_static(CORRELATION_ID_HEADER), value);
        }
        if self.cors {
            allow_any_origin(&mut response);
        }
        span.in_scope(|| {
            tracing::info!(
                status = response.status().as_u16(),
                latency_ms = started.elapsed().as_millis() as u64,
                "request completed"
            )
        });
        response
    }

    async fn respond(
        &self,
        parts: hyper::http::request::Parts,
        body: Body,
        method: &Method,
        path: &str,
    ) -> Response<Body> {
        if self.cors && *method == Method::OPTIONS {
            let mut response = Response::new(Body::empty());
            *response.status_mut() = hyper::StatusCode::NO_CONTENT;
            return response;
        }
        let lookup = self.router.read().lookup(method, path);
        let (handler, params) = match lookup {
            Lookup::Found { handler, params } => (handler, params),
            Lookup::NotFound => {
                return json_response(Reply::error(404, "not_found", "route not found"))
            }
            Lookup::MethodNotAllowed(allowed) => {
                let mut response =
                    json_response(Reply::error(405, "method_not_allowed", "method not allowed"));
                let allowed = allowed
                    .iter()
                    .map(Method::as_str)
                    .collect::<Vec<_>>()
                    .join(", ");
                if let Ok(value) = HeaderValue::from_str(&allowed) {
                    response.headers_mut().insert(ALLOW, value);
                }
                return response;
            }
            Lookup::Malformed(message) => {
                return json_response(Reply::error(400, "bad_request", &message))
            }
        };

        let declared = parts
            .headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        if declared.is_some_and(|len| len > self.body_limit as u64) {
            return too_large(self.body_limit);
        }

        let body = match tokio::time::timeout(self.read_timeout, read_body(body, self.body_limit))
            .await
        {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(BodyError::TooLarge)) => return too_large(self.body_limit),
            Ok(Err(BodyError::Read(e))) => {
                return json_response(Reply::error(400, "bad_request", &e.to_string()));
            }
            Err(_) => {
                return json_response(Reply::error(408, "timeout", "request body read timed out"))
            }
        };

        let Some(app) = self.app.get().and_then(Weak::upgrade) else {
            return json_response(Reply::error(
                503,
                "unavailable",
                "application is not running",
            ));
        };
        let ctx = Context::new(app, Box::new(HttpRequest::new(parts, params, body)));
        match tokio::time::timeout(
            self.write_timeout,
            dispatch(handler.as_ref(), ctx, HttpResponder),
        )
        .await
        {
            Ok(response) => response,
            Err(_) => json_response(Reply::error(503, "timeout", "handler timed out")),
        }
    }
}

enum BodyError {
    TooLarge,
    Read(hyper::Error),
}

/// Collects the body, giving up as soon as it grows past `limit` bytes.
async fn read_body(mut body: Body, limit: usize) -> std::result::Result<Bytes, BodyError> {
    let mut collected = Vec::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk.map_err(BodyError::Read)?;
        if collected.len() + chunk.len() > limit {
            return Err(BodyError::TooLarge);
        }
        collected.extend_from_slice(&chunk);
    }
    Ok(Bytes::from(collected))
}

fn too_large(limit: usize) -> Response<Body> {
    json_response(Reply::error(
        413,
        "payload_too_large",
        &format!("request body exceeds {limit} bytes"),
    ))
}

fn allow_any_origin(response: &mut Response<Body>) {
    let headers = response.headers_mut();
    headers.insert(
        "access-control-allow-origin",
        HeaderValue::from_static("*"),
    );
    headers.insert(
        "access-control-allow-methods",
        HeaderValue::from_static("GET, POST, PUT, PATCH, DELETE, OPTIONS"),
    );
    headers.insert(
        "access-control-allow-headers",
        HeaderValue::from_static("*"),
    );
}
