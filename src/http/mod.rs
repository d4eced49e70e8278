//! hyper transport for [`Handler`](crate::handler::Handler)s.

mod request;
mod router;
mod server;

pub use hyper::Method;
pub use server::HttpServer;
