use std::collections::HashMap;

use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::http::request::Parts;
use hyper::http::uri::Authority;
use hyper::{Body, HeaderMap, Response, StatusCode};

use url::form_urlencoded;

use crate::handler::{Reply, Request, Responder};

/// A buffered hyper request.
pub(crate) struct HttpRequest {
    method: String,
    path: String,
    params: HashMap<String, String>,
    query: HashMap<String, String>,
    headers: HeaderMap,
    host: String,
    body: Bytes,
}

impl HttpRequest {
    pub fn new(parts: Parts, params: HashMap<String, String>, body: Bytes) -> Self {
        let host = parts
            .headers
            .get(hyper::header::HOST)
            .and_then(|h| h.to_str().ok())
            .and_then(|h| h.parse::<Authority>().ok())
            .map(|authority| authority.host().to_string())
            .or_else(|| parts.uri.host().map(str::to_string))
            .unwrap_or_default();
        Self {
            method: parts.method.to_string(),
            path: parts.uri.path().to_string(),
            params,
            query: parse_query(parts.uri.query().unwrap_or("")),
            headers: parts.headers,
            host,
            body,
        }
    }
}

fn parse_query(query: &str) -> HashMap<String, String> {
    form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect()
}

impl Request for HttpRequest {
    fn method(&self) -> &str {
        &self.method
    }

    fn path(&self) -> &str {
        &self.path
    }

    fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    fn query(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    fn host_name(&self) -> &str {
        &self.host
    }

    fn body(&self) -> &[u8] {
        &self.body
    }
}

pub(crate) struct HttpResponder;

impl Responder for HttpResponder {
    type Output = Response<Body>;

    fn respond(self, reply: Reply) -> Response<Body> {
        json_response(reply)
    }
}

pub(crate) fn json_response(reply: Reply) -> Response<Body> {
    let status = StatusCode::from_u16(reply.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = match reply.body {
        None => Response::new(Body::empty()),
        Some(value) => {
            let mut response = Response::new(Body::from(value.to_string()));
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
    };
    *response.status_mut() = status;
    response
}
