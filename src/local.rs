//! In-process transport: runs handlers without a network hop, for jobs,
//! consumers and tests.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;

use crate::handler::{Reply, Request, Responder};

#[derive(Debug, Clone, Default)]
pub struct LocalRequest {
    method: String,
    path: String,
    params: HashMap<String, String>,
    query: HashMap<String, String>,
    headers: HashMap<String, String>,
    host: String,
    body: Vec<u8>,
}

impl LocalRequest {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            host: "localhost".into(),
            ..Default::default()
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(name.into(), value.into());
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_json<T: Serialize>(self, body: &T) -> serde_json::Result<Self> {
        Ok(self.with_body(serde_json::to_vec(body)?))
    }
}

impl Request for LocalRequest {
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
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    fn host_name(&self) -> &str {
        &self.host
    }

    fn body(&self) -> &[u8] {
        &self.body
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocalResponse {
    pub status: u16,
    pub body: Option<Value>,
}

impl LocalResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

pub struct LocalResponder;

impl Responder for LocalResponder {
    type Output = LocalResponse;

    fn respond(self, reply: Reply) -> LocalResponse {
        LocalResponse {
            status: reply.status,
            body: reply.body,
        }
    }
}
