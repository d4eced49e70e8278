use std::collections::HashMap;
use std::sync::Arc;

use hyper::Method;
use regex::Regex;

use crate::error::{Error, Result};
use crate::handler::Handler;

struct Route {
    method: Method,
    pattern: String,
    regex: Regex,
    names: Vec<String>,
    handler: Arc<dyn Handler>,
}

pub(crate) enum Lookup {
    Found {
        handler: Arc<dyn Handler>,
        params: HashMap<String, String>,
    },
    MethodNotAllowed(Vec<Method>),
    NotFound,
    /// A captured segment is not valid percent-encoded UTF-8.
    Malformed(String),
}

/// Method and path table. Segments starting with `:` capture one path
/// segment under that name.
#[derive(Default)]
pub(crate) struct Router {
    routes: Vec<Route>,
}

impl Router {
    /// Adds a route. Registering the same method and pattern again
    /// replaces the handler.
    pub fn add(&mut self, method: Method, pattern: &str, handler: Arc<dyn Handler>) -> Result<()> {
        let (regex, names) = compile(pattern)?;
        if let Some(existing) = self
            .routes
            .iter_mut()
            .find(|r| r.method == method && r.pattern == pattern)
        {
            existing.handler = handler;
            return Ok(());
        }
        self.routes.push(Route {
            method,
            pattern: pattern.to_string(),
            regex,
            names,
            handler,
        });
        Ok(())
    }

    pub fn lookup(&self, method: &Method, path: &str) -> Lookup {
        let mut allowed = vec![];
        for route in &self.routes {
            let Some(captures) = route.regex.captures(path) else {
                continue;
            };
            if &route.method != method {
                allowed.push(route.method.clone());
                continue;
            }
            let mut params = HashMap::new();
            for (name, value) in route.names.iter().zip(captures.iter().skip(1)) {
                let Some(value) = value else { continue };
                match urlencoding::decode(value.as_str()) {
                    Ok(decoded) => params.insert(name.clone(), decoded.into_owned()),
                    Err(_) => {
                        return Lookup::Malformed(format!(
                            "path parameter `{name}` is not valid UTF-8"
                        ))
                    }
                };
            }
            return Lookup::Found {
                handler: route.handler.clone(),
                params,
            };
        }
        if allowed.is_empty() {
            Lookup::NotFound
        } else {
            Lookup::MethodNotAllowed(allowed)
        }
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }
}

fn compile(pattern: &str) -> Result<(Regex, Vec<String>)> {
    let invalid = |reason: &str| Error::ConfigurationInvalid {
        field: format!("route `{pattern}`"),
        reason: reason.to_string(),
    };
    if !pattern.starts_with('/') {
        return Err(invalid("must start with `/`"));
    }
    let mut names = vec![];
    let mut source = String::from("^");
    for segment in pattern.split('/').skip(1) {
        source.push('/');
        match segment.strip_prefix(':') {
            Some("") => return Err(invalid("empty parameter name")),
            Some(name) => {
                names.push(name.to_string());
                source.push_str("([^/]+)");
            }
            None => source.push_str(&regex::escape(segment)),
        }
    }
    source.push('$');
    let regex = Regex::new(&source).map_err(|e| invalid(&e.to_string()))?;
    Ok((regex, names))
}
