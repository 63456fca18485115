//! Route registration and the compiled dispatch table.
//!
//! Patterns are split on `/`; a segment is a literal, a `:name` parameter
//! (capturing one non-empty segment) or a trailing `*name` wildcard
//! (capturing the rest of the path). Static patterns go into an O(1) map;
//! dynamic patterns are scanned in insertion order, first match wins.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::http::{Method, Params};
use crate::pipeline::{ArcHandler, Handler, Middleware, compose};

/// Identifier of a compiled (composed) handler in the route table.
pub type HandlerId = u32;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
    Wildcard(String),
}

#[derive(Clone)]
struct CompiledRoute {
    method: Option<Method>,
    segments: Vec<Segment>,
    handler: HandlerId,
}

struct RouteDef {
    method: Option<Method>,
    pattern: String,
    handler: ArcHandler,
    middleware: Vec<Arc<dyn Middleware>>,
}

/// Route registration surface. Compiled once at bind time into a
/// [`RouteTable`]; never mutated while serving (hot reload swaps the whole
/// table).
#[derive(Default)]
pub struct Router {
    routes: Vec<RouteDef>,
    global: Vec<Arc<dyn Middleware>>,
}

/// Chaining view of a just-added route, for attaching route-local
/// middleware.
pub struct RouteRef<'a> {
    def: &'a mut RouteDef,
}

impl RouteRef<'_> {
    /// Attach middleware to this route only. Runs inside the global stack.
    pub fn layer(self, mw: impl Middleware) -> Self {
        self.def.middleware.push(Arc::new(mw));
        self
    }

    pub fn layer_arc(self, mw: Arc<dyn Middleware>) -> Self {
        self.def.middleware.push(mw);
        self
    }
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register global middleware; wraps every route, outermost-first in
    /// registration order.
    pub fn wrap(&mut self, mw: impl Middleware) -> &mut Self {
        self.global.push(Arc::new(mw));
        self
    }

    pub fn wrap_arc(&mut self, mw: Arc<dyn Middleware>) -> &mut Self {
        self.global.push(mw);
        self
    }

    pub fn add(&mut self, method: Method, pattern: &str, handler: impl Handler) -> RouteRef<'_> {
        self.push(Some(method), pattern, Arc::new(handler))
    }

    /// Register a wildcard-method route, matched after every specific method
    /// fails.
    pub fn any(&mut self, pattern: &str, handler: impl Handler) -> RouteRef<'_> {
        self.push(None, pattern, Arc::new(handler))
    }

    fn push(&mut self, method: Option<Method>, pattern: &str, handler: ArcHandler) -> RouteRef<'_> {
        self.routes.push(RouteDef {
            method,
            pattern: pattern.to_string(),
            handler,
            middleware: Vec::new(),
        });
        RouteRef { def: self.routes.last_mut().expect("just pushed") }
    }

    pub fn get(&mut self, pattern: &str, handler: impl Handler) -> RouteRef<'_> {
        self.add(Method::Get, pattern, handler)
    }
    pub fn post(&mut self, pattern: &str, handler: impl Handler) -> RouteRef<'_> {
        self.add(Method::Post, pattern, handler)
    }
    pub fn put(&mut self, pattern: &str, handler: impl Handler) -> RouteRef<'_> {
        self.add(Method::Put, pattern, handler)
    }
    pub fn delete(&mut self, pattern: &str, handler: impl Handler) -> RouteRef<'_> {
        self.add(Method::Delete, pattern, handler)
    }
    pub fn patch(&mut self, pattern: &str, handler: impl Handler) -> RouteRef<'_> {
        self.add(Method::Patch, pattern, handler)
    }
    pub fn head(&mut self, pattern: &str, handler: impl Handler) -> RouteRef<'_> {
        self.add(Method::Head, pattern, handler)
    }
    pub fn options(&mut self, pattern: &str, handler: impl Handler) -> RouteRef<'_> {
        self.add(Method::Options, pattern, handler)
    }

    /// Compile the table: compose middleware per route, split static from
    /// dynamic patterns, reject duplicate `(method, pattern)` pairs.
    pub fn compile(&self) -> Result<RouteTable> {
        self.compile_with(&[])
    }

    /// Compile with an extra middleware prefix wrapped outside the global
    /// stack. The server uses this to install configuration-driven
    /// middleware (rate limit, security headers, CORS, sessions).
    pub fn compile_with(&self, outer: &[Arc<dyn Middleware>]) -> Result<RouteTable> {
        let mut table = RouteTable::default();
        let mut seen: HashSet<(String, String)> = HashSet::new();

        for def in &self.routes {
            let method_token = def.method.map_or("*", |m| m.as_str()).to_string();
            if !seen.insert((method_token.clone(), def.pattern.clone())) {
                return Err(Error::RouteConflict {
                    method: method_token,
                    pattern: def.pattern.clone(),
                });
            }

            let segments = compile_pattern(&def.pattern)?;
            let is_static = segments
                .iter()
                .all(|s| matches!(s, Segment::Literal(_)));

            // Effective stack: configured prefix, then global middleware,
            // then route-local.
            let mut stack = outer.to_vec();
            stack.extend(self.global.iter().cloned());
            stack.extend(def.middleware.iter().cloned());
            let composed = compose(&stack, def.handler.clone());

            let id = table.handlers.len() as HandlerId;
            table.handlers.push(composed);

            if is_static {
                let path = normalize_static(&def.pattern);
                match def.method {
                    Some(m) => {
                        table.static_exact.insert((m, path), id);
                    }
                    None => {
                        table.static_any.insert(path, id);
                    }
                }
            } else {
                table.dynamic.push(CompiledRoute { method: def.method, segments, handler: id });
            }
        }

        Ok(table)
    }
}

fn normalize_static(pattern: &str) -> String {
    let joined = pattern
        .split('/')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("/");
    format!("/{joined}")
}

fn compile_pattern(pattern: &str) -> Result<Vec<Segment>> {
    if !pattern.starts_with('/') {
        return Err(Error::Config(format!("route pattern {pattern:?} must start with '/'")));
    }
    let raw: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();
    let mut segments = Vec::with_capacity(raw.len());
    for (i, seg) in raw.iter().enumerate() {
        if let Some(name) = seg.strip_prefix(':') {
            if name.is_empty() {
                return Err(Error::Config(format!("unnamed parameter in {pattern:?}")));
            }
            segments.push(Segment::Param(name.to_string()));
        } else if let Some(name) = seg.strip_prefix('*') {
            if i != raw.len() - 1 {
                return Err(Error::Config(format!(
                    "wildcard must be the last segment in {pattern:?}"
                )));
            }
            segments.push(Segment::Wildcard(name.to_string()));
        } else {
            segments.push(Segment::Literal((*seg).to_string()));
        }
    }
    Ok(segments)
}

/// Dispatch outcome.
pub enum Match<'t> {
    /// Composed handler plus extracted parameter bindings.
    Found { handler: &'t ArcHandler, params: Params },
    /// The path exists under other methods; `allow` lists them.
    MethodMiss { allow: Vec<Method> },
    NotFound,
}

/// Compiled, immutable dispatch structure. Shared-read; replaced wholesale
/// on hot reload.
#[derive(Default)]
pub struct RouteTable {
    static_exact: HashMap<(Method, String), HandlerId>,
    static_any: HashMap<String, HandlerId>,
    dynamic: Vec<CompiledRoute>,
    handlers: Vec<ArcHandler>,
}

impl RouteTable {
    pub fn handler(&self, id: HandlerId) -> Option<&ArcHandler> {
        self.handlers.get(id as usize)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Match procedure: static probe, then dynamic scan in insertion order
    /// for the specific method, then the same two steps for wildcard-method
    /// routes, then 405/404 resolution.
    pub fn dispatch(&self, method: Method, path: &str) -> Match<'_> {
        let key_path = normalize_static(path);
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

        if let Some(&id) = self.static_exact.get(&(method, key_path.clone())) {
            return Match::Found { handler: &self.handlers[id as usize], params: Params::new() };
        }
        for route in &self.dynamic {
            if route.method == Some(method)
                && let Some(params) = match_segments(&route.segments, &segments)
            {
                return Match::Found { handler: &self.handlers[route.handler as usize], params };
            }
        }

        // Wildcard-method fallback runs only after every specific method
        // fails to match.
        if let Some(&id) = self.static_any.get(&key_path) {
            return Match::Found { handler: &self.handlers[id as usize], params: Params::new() };
        }
        for route in &self.dynamic {
            if route.method.is_none()
                && let Some(params) = match_segments(&route.segments, &segments)
            {
                return Match::Found { handler: &self.handlers[route.handler as usize], params };
            }
        }

        let allow = self.allowed_methods(&key_path, &segments);
        if allow.is_empty() {
            Match::NotFound
        } else {
            Match::MethodMiss { allow }
        }
    }

    fn allowed_methods(&self, key_path: &str, segments: &[&str]) -> Vec<Method> {
        let mut allow = Vec::new();
        for m in Method::ALL {
            let static_hit = self.static_exact.contains_key(&(m, key_path.to_string()));
            let dynamic_hit = self
                .dynamic
                .iter()
                .any(|r| r.method == Some(m) && match_segments(&r.segments, segments).is_some());
            if static_hit || dynamic_hit {
                allow.push(m);
            }
        }
        allow
    }
}

fn match_segments(pattern: &[Segment], path: &[&str]) -> Option<Params> {
    let mut params = Params::new();
    let mut i = 0;

    for seg in pattern {
        match seg {
            Segment::Literal(lit) => {
                if path.get(i) != Some(&lit.as_str()) {
                    return None;
                }
                i += 1;
            }
            Segment::Param(name) => {
                let value = path.get(i)?;
                params.push(name.clone(), (*value).to_string());
                i += 1;
            }
            Segment::Wildcard(name) => {
                // Captures the remaining path, slashes included. An empty
                // tail still matches.
                let tail = path[i..].join("/");
                if !name.is_empty() {
                    params.push(name.clone(), tail);
                }
                return Some(params);
            }
        }
    }

    if i == path.len() { Some(params) } else { None }
}
