//! Request tracing: W3C traceparent propagation, request ids and the
//! access-log middleware.

use std::sync::Arc;
use std::time::Instant;

use rand::RngCore;

use crate::http::{RequestContext, Response};
use crate::pipeline::{ArcHandler, Middleware};

/// Parsed `traceparent` header (version 00).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceContext {
    pub trace_id: [u8; 16],
    pub parent_id: [u8; 8],
    pub flags: u8,
}

impl TraceContext {
    /// Fresh root context with the sampled flag set.
    pub fn generate() -> Self {
        let mut trace_id = [0u8; 16];
        let mut parent_id = [0u8; 8];
        rand::rngs::OsRng.fill_bytes(&mut trace_id);
        rand::rngs::OsRng.fill_bytes(&mut parent_id);
        Self { trace_id, parent_id, flags: 0x01 }
    }

    /// Child context: same trace, new span id.
    pub fn child(&self) -> Self {
        let mut parent_id = [0u8; 8];
        rand::rngs::OsRng.fill_bytes(&mut parent_id);
        Self { trace_id: self.trace_id, parent_id, flags: self.flags }
    }

    pub fn sampled(&self) -> bool {
        self.flags & 0x01 != 0
    }
}

/// `00-<trace-id>-<parent-id>-<flags>`.
pub fn format_traceparent(ctx: &TraceContext) -> String {
    format!(
        "00-{}-{}-{:02x}",
        hex(&ctx.trace_id),
        hex(&ctx.parent_id),
        ctx.flags
    )
}

/// Strict version-00 parse; all-zero ids are invalid per W3C trace
/// context.
pub fn parse_traceparent(value: &str) -> Option<TraceContext> {
    let mut parts = value.trim().split('-');
    let version = parts.next()?;
    let trace_id_hex = parts.next()?;
    let parent_id_hex = parts.next()?;
    let flags_hex = parts.next()?;
    if parts.next().is_some() || version != "00" {
        return None;
    }

    let trace_id: [u8; 16] = unhex(trace_id_hex)?.try_into().ok()?;
    let parent_id: [u8; 8] = unhex(parent_id_hex)?.try_into().ok()?;
    let flags = *unhex(flags_hex)?.first()?;
    if trace_id == [0u8; 16] || parent_id == [0u8; 8] {
        return None;
    }
    Some(TraceContext { trace_id, parent_id, flags })
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn unhex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 || s.is_empty() {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

/// Request-span middleware: continues an incoming trace (or starts one),
/// assigns `X-Request-Id`, and emits one structured access event per
/// request.
pub struct RequestTrace {
    header: Arc<str>,
}

impl RequestTrace {
    pub fn new() -> Self {
        Self { header: Arc::from("x-request-id") }
    }

    pub fn with_header(header: &str) -> Self {
        Self { header: Arc::from(header.to_ascii_lowercase().as_str()) }
    }
}

impl Default for RequestTrace {
    fn default() -> Self {
        Self::new()
    }
}

impl Middleware for RequestTrace {
    fn wrap(&self, inner: ArcHandler) -> ArcHandler {
        let header = self.header.clone();
        Arc::new(move |mut ctx: RequestContext| {
            let header = header.clone();
            let inner = inner.clone();
            async move {
                let trace = ctx
                    .header("traceparent")
                    .and_then(parse_traceparent)
                    .map(|incoming| incoming.child())
                    .unwrap_or_else(TraceContext::generate);
                let request_id = match ctx.header(&header) {
                    Some(id) => id.to_string(),
                    None => hex(&trace.parent_id),
                };
                ctx.extensions.insert(trace);

                let method = ctx.method;
                let path = ctx.path.clone();
                let started = Instant::now();

                let result = inner.call(ctx).await;
                let elapsed_ms = started.elapsed().as_millis() as u64;

                match &result {
                    Ok(res) => {
                        tracing::info!(
                            %method,
                            path = %path,
                            status = res.status,
                            elapsed_ms,
                            request_id = %request_id,
                            trace_id = %hex(&trace.trace_id),
                            "request"
                        );
                    }
                    Err(e) => {
                        tracing::error!(
                            %method,
                            path = %path,
                            error = %e,
                            elapsed_ms,
                            request_id = %request_id,
                            "request failed"
                        );
                    }
                }

                result.map(|mut res| {
                    res.headers.set_if_absent(&header, request_id);
                    res.headers.set_if_absent("traceparent", format_traceparent(&trace));
                    res
                })
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Method;
    use crate::pipeline::Handler;

    #[test]
    fn traceparent_round_trip() {
        let ctx = TraceContext::generate();
        let encoded = format_traceparent(&ctx);
        assert_eq!(parse_traceparent(&encoded), Some(ctx));
    }

    #[test]
    fn known_vector() {
        let ctx =
            parse_traceparent("00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01").unwrap();
        assert!(ctx.sampled());
        assert_eq!(
            format_traceparent(&ctx),
            "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01"
        );
    }

    #[test]
    fn rejects_malformed() {
        for bad in [
            "",
            "00-short-b7ad6b7169203331-01",
            "01-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01",
            "00-00000000000000000000000000000000-b7ad6b7169203331-01",
            "00-0af7651916cd43dd8448eb211c80319c-0000000000000000-01",
            "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01-extra",
        ] {
            assert!(parse_traceparent(bad).is_none(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn child_keeps_trace_id() {
        let root = TraceContext::generate();
        let child = root.child();
        assert_eq!(child.trace_id, root.trace_id);
        assert_ne!(child.parent_id, root.parent_id);
    }

    #[tokio::test]
    async fn middleware_assigns_ids_and_propagates() {
        let sees_trace: ArcHandler = Arc::new(|ctx: RequestContext| async move {
            assert!(ctx.extensions.get::<TraceContext>().is_some());
            Ok(Response::ok("traced"))
        });
        let wrapped = RequestTrace::new().wrap(sees_trace);

        let mut ctx = RequestContext::new(Method::Get, "/");
        ctx.headers
            .set("traceparent", "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01");
        let res = wrapped.call(ctx).await.unwrap();
        assert!(res.headers.get("x-request-id").is_some());
        let tp = res.headers.get("traceparent").unwrap();
        // Same trace id, new span id.
        assert!(tp.starts_with("00-0af7651916cd43dd8448eb211c80319c-"));
        assert!(!tp.contains("b7ad6b7169203331"));
    }

    #[tokio::test]
    async fn incoming_request_id_is_reused() {
        let wrapped = RequestTrace::new()
            .wrap(Arc::new(|_ctx: RequestContext| async { Ok(Response::ok("k")) }) as ArcHandler);
        let mut ctx = RequestContext::new(Method::Get, "/");
        ctx.headers.set("x-request-id", "req-abc-123");
        let res = wrapped.call(ctx).await.unwrap();
        assert_eq!(res.headers.get("x-request-id"), Some("req-abc-123"));
    }
}
