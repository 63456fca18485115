//! CORS middleware: origin policy, preflight short-circuit and response
//! header decoration.

use std::sync::Arc;

use crate::config::CorsConfig;
use crate::http::{Method, RequestContext, Response};
use crate::pipeline::{ArcHandler, Middleware};

pub struct Cors {
    config: Arc<CorsConfig>,
}

impl Cors {
    pub fn new(config: CorsConfig) -> Self {
        Self { config: Arc::new(config) }
    }

    /// Allow-everything policy.
    pub fn permissive() -> Self {
        Self::new(CorsConfig::default())
    }
}

fn origin_allowed(config: &CorsConfig, origin: &str) -> bool {
    config
        .allow_origins
        .iter()
        .any(|allowed| allowed == "*" || allowed.eq_ignore_ascii_case(origin))
}

fn allow_any(config: &CorsConfig) -> bool {
    config.allow_origins.iter().any(|o| o == "*")
}

fn decorate(config: &CorsConfig, origin: &str, mut res: Response) -> Response {
    if allow_any(config) && !config.allow_credentials {
        res.headers.set("access-control-allow-origin", "*");
    } else {
        // Credentialed responses must echo the concrete origin.
        res.headers.set("access-control-allow-origin", origin);
        res.headers.append("vary", "origin");
    }
    if config.allow_credentials {
        res.headers.set("access-control-allow-credentials", "true");
    }
    if !config.expose_headers.is_empty() {
        res.headers
            .set("access-control-expose-headers", config.expose_headers.join(", "));
    }
    res
}

impl Middleware for Cors {
    fn wrap(&self, inner: ArcHandler) -> ArcHandler {
        let config = self.config.clone();
        Arc::new(move |ctx: RequestContext| {
            let config = config.clone();
            let inner = inner.clone();
            async move {
                let Some(origin) = ctx.header("origin").map(str::to_string) else {
                    // Same-origin or non-browser traffic: nothing to do.
                    return inner.call(ctx).await;
                };
                if !origin_allowed(&config, &origin) {
                    return inner.call(ctx).await;
                }

                let is_preflight = ctx.method == Method::Options
                    && ctx.headers.contains("access-control-request-method");
                if is_preflight {
                    let res = Response::new(204)
                        .header("access-control-allow-methods", config.allow_methods.join(", "))
                        .header("access-control-allow-headers", config.allow_headers.join(", "))
                        .header("access-control-max-age", config.max_age_secs.to_string());
                    return Ok(decorate(&config, &origin, res));
                }

                let res = inner.call(ctx).await?;
                Ok(decorate(&config, &origin, res))
            }
        })
    }
}
