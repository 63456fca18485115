//! Security response headers (HSTS, framing, referrer policy, sniffing).
//!
//! Application is idempotent: headers already declared by the response (or
//! by an earlier instance of this middleware) are left alone.

use std::sync::Arc;

use crate::config::SecurityConfig;
use crate::http::{RequestContext, Response};
use crate::pipeline::{ArcHandler, Middleware};

pub struct SecurityHeaders {
    config: Arc<SecurityConfig>,
}

impl SecurityHeaders {
    pub fn new(config: SecurityConfig) -> Self {
        Self { config: Arc::new(config) }
    }

    pub fn default_policy() -> Self {
        Self::new(SecurityConfig::default())
    }

    fn apply(config: &SecurityConfig, res: &mut Response) {
        if config.hsts {
            res.headers.set_if_absent(
                "strict-transport-security",
                format!("max-age={}; includeSubDomains", config.hsts_max_age_secs),
            );
        }
        if !config.frame_options.is_empty() {
            res.headers.set_if_absent("x-frame-options", config.frame_options.clone());
        }
        if !config.referrer_policy.is_empty() {
            res.headers.set_if_absent("referrer-policy", config.referrer_policy.clone());
        }
        if config.content_type_nosniff {
            res.headers.set_if_absent("x-content-type-options", "nosniff");
        }
    }
}

impl Middleware for SecurityHeaders {
    fn wrap(&self, inner: ArcHandler) -> ArcHandler {
        let config = self.config.clone();
        Arc::new(move |ctx: RequestContext| {
            let config = config.clone();
            let inner = inner.clone();
            async move {
                let mut res = inner.call(ctx).await?;
                Self::apply(&config, &mut res);
                Ok(res)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Method;
    use crate::pipeline::{Handler, compose};

    fn handler() -> ArcHandler {
        Arc::new(|_ctx: RequestContext| async { Ok(Response::ok("body")) })
    }

    #[tokio::test]
    async fn sets_default_headers() {
        let wrapped = SecurityHeaders::default_policy().wrap(handler());
        let res = wrapped.call(RequestContext::new(Method::Get, "/")).await.unwrap();
        assert!(res.headers.get("strict-transport-security").unwrap().starts_with("max-age="));
        assert_eq!(res.headers.get("x-frame-options"), Some("DENY"));
        assert_eq!(res.headers.get("referrer-policy"), Some("no-referrer"));
        assert_eq!(res.headers.get("x-content-type-options"), Some("nosniff"));
    }

    #[tokio::test]
    async fn applying_twice_equals_once() {
        let once = SecurityHeaders::default_policy().wrap(handler());
        let twice = compose(
            &[
                Arc::new(SecurityHeaders::default_policy()),
                Arc::new(SecurityHeaders::default_policy()),
            ],
            handler(),
        );

        let a = once.call(RequestContext::new(Method::Get, "/")).await.unwrap();
        let b = twice.call(RequestContext::new(Method::Get, "/")).await.unwrap();
        let collect = |res: &Response| {
            let mut headers: Vec<(String, String)> =
                res.headers.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
            headers.sort();
            headers
        };
        assert_eq!(collect(&a), collect(&b));
    }

    #[tokio::test]
    async fn response_declared_headers_win() {
        let opinionated: ArcHandler = Arc::new(|_ctx: RequestContext| async {
            Ok(Response::ok("body").header("x-frame-options", "SAMEORIGIN"))
        });
        let wrapped = SecurityHeaders::default_policy().wrap(opinionated);
        let res = wrapped.call(RequestContext::new(Method::Get, "/")).await.unwrap();
        assert_eq!(res.headers.get("x-frame-options"), Some("SAMEORIGIN"));
    }
}
