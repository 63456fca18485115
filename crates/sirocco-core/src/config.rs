//! Server configuration.

use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

fn default_port() -> u16 {
    8080
}
fn default_hostname() -> String {
    "0.0.0.0".to_string()
}
fn default_workers() -> usize {
    num_cpus::get().min(8)
}
fn default_request_timeout_ms() -> u64 {
    30_000
}
fn default_max_body_size() -> usize {
    1024 * 1024
}
fn default_keepalive_timeout_ms() -> u64 {
    5_000
}
fn default_max_header_size() -> usize {
    8 * 1024
}

/// Top-level server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP port to bind. Overridden by `PORT` when set.
    pub port: u16,
    /// Bind address.
    pub hostname: String,
    /// Worker thread count. Overridden by `WORKERS` when set and non-zero.
    pub workers: usize,
    /// Per-request wall-clock deadline.
    pub request_timeout_ms: u64,
    /// Reject bodies over this many bytes (413).
    pub max_body_size: usize,
    /// Idle keep-alive connection timeout.
    pub keepalive_timeout_ms: u64,
    /// Reject header blocks over this many bytes (431).
    pub max_header_size: usize,
    /// Requests served per connection before forcing close. 0 = unbounded.
    pub max_requests_per_connection: u64,
    pub tls: Option<TlsConfig>,
    pub http2: Http2Config,
    pub cors: Option<CorsConfig>,
    pub rate_limit: Option<RateLimitConfig>,
    pub security: Option<SecurityConfig>,
    pub compression: Option<CompressionConfig>,
    pub session: Option<SessionConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            hostname: default_hostname(),
            workers: default_workers(),
            request_timeout_ms: default_request_timeout_ms(),
            max_body_size: default_max_body_size(),
            keepalive_timeout_ms: default_keepalive_timeout_ms(),
            max_header_size: default_max_header_size(),
            max_requests_per_connection: 0,
            tls: None,
            http2: Http2Config::default(),
            cors: None,
            rate_limit: None,
            security: None,
            compression: None,
            session: None,
        }
    }
}

impl ServerConfig {
    /// Defaults plus `PORT` / `WORKERS` environment overrides.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.apply_env();
        cfg
    }

    /// Apply the recognized environment overrides in place.
    pub fn apply_env(&mut self) {
        if let Ok(port) = std::env::var("PORT")
            && let Ok(port) = port.trim().parse::<u16>()
        {
            self.port = port;
        }
        if let Ok(workers) = std::env::var("WORKERS")
            && let Ok(workers) = workers.trim().parse::<usize>()
            && workers != 0
        {
            self.workers = workers;
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn keepalive_timeout(&self) -> Duration {
        Duration::from_millis(self.keepalive_timeout_ms)
    }

    /// Reject configurations the engine cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::Config("workers must be at least 1".into()));
        }
        if self.http2.enabled && self.tls.is_none() {
            return Err(Error::Config("http2 requires tls (negotiated via ALPN)".into()));
        }
        if self.http2.push {
            return Err(Error::Config("http2 server push is not supported".into()));
        }
        if let Some(tls) = &self.tls {
            tls.validate()?;
        }
        if let Some(rl) = &self.rate_limit {
            rl.validate()?;
        }
        if let Some(session) = &self.session
            && session.secret.is_empty()
        {
            return Err(Error::Config("session secret must not be empty".into()));
        }
        Ok(())
    }
}

/// Certificate + key, by file path or inline PEM.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
    pub cert_pem: Option<String>,
    pub key_pem: Option<String>,
}

impl TlsConfig {
    fn validate(&self) -> Result<()> {
        let has_cert = self.cert_path.is_some() || self.cert_pem.is_some();
        let has_key = self.key_path.is_some() || self.key_pem.is_some();
        if !has_cert || !has_key {
            return Err(Error::Config("tls requires both a certificate and a key".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Http2Config {
    pub enabled: bool,
    /// Server push is accepted in configuration for wire compatibility but
    /// rejected by `validate()`.
    pub push: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    /// Allowed origins; `*` allows any.
    pub allow_origins: Vec<String>,
    pub allow_methods: Vec<String>,
    pub allow_headers: Vec<String>,
    pub expose_headers: Vec<String>,
    pub allow_credentials: bool,
    pub max_age_secs: u64,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allow_origins: vec!["*".to_string()],
            allow_methods: ["GET", "POST", "PUT", "DELETE", "PATCH", "HEAD", "OPTIONS"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            allow_headers: vec!["content-type".to_string(), "authorization".to_string()],
            expose_headers: Vec::new(),
            allow_credentials: false,
            max_age_secs: 86_400,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitAlgorithm {
    FixedWindow,
    SlidingWindow,
    TokenBucket,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub algorithm: RateLimitAlgorithm,
    /// Maximum requests per window (or bucket capacity).
    pub max: u64,
    pub window_ms: u64,
    /// Token-bucket refill rate in tokens/second. Defaults to
    /// `max / window`.
    pub refill_per_sec: Option<f64>,
    /// Emit `X-RateLimit-*` headers.
    pub headers: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            algorithm: RateLimitAlgorithm::FixedWindow,
            max: 60,
            window_ms: 60_000,
            refill_per_sec: None,
            headers: true,
        }
    }
}

impl RateLimitConfig {
    fn validate(&self) -> Result<()> {
        if self.max == 0 {
            return Err(Error::Config("rate_limit.max must be at least 1".into()));
        }
        if self.window_ms == 0 {
            return Err(Error::Config("rate_limit.window_ms must be non-zero".into()));
        }
        Ok(())
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub hsts: bool,
    pub hsts_max_age_secs: u64,
    pub frame_options: String,
    pub referrer_policy: String,
    pub content_type_nosniff: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            hsts: true,
            hsts_max_age_secs: 15_552_000,
            frame_options: "DENY".to_string(),
            referrer_policy: "no-referrer".to_string(),
            content_type_nosniff: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    pub gzip: bool,
    pub brotli: bool,
    /// Bodies under this many bytes are left alone.
    pub threshold: usize,
    /// Encoder level, 1-9 for gzip, 1-11 for brotli.
    pub level: u32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self { gzip: true, brotli: false, threshold: 1024, level: 6 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub cookie_name: String,
    /// HMAC secret for session-id signatures.
    pub secret: String,
    pub max_age_secs: u64,
    /// Refresh the cookie (and store TTL) on every request.
    pub rolling: bool,
    /// Persist sessions that were never written to.
    pub save_uninitialized: bool,
    /// Emit `Secure` on the session cookie.
    pub secure: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_name: "sid".to_string(),
            secret: String::new(),
            max_age_secs: 86_400,
            rolling: false,
            save_uninitialized: false,
            secure: false,
        }
    }
}
