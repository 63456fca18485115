use thiserror::Error;

/// Central error type for the Sirocco engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The request head or body could not be parsed.
    #[error("malformed request: {0}")]
    Malformed(String),

    /// Header block exceeded `max_header_size`.
    #[error("request headers exceed {limit} bytes")]
    HeadersTooLarge { limit: usize },

    /// Body exceeded `max_body_size`.
    #[error("request body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },

    /// Peer went away mid-request (EOF or reset).
    #[error("client disconnected")]
    Disconnected,

    /// Request deadline exceeded before the handler produced a response.
    #[error("request timed out")]
    Timeout,

    /// A handler or middleware failed with an uncaught error.
    #[error("handler error: {0}")]
    Handler(String),

    /// Invalid route table, e.g. duplicate (method, pattern).
    #[error("route conflict: {method} {pattern} registered twice")]
    RouteConflict { method: String, pattern: String },

    /// Invalid or unusable configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// TLS setup or handshake failure.
    #[error("TLS error: {0}")]
    Tls(String),

    /// A pluggable store (session / rate limit) failed.
    #[error("store error: {0}")]
    Store(String),

    /// WebSocket protocol violation.
    #[error("websocket protocol error: {0}")]
    WebSocket(String),

    /// Generic or miscellaneous error.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// HTTP status this error maps to when it escapes the pipeline.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Malformed(_) => 400,
            Error::HeadersTooLarge { .. } => 431,
            Error::BodyTooLarge { .. } => 413,
            Error::Timeout => 504,
            Error::RouteConflict { .. } | Error::Config(_) => 500,
            Error::Handler(_) | Error::Store(_) | Error::Other(_) => 500,
            Error::Io(_) | Error::Disconnected | Error::Tls(_) | Error::WebSocket(_) => 500,
        }
    }

    /// True when the connection is no longer usable and must be closed
    /// without attempting a response.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Error::Disconnected => true,
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
