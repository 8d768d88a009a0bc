//! Unified error types.

use std::error::Error as StdError;
use std::fmt;

/// A boxed error coming out of user code or the transport.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// The error type returned by aero's fallible operations.
///
/// Handlers return it to abort their chain; the router catches it once and
/// hands it to the error-handler chain. The server also records transport
/// failures with it.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config: {0}")]
    Config(#[from] toml::de::Error),

    #[error("invalid listen address `{0}`")]
    Addr(String),

    #[error("server not running")]
    NotRunning,

    #[error("server already running")]
    AlreadyRunning,

    #[error("connection: {0}")]
    Connection(BoxError),

    #[error("{0}")]
    Handler(BoxError),
}

impl Error {
    /// Wraps any error raised by a handler.
    pub fn handler(err: impl Into<BoxError>) -> Self {
        Self::Handler(err.into())
    }

    /// A handler failure carrying only a message.
    pub fn msg(message: impl fmt::Display) -> Self {
        Self::Handler(message.to_string().into())
    }
}

/// Why a request body could not be turned into a parsed value.
///
/// Never returned from an API call: it is only delivered through
/// [`RequestEvent::Error`](crate::RequestEvent::Error).
#[derive(Debug, thiserror::Error)]
pub enum BodyError {
    #[error("failed to parse body: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("body stream failed: {0}")]
    Stream(String),
}
