use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Collection error: {0}")]
    Collect(#[from] CollectError),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Notification error: {0}")]
    Notify(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AppError>;

// ---------------------------------------------------------------------------
// CollectError: the signal that drives structured → rendered fallback
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CollectError {
    /// The source answered but refused us (403 / 429 / 503).
    #[error("blocked by source (HTTP {status})")]
    Blocked { status: u16 },

    /// Connection, TLS, timeout or unexpected status.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The page or payload no longer has the shape we parse.
    #[error("unexpected structure: {0}")]
    Schema(String),

    /// The product is gone. Retrying through another path will not help.
    #[error("not found: {0}")]
    NotFound(String),
}

impl CollectError {
    /// Whether the rendered path should be attempted after this structured failure.
    pub fn allows_fallback(&self) -> bool {
        !matches!(self, CollectError::NotFound(_))
    }

    /// Structural errors mean the collector needs maintenance, not a retry.
    pub fn is_structural(&self) -> bool {
        matches!(self, CollectError::Schema(_))
    }

    /// Errors worth charging to the proxy that carried the request.
    pub fn implicates_proxy(&self) -> bool {
        matches!(self, CollectError::Blocked { .. } | CollectError::Transport(_))
    }

    pub fn from_status(status: u16, url: &str) -> Self {
        match status {
            403 | 429 | 503 => CollectError::Blocked { status },
            404 | 410 => CollectError::NotFound(url.to_string()),
            _ => CollectError::Transport(format!("HTTP {status} from {url}")),
        }
    }
}

impl From<reqwest::Error> for CollectError {
    fn from(e: reqwest::Error) -> Self {
        CollectError::Transport(e.to_string())
    }
}
