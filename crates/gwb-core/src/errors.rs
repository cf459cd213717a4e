use std::time::Duration;

/// Core error type.
///
/// Adapter crates map their transport failures into [`ProviderError`]; the
/// worker recovers from all of them locally except [`Error::PoolExhausted`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("every account failed to authenticate ({accounts} tried)")]
    PoolExhausted { accounts: usize },

    #[error("external error: {0}")]
    External(String),
}

/// Failure taxonomy for calls into the message-thread provider.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// Credential rejected or session no longer valid.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Provider asked us to back off.
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// Connection reset, timeout, 5xx and friends.
    #[error("network error: {0}")]
    Network(String),

    /// Delivery permanently refused for this message.
    #[error("rejected: {0}")]
    Rejected(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Call abandoned because shutdown was requested before it went out.
    #[error("cancelled before sending")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
