use thiserror::Error;

/// Error kinds surfaced by the usage core.
///
/// Per-account failures never abort the aggregate fetch; they are demoted to
/// warnings and reduce the successful-account count. Only `AllSourcesFailed`
/// is fatal at the aggregate level.
#[derive(Debug, Error)]
pub enum UsageError {
    /// Missing user home, unreadable registry, empty account list.
    #[error("{0}")]
    Config(String),

    /// Missing or unreadable auth.json, blank access token.
    #[error("{0}")]
    Auth(String),

    /// RPC handshake failure, decode failure, closed stream.
    #[error("{0}")]
    Protocol(String),

    /// The RPC peer returned an error object for a method call.
    #[error("{method} failed: {message}")]
    Method { method: String, message: String },

    /// HTTP failure: non-2xx status, timeout, connection error.
    #[error("{0}")]
    Transport(String),

    /// A source response is missing the primary or secondary window.
    #[error("{0}")]
    Data(String),

    /// Journal replay failed: home missing, file read or scan error.
    #[error("{0}")]
    Estimator(String),

    /// Both the primary and fallback source failed for one account.
    #[error("{0}")]
    SourcesFailed(String),

    /// Every account failed and no observed-token data exists.
    #[error("all account fetches failed and observed tokens are unavailable")]
    AllSourcesFailed,

    /// Caller-driven cancellation or timeout, with the in-flight method.
    #[error("{method} timed out: {cause}")]
    Cancelled { method: String, cause: String },
}
