//! Crate-wide error type.
//!
//! Every public operation in this crate returns `Result<T, BridgeError>`. The
//! variants name the taxonomy an external HTTP layer would emit verbatim as
//! `{error_code, message, [retry_after_sec]}` response bodies, so this crate
//! never has to depend on an HTTP status type to carry that information.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("already linked: {0}")]
    AlreadyLinked(String),

    #[error("not linked: {0}")]
    NotLinked(String),

    #[error("bad link: {0}")]
    BadLink(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("missing API key")]
    NoApiKey,

    #[error("invalid admin key")]
    InvalidAdminKey,

    #[error("invalid entity key")]
    InvalidEntityKey,

    #[error("rate limited, retry after {retry_after_sec}s")]
    RateLimited { retry_after_sec: u64 },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("unlinked: {0}")]
    Unlinked(String),

    #[error("token expired")]
    TokenExpired,

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("unknown kid: {0}")]
    UnknownKid(String),

    #[error("keys unavailable: {0}")]
    KeysUnavailable(String),

    #[error("backend error: {0}")]
    BackendError(String),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("crypto error: {0}")]
    Crypto(String),
}

impl BridgeError {
    /// Stable machine-readable code, matching the taxonomy in `spec.md` §7
    /// and the `error_code` values the original emits in its JSON bodies.
    pub fn error_code(&self) -> &'static str {
        match self {
            BridgeError::NotFound(_) => "NOT_FOUND",
            BridgeError::AlreadyExists(_) => "ALREADY_EXISTS",
            BridgeError::AlreadyLinked(_) => "ALREADY_LINKED",
            BridgeError::NotLinked(_) => "NOT_LINKED",
            BridgeError::BadLink(_) => "BAD_LINK",
            BridgeError::BadRequest(_) => "BAD_REQUEST",
            BridgeError::NoApiKey => "NO_API_KEY",
            BridgeError::InvalidAdminKey => "INVALID_ADMIN_KEY",
            BridgeError::InvalidEntityKey => "INVALID_ENTITY_KEY",
            BridgeError::RateLimited { .. } => "RATE_LIMITED",
            BridgeError::Conflict(_) => "CONFLICT",
            BridgeError::PreconditionFailed(_) => "PRECONDITION_FAILED",
            BridgeError::Unlinked(_) => "UNLINKED",
            BridgeError::TokenExpired => "TOKEN_EXPIRED",
            BridgeError::InvalidToken(_) => "INVALID_TOKEN",
            BridgeError::UnknownKid(_) => "UNKNOWN_KID",
            BridgeError::KeysUnavailable(_) => "KEYS_UNAVAILABLE",
            BridgeError::BackendError(_) => "BACKEND_ERROR",
            BridgeError::Sqlite(_) => "BACKEND_ERROR",
            BridgeError::Serde(_) => "BACKEND_ERROR",
            BridgeError::Io(_) => "BACKEND_ERROR",
            BridgeError::Crypto(_) => "BACKEND_ERROR",
        }
    }

    /// HTTP status an external layer should map this to, per the status
    /// table in `spec.md` §6. Kept as a plain `u16` so this crate never
    /// depends on an HTTP status type. Variants with no explicit status in
    /// that table (internal backend/crypto failures) map to 503, matching
    /// *KEYS_UNAVAILABLE*/*BACKEND_ERROR* rather than inventing a 5xx code
    /// the spec doesn't enumerate.
    pub fn http_status(&self) -> u16 {
        match self {
            BridgeError::NotFound(_) => 404,
            BridgeError::AlreadyExists(_)
            | BridgeError::AlreadyLinked(_)
            | BridgeError::NotLinked(_)
            | BridgeError::BadLink(_)
            | BridgeError::BadRequest(_)
            | BridgeError::Unlinked(_) => 400,
            BridgeError::NoApiKey
            | BridgeError::InvalidAdminKey
            | BridgeError::InvalidEntityKey
            | BridgeError::TokenExpired
            | BridgeError::InvalidToken(_)
            | BridgeError::UnknownKid(_) => 401,
            BridgeError::Conflict(_) => 409,
            BridgeError::PreconditionFailed(_) => 412,
            BridgeError::RateLimited { .. } => 429,
            BridgeError::KeysUnavailable(_)
            | BridgeError::BackendError(_)
            | BridgeError::Sqlite(_)
            | BridgeError::Serde(_)
            | BridgeError::Io(_)
            | BridgeError::Crypto(_) => 503,
        }
    }

    /// `retry_after_sec` for the rate-limited variant, mirroring the
    /// `Retry-After` guidance in the external interface.
    pub fn retry_after_sec(&self) -> Option<u64> {
        match self {
            BridgeError::RateLimited { retry_after_sec } => Some(*retry_after_sec),
            _ => None,
        }
    }
}
