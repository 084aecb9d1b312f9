/// Error handling for the certificate lifecycle platform
use thiserror::Error;

/// Result type for certfleet operations
pub type Result<T> = std::result::Result<T, FleetError>;

/// Error kinds surfaced by the lock service, scheduler, manager and deployers
#[derive(Error, Debug)]
pub enum FleetError {
    /// Malformed domain, unknown provider, bad deploy config, missing
    /// credentials. Never retried.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Missing domain, provider, deploy config or history version
    #[error("Not found: {0}")]
    NotFound(String),

    /// KV store I/O failure; callers retry at their own cadence
    #[error("Store error: {0}")]
    Store(String),

    /// Lock acquisition did not complete within the requested bound
    #[error("Lock timeout: {0}")]
    LockTimeout(String),

    /// Unlock attempted by a caller that does not hold the lock
    #[error("Lock not held: {0}")]
    LockNotHeld(String),

    /// The lock's backing session expired or was force-unlocked
    #[error("Lock lost: {0}")]
    LockLost(String),

    /// Any failure from the ACME facade: rate limits, DNS propagation
    /// timeouts, challenge rejection
    #[error("ACME error for {domain}: {detail}")]
    Acme { domain: String, detail: String },

    /// Deploy backend failure, sub-typed by backend in the message
    #[error("Deploy error: {0}")]
    Deploy(String),

    /// Certificate parsing or encoding error
    #[error("Certificate error: {0}")]
    Certificate(String),

    /// Operation timeout outside the lock service
    #[error("Timeout: {0}")]
    Timeout(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Unrecoverable startup failure or panic recovery
    #[error("Fatal: {0}")]
    Fatal(String),
}

impl FleetError {
    /// Create a configuration error
    pub fn configuration<S: Into<String>>(msg: S) -> Self {
        FleetError::Configuration(msg.into())
    }

    /// Create a not-found error
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        FleetError::NotFound(msg.into())
    }

    /// Create a store error
    pub fn store<S: Into<String>>(msg: S) -> Self {
        FleetError::Store(msg.into())
    }

    /// Create a lock-timeout error
    pub fn lock_timeout<S: Into<String>>(msg: S) -> Self {
        FleetError::LockTimeout(msg.into())
    }

    /// Create a lock-not-held error
    pub fn lock_not_held<S: Into<String>>(msg: S) -> Self {
        FleetError::LockNotHeld(msg.into())
    }

    /// Create a lock-lost error
    pub fn lock_lost<S: Into<String>>(msg: S) -> Self {
        FleetError::LockLost(msg.into())
    }

    /// Create an ACME error carrying the affected domain
    pub fn acme<S: Into<String>>(domain: S, detail: S) -> Self {
        FleetError::Acme {
            domain: domain.into(),
            detail: detail.into(),
        }
    }

    /// Create a deploy error
    pub fn deploy<S: Into<String>>(msg: S) -> Self {
        FleetError::Deploy(msg.into())
    }

    /// Create a certificate error
    pub fn certificate<S: Into<String>>(msg: S) -> Self {
        FleetError::Certificate(msg.into())
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        FleetError::Timeout(msg.into())
    }

    /// Create a fatal error
    pub fn fatal<S: Into<String>>(msg: S) -> Self {
        FleetError::Fatal(msg.into())
    }

    /// Whether the failure is transient and worth retrying at the caller's
    /// own cadence
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FleetError::Store(_) | FleetError::Timeout(_) | FleetError::LockTimeout(_)
        )
    }
}
