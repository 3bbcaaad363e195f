//! Error types for the relay core
//!
//! Components return these typed kinds; the HTTP surface maps each kind to
//! a status code plus a machine `reason` tag. `Invariant` is never
//! swallowed: it logs with full context and surfaces as an opaque 500.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("{detail}")]
    Malformed {
        reason: &'static str,
        detail: String,
    },

    #[error("authentication required: {0}")]
    Unauthenticated(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("payment required: {0}")]
    PaymentRequired(String),

    #[error("payment invalid: {0}")]
    PaymentInvalid(String),

    #[error("payload too large: limit {max_bytes} bytes")]
    PayloadTooLarge { max_bytes: u64 },

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("transient upstream failure: {0}")]
    Transient(String),

    #[error("backend failure: {0}")]
    Backend(String),

    #[error("invariant violated in {component}: {detail}")]
    Invariant {
        component: &'static str,
        detail: String,
    },

    #[error("module disabled: {0}")]
    Disabled(String),
}

impl CoreError {
    pub fn malformed(detail: impl Into<String>) -> Self {
        Self::Malformed {
            reason: "malformed",
            detail: detail.into(),
        }
    }

    pub fn invariant(component: &'static str, detail: impl Into<String>) -> Self {
        Self::Invariant {
            component,
            detail: detail.into(),
        }
    }

    /// Machine tag surfaced in HTTP bodies next to the human message.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Malformed { reason, .. } => reason,
            Self::Unauthenticated(_) => "unauthenticated",
            Self::Forbidden(_) => "forbidden",
            Self::NotFound(_) => "not-found",
            Self::Conflict(_) => "conflict",
            Self::QuotaExceeded(_) => "quota-exceeded",
            Self::PaymentRequired(_) => "payment-required",
            Self::PaymentInvalid(_) => "payment-invalid",
            Self::PayloadTooLarge { .. } => "payload-too-large",
            Self::RateLimited(_) => "rate-limited",
            Self::Transient(_) => "transient",
            Self::Backend(_) => "backend",
            Self::Invariant { .. } => "internal",
            Self::Disabled(_) => "disabled",
        }
    }

    /// True only for upstream timeouts/connectivity; the surface may retry
    /// idempotent reads once, never writes.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn log_level(&self) -> tracing::Level {
        use tracing::Level;
        match self {
            Self::Invariant { .. } | Self::Backend(_) => Level::ERROR,
            Self::Transient(_) => Level::WARN,
            Self::QuotaExceeded(_) | Self::RateLimited(_) => Level::WARN,
            Self::PaymentInvalid(_) => Level::WARN,
            _ => Level::DEBUG,
        }
    }
}

impl From<shogun_storage::StorageError> for CoreError {
    fn from(err: shogun_storage::StorageError) -> Self {
        use shogun_storage::StorageError;
        match err {
            StorageError::NotFound(p) => Self::NotFound(p),
            StorageError::AlreadyExists(p) => Self::Conflict(format!("already exists: {p}")),
            StorageError::PathEscape(p) => Self::Malformed {
                reason: "path-escape",
                detail: format!("path escapes the drive root: {p}"),
            },
            StorageError::Backend(m) => Self::Backend(m),
            StorageError::Io(e) => Self::Backend(e.to_string()),
        }
    }
}

impl From<shogun_ipfs::IpfsError> for CoreError {
    fn from(err: shogun_ipfs::IpfsError) -> Self {
        if err.is_retryable() {
            Self::Transient(err.to_string())
        } else {
            Self::Backend(err.to_string())
        }
    }
}

impl From<shogun_ledger::LedgerError> for CoreError {
    fn from(err: shogun_ledger::LedgerError) -> Self {
        Self::Backend(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_tags_are_stable() {
        assert_eq!(CoreError::malformed("x").reason(), "malformed");
        assert_eq!(
            CoreError::Unauthenticated("no credentials".into()).reason(),
            "unauthenticated"
        );
        assert_eq!(
            CoreError::PayloadTooLarge { max_bytes: 1 }.reason(),
            "payload-too-large"
        );
        assert_eq!(
            CoreError::invariant("pipeline", "x").reason(),
            "internal"
        );
    }

    #[test]
    fn path_escape_keeps_its_reason_tag() {
        let err: CoreError = shogun_storage::StorageError::PathEscape("../x".into()).into();
        assert_eq!(err.reason(), "path-escape");
    }

    #[test]
    fn only_transient_is_retryable() {
        assert!(CoreError::Transient("timeout".into()).is_retryable());
        assert!(!CoreError::Backend("boom".into()).is_retryable());
        assert!(!CoreError::NotFound("x".into()).is_retryable());
    }

    #[test]
    fn ipfs_timeouts_map_to_transient() {
        let err: CoreError = shogun_ipfs::IpfsError::Timeout {
            timeout_secs: 30,
            context: "pin/add".into(),
        }
        .into();
        assert!(matches!(err, CoreError::Transient(_)));
    }
}
