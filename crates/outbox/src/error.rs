use std::time::Duration;

use thiserror::Error;

/// Rejected `enqueue` calls and invalid limits.
#[derive(Debug, Error)]
pub enum OutboxError {
    #[error("message text is empty")]
    EmptyText,

    #[error("message has no destination")]
    MissingDestination,

    #[error("invalid outbox limits: {message}")]
    InvalidLimits { message: String },
}

impl OutboxError {
    #[must_use]
    pub fn invalid_limits(message: impl Into<String>) -> Self {
        Self::InvalidLimits {
            message: message.into(),
        }
    }
}

/// A send the transport could not complete. The core drops the attempt; the
/// entry stays for transient kinds and is discarded for permanent ones.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("rate limited by chat endpoint (retry after {retry_after:?})")]
    RateLimited { retry_after: Duration },

    #[error("message rejected: {message}")]
    Rejected { message: String },

    #[error("invalid target {target}: {message}")]
    InvalidTarget { target: String, message: String },

    #[error("{context}: {source}")]
    External {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl TransportError {
    #[must_use]
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn invalid_target(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidTarget {
            target: target.into(),
            message: message.into(),
        }
    }

    #[must_use]
    pub fn external(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::External {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// The endpoint will never accept this target or payload, so retrying the
    /// entry cannot succeed.
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Rejected { .. } | Self::InvalidTarget { .. })
    }

    /// Short label for logs and metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::Rejected { .. } => "rejected",
            Self::InvalidTarget { .. } => "invalid_target",
            Self::External { .. } => "external",
        }
    }
}

/// Audit sink failures. Logged and otherwise ignored.
#[derive(Debug, Error)]
pub enum AuditError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("{context}: {source}")]
    External {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl AuditError {
    #[must_use]
    pub fn external(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::External {
            context: context.into(),
            source: Box::new(source),
        }
    }
}

pub type Result<T> = std::result::Result<T, OutboxError>;
