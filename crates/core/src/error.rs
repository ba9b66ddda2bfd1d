//! Crunch failure taxonomy.

use thiserror::Error;

use crate::id::DimensionId;

/// Result type used by the crunching pipeline.
pub type CrunchResult<T> = Result<T, CrunchError>;

/// How a failed job must be treated by the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Environmental; the job may succeed if it runs again.
    Retryable,
    /// Retrying cannot change the result; the job must not run again.
    Terminal,
}

/// Everything that can go wrong while crunching one dimension.
///
/// Every variant maps to exactly one [`FailureKind`]; see [`CrunchError::kind`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CrunchError {
    /// The dimension id has no row in the store.
    #[error("dimension {0} not found")]
    NotFound(DimensionId),

    /// The dimension's textual operand cannot be used for its filter kind.
    #[error("invalid value {value:?} for dimension filter '{name}': {reason}")]
    InvalidDimensionValue {
        name: String,
        value: String,
        reason: String,
    },

    /// The dimension targets an entity kind the cruncher cannot aggregate.
    #[error("unsupported dimension target '{0}'")]
    Unsupported(String),

    /// The job payload does not name a dimension.
    #[error("invalid job payload: {0}")]
    InvalidPayload(String),

    /// Connection drop, timeout, deadlock and similar store conditions.
    #[error("transient store failure: {0}")]
    StoreTransient(String),

    /// The store rejected a write because it violates a constraint.
    #[error("store constraint violated: {0}")]
    StoreConstraint(String),

    /// The stored data cannot be evaluated (division by zero, bad cast).
    #[error("store data exception: {0}")]
    StoreData(String),
}

impl CrunchError {
    pub fn invalid_value(
        name: impl Into<String>,
        value: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidDimensionValue {
            name: name.into(),
            value: value.into(),
            reason: reason.into(),
        }
    }

    pub fn unsupported(target: impl Into<String>) -> Self {
        Self::Unsupported(target.into())
    }

    pub fn invalid_payload(msg: impl Into<String>) -> Self {
        Self::InvalidPayload(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::StoreTransient(msg.into())
    }

    pub fn constraint(msg: impl Into<String>) -> Self {
        Self::StoreConstraint(msg.into())
    }

    pub fn data(msg: impl Into<String>) -> Self {
        Self::StoreData(msg.into())
    }

    /// Retry classification of this failure.
    pub fn kind(&self) -> FailureKind {
        match self {
            CrunchError::StoreTransient(_) => FailureKind::Retryable,
            CrunchError::NotFound(_)
            | CrunchError::InvalidDimensionValue { .. }
            | CrunchError::Unsupported(_)
            | CrunchError::InvalidPayload(_)
            | CrunchError::StoreConstraint(_)
            | CrunchError::StoreData(_) => FailureKind::Terminal,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.kind() == FailureKind::Terminal
    }
}
