//! Error taxonomy shared by every `cam-core` component (SPEC_FULL.md §7).
//!
//! `CamError` is returned by every Store/Lifecycle/Dispatcher call; it is
//! never erased into `anyhow::Error` before reaching the HTTP layer in
//! `cam-cli`, which maps it onto the `{success, data?, error?}` envelope.

use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum CamError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("{id} has status {observed}, expected one of {expected}")]
    StateConflict {
        id: String,
        observed: String,
        expected: String,
        extra: Option<serde_json::Value>,
    },

    #[error("dependency blocked")]
    DependencyBlocked,

    #[error("external provider error: {0}")]
    ExternalProviderError(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl CamError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn state_conflict(id: impl ToString, observed: impl Into<String>, expected: impl Into<String>) -> Self {
        Self::StateConflict {
            id: id.to_string(),
            observed: observed.into(),
            expected: expected.into(),
            extra: None,
        }
    }

    /// Like [`state_conflict`](Self::state_conflict), but attaches a list of
    /// running task ids for the HTTP layer to surface as `error.extra`
    /// (SPEC_FULL.md §8 S6: "listing runningTaskIds=[...]").
    pub fn state_conflict_with_running_tasks(
        id: impl ToString,
        observed: impl Into<String>,
        expected: impl Into<String>,
        running_task_ids: Vec<Uuid>,
    ) -> Self {
        Self::StateConflict {
            id: id.to_string(),
            observed: observed.into(),
            expected: expected.into(),
            extra: Some(serde_json::json!({ "runningTaskIds": running_task_ids })),
        }
    }

    /// The `error.extra` payload for the HTTP envelope, if any.
    pub fn extra(&self) -> Option<&serde_json::Value> {
        match self {
            Self::StateConflict { extra, .. } => extra.as_ref(),
            _ => None,
        }
    }

    /// A stable machine-readable code matching SPEC_FULL.md §6.1's envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::StateConflict { .. } => "STATE_CONFLICT",
            Self::DependencyBlocked => "STATE_CONFLICT",
            Self::ExternalProviderError(_) => "INTERNAL_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, CamError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_taxonomy() {
        assert_eq!(CamError::InvalidInput("bad".into()).code(), "INVALID_INPUT");
        assert_eq!(CamError::not_found("task", Uuid::nil()).code(), "NOT_FOUND");
        assert_eq!(
            CamError::state_conflict(Uuid::nil(), "failed", "running").code(),
            "STATE_CONFLICT"
        );
    }
}
