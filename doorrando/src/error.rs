use thiserror::Error;

/// Failures of a single generation attempt.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("no valid topology for {dungeon}: {reason}")]
    StructuralInfeasibility { dungeon: String, reason: String },

    #[error("no valid sector assignment: {reason}")]
    BalanceInfeasibility { reason: String },

    #[error("key logic inconsistent in {dungeon} at state [{state}]: {reason}")]
    LogicInconsistency {
        dungeon: String,
        state: String,
        reason: String,
    },
}

impl GenerationError {
    /// Retrying with a new seed can fix a bad random draw but not a rule derivation defect.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, GenerationError::LogicInconsistency { .. })
    }

    pub(crate) fn structural(dungeon: &str, reason: impl Into<String>) -> GenerationError {
        GenerationError::StructuralInfeasibility {
            dungeon: dungeon.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn balance(reason: impl Into<String>) -> GenerationError {
        GenerationError::BalanceInfeasibility {
            reason: reason.into(),
        }
    }

    pub(crate) fn logic(
        dungeon: &str,
        state: impl Into<String>,
        reason: impl Into<String>,
    ) -> GenerationError {
        GenerationError::LogicInconsistency {
            dungeon: dungeon.to_string(),
            state: state.into(),
            reason: reason.into(),
        }
    }
}

pub type GenResult<T> = std::result::Result<T, GenerationError>;
