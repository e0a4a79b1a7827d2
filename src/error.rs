use serde_json::json;

use crate::ipc::error::err;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncompleteReason {
    QuestionsUnanswered,
    CorrectionsNotRevised,
}

impl IncompleteReason {
    pub fn as_str(self) -> &'static str {
        match self {
            IncompleteReason::QuestionsUnanswered => "questions_unanswered",
            IncompleteReason::CorrectionsNotRevised => "corrections_not_revised",
        }
    }
}

/// Failure of a core operation. Every variant is raised before the first
/// write of the operation, or the surrounding transaction is rolled back.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("caller identity missing")]
    NotAuthenticated,

    #[error("{0}")]
    NotAuthorized(String),

    #[error("{message}")]
    InvalidState {
        message: String,
        status: Option<String>,
    },

    #[error("{message}")]
    IncompleteSubmission {
        reason: IncompleteReason,
        message: String,
        question_ids: Vec<String>,
    },

    #[error("{0}")]
    Validation(String),

    #[error("{entity} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("{0}")]
    BadParams(String),

    #[error(transparent)]
    Db(#[from] rusqlite::Error),
}

pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    pub fn not_authorized(message: impl Into<String>) -> Self {
        CoreError::NotAuthorized(message.into())
    }

    pub fn invalid_state(message: impl Into<String>, status: Option<&str>) -> Self {
        CoreError::InvalidState {
            message: message.into(),
            status: status.map(|s| s.to_string()),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        CoreError::Validation(message.into())
    }

    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        CoreError::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        CoreError::BadParams(message.into())
    }

    pub fn code(&self) -> &'static str {
        match self {
            CoreError::NotAuthenticated => "not_authenticated",
            CoreError::NotAuthorized(_) => "not_authorized",
            CoreError::InvalidState { .. } => "invalid_state",
            CoreError::IncompleteSubmission { .. } => "incomplete_submission",
            CoreError::Validation(_) => "validation_error",
            CoreError::NotFound { .. } => "not_found",
            CoreError::BadParams(_) => "bad_params",
            CoreError::Db(_) => "db_error",
        }
    }

    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            CoreError::InvalidState {
                status: Some(status),
                ..
            } => Some(json!({ "status": status })),
            CoreError::IncompleteSubmission {
                reason,
                question_ids,
                ..
            } => Some(json!({
                "reason": reason.as_str(),
                "questionIds": question_ids,
            })),
            CoreError::NotFound { entity, id } => Some(json!({ "entity": entity, "id": id })),
            _ => None,
        }
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        let code = self.code();
        let details = self.details();
        err(id, code, self.to_string(), details)
    }
}
