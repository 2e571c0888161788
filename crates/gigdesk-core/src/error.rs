use thiserror::Error;
use uuid::Uuid;

use crate::orchestrator::records::ActionState;

#[derive(Debug, Error)]
pub enum GigError {
    #[error("store error: {0}")]
    Store(String),

    #[error("{kind} already open for {key}")]
    Conflict { kind: &'static str, key: String },

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("next action {id} is already {state}")]
    ActionClosed { id: Uuid, state: ActionState },

    #[error("{op} timed out after {secs}s")]
    Timeout { op: String, secs: u64 },

    #[error("delivery failed: {0}")]
    Delivery(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("home directory not found: set HOME environment variable")]
    HomeNotFound,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl GigError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        GigError::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, GigError>;
