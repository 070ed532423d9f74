use thiserror::Error;

use crate::core::types::RunState;

#[derive(Error, Debug)]
pub enum EvoError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Reproduction error: {0}")]
    Reproduction(String),

    #[error("Evaluation error: {0}")]
    Evaluation(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Run capacity exhausted: {max_users} runs already active")]
    CapacityExhausted { max_users: usize },

    #[error("Invalid run state transition: {from} -> {to}")]
    InvalidTransition { from: RunState, to: RunState },

    #[error("Listener error: {0}")]
    Listener(String),

    #[error("Join error: {0}")]
    Join(String),
}

pub type Result<T> = std::result::Result<T, EvoError>;

impl From<serde_json::Error> for EvoError {
    fn from(err: serde_json::Error) -> Self {
        Self::Persistence(err.to_string())
    }
}

impl From<std::io::Error> for EvoError {
    fn from(err: std::io::Error) -> Self {
        Self::Persistence(err.to_string())
    }
}
