use thiserror::Error;

use crate::models::EventKind;

/// Malformed input. Fatal for a single dispatch, a 400 at the API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("event has no actor")]
    MissingActor,

    #[error("event has no subject")]
    MissingSubject,

    #[error("{kind} event subject has no owner")]
    MissingSubjectOwner { kind: EventKind },

    #[error("{0} must not be empty")]
    EmptyField(&'static str),

    #[error("unknown platform: {0}")]
    UnknownPlatform(String),

    #[error("unknown transport kind: {0}")]
    UnknownTransportKind(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("device {device_id} not found for user {user_id}")]
    NotFound { user_id: String, device_id: String },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<sqlx::Error> for RegistryError {
    fn from(e: sqlx::Error) -> Self {
        Self::Store(StoreError::Database(e))
    }
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
