//! Error taxonomy for orchestration requests.
//!
//! Validation, conflict, not-found and authorization failures are replied to
//! the originating client. Stale or duplicate events are absorbed silently, and
//! a lost partner is resolved into a forfeit broadcast rather than an error.

use shared::{ErrorCode, ErrorPayload, UserId};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConflictKind {
    #[error("room is full")]
    RoomFull,
    #[error("already joined")]
    AlreadyJoined,
    #[error("room is starting")]
    RoomStarting,
    #[error("configuration is locked once the room starts")]
    ConfigLocked,
    #[error("only the host can do that")]
    NotHost,
    #[error("tournament has already started")]
    TournamentStarted,
    #[error("tournament is full")]
    TournamentFull,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrchestratorError {
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("conflict: {0}")]
    Conflict(ConflictKind),
    #[error("{0} not found")]
    NotFound(String),
    #[error("stale or duplicate event: {0}")]
    StateConflict(String),
    #[error("lost contact with player {0}")]
    PartnerLost(UserId),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
}

impl OrchestratorError {
    /// Wire code for errors that are surfaced to a client.
    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            OrchestratorError::Validation(_) => Some(ErrorCode::Validation),
            OrchestratorError::Conflict(_) => Some(ErrorCode::Conflict),
            OrchestratorError::NotFound(_) => Some(ErrorCode::NotFound),
            OrchestratorError::Unauthorized(_) => Some(ErrorCode::Unauthorized),
            OrchestratorError::StateConflict(_) | OrchestratorError::PartnerLost(_) => None,
        }
    }

    pub fn payload(&self) -> Option<ErrorPayload> {
        self.error_code().map(|code| ErrorPayload {
            code,
            message: self.to_string(),
        })
    }
}

impl From<ConflictKind> for OrchestratorError {
    fn from(kind: ConflictKind) -> Self {
        OrchestratorError::Conflict(kind)
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to encode record: {0}")]
    Codec(#[from] bincode::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}
