use crate::types::RoomCode;

pub type EngineResult<T> = Result<T, EngineError>;

/// Hard failures the engine reports to callers. Ordinary conditions —
/// waiting for the opponent, duplicate submissions, late submissions —
/// are values on the operation results, never errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error("room {0} not found")]
    RoomNotFound(RoomCode),

    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("room code space exhausted")]
    Conflict,

    #[error("room is full")]
    Full,
}

impl EngineError {
    /// Stable code for the transport boundary's `Error` events.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::RoomNotFound(_) | EngineError::NotFound(_) => "NOT_FOUND",
            EngineError::InvalidState(_) => "INVALID_STATE",
            EngineError::Unauthorized(_) => "UNAUTHORIZED",
            EngineError::Conflict => "CONFLICT",
            EngineError::Full => "FULL",
        }
    }
}
