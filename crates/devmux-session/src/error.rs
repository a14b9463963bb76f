use thiserror::Error;

use crate::session::SessionId;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to connect to {target_id}: {reason}")]
    Connection { target_id: String, reason: String },
    #[error("session {0} not found")]
    NotFound(SessionId),
    #[error("session {0} has no open input channel")]
    NoInputChannel(SessionId),
    #[error("failed to resize session {id}: {reason}")]
    Resize { id: SessionId, reason: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type SessionResult<T> = Result<T, SessionError>;
