use std::path::PathBuf;

use roomctl_process::RoomId;

/// Coarse error class, mapped 1:1 onto HTTP statuses by the control API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Execution,
}

impl ErrorKind {
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Execution => "execution",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("client executable not found at: {}", .0.display())]
    ExecutableNotFound(PathBuf),

    #[error("failed to spawn client for room {room_id}: {source}")]
    SpawnFailed {
        room_id: RoomId,
        #[source]
        source: std::io::Error,
    },

    #[error("room {0} is already active")]
    RoomAlreadyActive(RoomId),

    #[error("no active connection found for room {0}")]
    RoomNotFound(String),

    #[error("failed to confirm exit of client for room {room_id}: {source}")]
    TerminationFailed {
        room_id: RoomId,
        #[source]
        source: std::io::Error,
    },
}

impl ManagerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ManagerError::RoomNotFound(_) => ErrorKind::NotFound,
            ManagerError::RoomAlreadyActive(_) => ErrorKind::Conflict,
            ManagerError::ExecutableNotFound(_)
            | ManagerError::SpawnFailed { .. }
            | ManagerError::TerminationFailed { .. } => ErrorKind::Execution,
        }
    }
}
