use crate::messages::ErrorCode;
use thiserror::Error;

/// Errors produced by the undine protocol and daemon layers.
#[derive(Debug, Error)]
pub enum UndineError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("frame too large: {len} bytes (max {max})")]
    FrameTooLarge { len: usize, max: usize },

    #[error("exec not found: {0}")]
    ExecNotFound(String),

    #[error("spawn failed: {0}")]
    Spawn(String),

    #[error("unknown uuid: {0}")]
    UnknownId(String),

    #[error("duplicate uuid: {0}")]
    DuplicateId(String),

    #[error("limit reached: {0}")]
    Limit(String),

    #[error("channel closed: {0}")]
    ChannelClosed(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl UndineError {
    /// Wire error code reported to the peer for this failure.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            UndineError::ExecNotFound(_) => ErrorCode::NotFound,
            UndineError::Codec(_)
            | UndineError::InvalidMessage(_)
            | UndineError::FrameTooLarge { .. } => ErrorCode::Fatal,
            _ => ErrorCode::Other,
        }
    }
}

impl From<ciborium::de::Error<std::io::Error>> for UndineError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        UndineError::Codec(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for UndineError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        UndineError::Codec(e.to_string())
    }
}

pub type UndineResult<T> = Result<T, UndineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_errors_map_to_wire_codes() {
        assert_eq!(
            UndineError::ExecNotFound("nope".into()).error_code(),
            ErrorCode::NotFound
        );
        assert_eq!(
            UndineError::Spawn("permission denied".into()).error_code(),
            ErrorCode::Other
        );
        assert_eq!(
            UndineError::DuplicateId("a".into()).error_code(),
            ErrorCode::Other
        );
        assert_eq!(
            UndineError::FrameTooLarge { len: 10, max: 5 }.error_code(),
            ErrorCode::Fatal
        );
    }
}
