use thiserror::Error;

#[derive(Debug, Error)]
pub enum SlurmError {
    /// Connection, authentication or command failure while talking to the scheduler.
    #[error("Transport error: {0}")]
    Transport(String),
    /// Malformed dump, table or JSON payload.
    #[error("Parse error: {0}")]
    Parse(String),
    /// Two data sources disagree about an entity.
    #[error("Mapping conflict: {0}")]
    MappingConflict(String),
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

impl From<reqwest::Error> for SlurmError {
    fn from(error: reqwest::Error) -> Self {
        Self::Transport(error.to_string())
    }
}

impl From<serde_json::Error> for SlurmError {
    fn from(error: serde_json::Error) -> Self {
        Self::Parse(error.to_string())
    }
}

pub type SlurmResult<T> = Result<T, SlurmError>;

pub fn parse_error<T>(message: String) -> SlurmResult<T> {
    Err(SlurmError::Parse(message))
}

