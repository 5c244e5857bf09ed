use thiserror::Error;

#[derive(Debug, Error)]
pub enum AssocSyncError {
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error(transparent)]
    SlurmError(#[from] slurm_assoc::SlurmError),
    #[error("Store error: {0}")]
    StoreError(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
}

impl From<serde_json::error::Error> for AssocSyncError {
    fn from(e: serde_json::error::Error) -> Self {
        Self::SerializationError(e.to_string())
    }
}

impl From<toml::de::Error> for AssocSyncError {
    fn from(error: toml::de::Error) -> Self {
        Self::DeserializationError(error.to_string())
    }
}
