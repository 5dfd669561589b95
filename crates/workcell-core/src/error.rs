use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkcellError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl WorkcellError {
    /// Short error code string, stable across releases.
    pub fn code(&self) -> &'static str {
        match self {
            WorkcellError::Config(_) => "CONFIG_ERROR",
            WorkcellError::Io(_) => "IO_ERROR",
            WorkcellError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, WorkcellError>;
