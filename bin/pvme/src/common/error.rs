use pvm_executor::ExecutorError;

/// Error types of the pvme commands
#[derive(Debug, thiserror::Error)]
pub enum PvmeError {
    /// Failed to read file
    #[error("Failed to read file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Invalid hex string
    #[error("Invalid hex string: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Execution error
    #[error("Execution error: {0}")]
    Execution(#[from] ExecutorError),

    /// Failed to set up logging
    #[error("Failed to initialize logging: {0}")]
    Logging(std::io::Error),

    /// Failed to encode output
    #[error("Failed to encode output: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for the pvme commands
pub type Result<T> = std::result::Result<T, PvmeError>;
