use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Cache lookup failed for {key}: {message}")]
    CacheLookup { key: String, message: String },

    #[error("Object has no name: {0}")]
    MissingName(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}
