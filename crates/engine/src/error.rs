use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Filter error: {0}")]
    Filter(#[from] sentinel_filters::FilterError),

    #[error("Vision error: {0}")]
    Vision(#[from] sentinel_vision::VisionError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Fetch error: {0}")]
    Fetch(String),

    #[error("Classifier error: {0}")]
    Classifier(String),

    #[error("Watcher error: {0}")]
    Watcher(String),

    #[error("Engine is shutting down")]
    Closed,
}
