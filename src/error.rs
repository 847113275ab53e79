use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DesmokeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("checkpoint error: {0}")]
    Recorder(#[from] burn::record::RecorderError),

    #[error("failed to serialize report: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to load config file {}: {reason}", path.display())]
    ConfigFile { path: PathBuf, reason: String },

    #[error("directory does not exist: {}", .0.display())]
    MissingDirectory(PathBuf),

    #[error("no images found in directory: {}", .0.display())]
    EmptyDirectory(PathBuf),

    #[error("index {index} out of bounds (size: {size})")]
    IndexOutOfBounds { index: usize, size: usize },

    #[error("no image statistics to aggregate")]
    NoStatistics,

    #[error("tensor data conversion failed: {0}")]
    TensorData(String),
}

pub type Result<T> = std::result::Result<T, DesmokeError>;
