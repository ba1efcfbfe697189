use thiserror::Error;

use crate::DOCUMENTATION_URL;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("Image processing error: {0}")]
    Image(#[from] image::ImageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Missing or invalid recipe parameter. Raised before any device or
    /// model work starts.
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Model loading error: {0}")]
    ModelLoading(String),

    #[error("Tokenization error: {0}")]
    Tokenization(String),

    #[error("HuggingFace Hub error: {0}")]
    HfHub(String),

    #[error("Folder error: {0}")]
    Folder(String),

    #[error("Git command `{command}` failed: {status}")]
    GitCommand { command: String, status: String },

    #[error(
        "Git LFS isn't installed for the Git executable located at {git_path:?}. \
         See the documentation for installation instructions: {}#Download-weights",
        DOCUMENTATION_URL
    )]
    LfsNotInstalled { git_path: String },
}

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}
