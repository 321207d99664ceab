use thiserror::Error;

pub type Result<T> = std::result::Result<T, FileStreamError>;

#[derive(Error, Debug)]
pub enum FileStreamError {
    #[error("Stream is not readable")]
    NotReadable,
    #[error("Unknown whence: {0}")]
    UnknownWhence(i32),
    #[error("Invalid offset: {0}")]
    InvalidOffset(i64),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<Box<dyn std::error::Error>> for FileStreamError {
    fn from(e: Box<dyn std::error::Error>) -> Self {
        Self::Other(anyhow::anyhow!(e.to_string()))
    }
}
