//! Error handling and custom error types
//!
//! Provides unified error handling across the service using thiserror.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image processing error: {0}")]
    Image(#[from] image::ImageError),

    #[error("{0}")]
    Validation(String),

    #[error("Conversion failed: {0}")]
    Codec(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invariant violated: {0}")]
    Invariant(String),
}

impl Error {
    /// True for errors caused by the caller's input rather than the service.
    pub fn is_client_fault(&self) -> bool {
        matches!(self, Error::Validation(_) | Error::Codec(_) | Error::Image(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
