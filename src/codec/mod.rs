//! Image format conversion
//!
//! Wraps the image codec behind [`CodecService`] so the batch engine can be
//! driven by the real encoder or by a mock in tests.

pub mod mock;
pub mod processor;

pub use mock::MockCodec;
pub use processor::ImageCodec;

use crate::models::OutputFormat;
use crate::{Error, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

#[async_trait]
pub trait CodecService: Send + Sync {
    /// Convert `source` into `format`, returning the path of the written output.
    async fn encode(&self, source: &Path, format: OutputFormat) -> Result<PathBuf>;
}

/// Derive the output file name for a source file.
///
/// Ingest names are unique (`<millis>-<random>.<ext>`), so the part before the
/// first `.` is unique as well and the output can never collide with another job.
pub fn output_filename(source: &Path, format: OutputFormat) -> Result<String> {
    let stem = source
        .file_name()
        .and_then(|name| name.to_str())
        .and_then(|name| name.split('.').next())
        .filter(|stem| !stem.is_empty())
        .ok_or_else(|| {
            Error::Codec(format!(
                "Source path has no usable file name: {}",
                source.display()
            ))
        })?;

    Ok(format!("{}.{}", stem, format.extension()))
}
