//! Data models and configuration
//!
//! Defines the conversion job/result types exchanged between the HTTP layer
//! and the batch engine, plus the service configuration loaded at start-up.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Output formats the codec can produce.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Jpeg,
    Png,
    Webp,
}

impl OutputFormat {
    pub const ALL: [OutputFormat; 3] = [OutputFormat::Jpeg, OutputFormat::Png, OutputFormat::Webp];

    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "jpeg",
            OutputFormat::Png => "png",
            OutputFormat::Webp => "webp",
        }
    }

    /// File extension used for converted outputs.
    pub fn extension(&self) -> &'static str {
        self.as_str()
    }

    /// Uppercased name reported back to clients.
    pub fn display_name(&self) -> String {
        self.as_str().to_uppercase()
    }

    pub fn image_format(&self) -> image::ImageFormat {
        match self {
            OutputFormat::Jpeg => image::ImageFormat::Jpeg,
            OutputFormat::Png => image::ImageFormat::Png,
            OutputFormat::Webp => image::ImageFormat::WebP,
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputFormat {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "jpeg" | "jpg" => Ok(OutputFormat::Jpeg),
            "png" => Ok(OutputFormat::Png),
            "webp" => Ok(OutputFormat::Webp),
            other => {
                let supported: Vec<&str> = Self::ALL.iter().map(|f| f.as_str()).collect();
                Err(crate::Error::Validation(format!(
                    "Unsupported format '{}'. Supported formats: {}",
                    other,
                    supported.join(", ")
                )))
            }
        }
    }
}

/// One uploaded file waiting to be converted.
#[derive(Debug, Clone)]
pub struct ConversionJob {
    /// Temporary input file. The engine deletes it after the conversion attempt.
    pub source_path: PathBuf,
    /// Client-supplied name, display only.
    pub original_name: String,
    /// `None` means the configured default format.
    pub target_format: Option<OutputFormat>,
}

impl ConversionJob {
    pub fn new(
        source_path: PathBuf,
        original_name: String,
        target_format: Option<OutputFormat>,
    ) -> Self {
        Self {
            source_path,
            original_name,
            target_format,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConvertedFile {
    pub original_name: String,
    pub filename: String,
    pub url: String,
    pub format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FailedConversion {
    pub original_name: String,
    pub error: String,
}

/// Outcome of a single job, in the same position as the job in its batch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ConversionResult {
    Success(ConvertedFile),
    Failure(FailedConversion),
}

impl ConversionResult {
    pub fn original_name(&self) -> &str {
        match self {
            ConversionResult::Success(file) => &file.original_name,
            ConversionResult::Failure(failed) => &failed.original_name,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ConversionResult::Success(_))
    }

    pub fn converted(&self) -> Option<&ConvertedFile> {
        match self {
            ConversionResult::Success(file) => Some(file),
            ConversionResult::Failure(_) => None,
        }
    }
}

/// How the HTTP layer reports a batch containing failed jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatchFailurePolicy {
    /// One result per job; failures are reported inline.
    #[default]
    PerJob,
    /// Any failed job turns the whole response into a single error.
    AllOrNothing,
}

impl FromStr for BatchFailurePolicy {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "per-job" | "per_job" | "perjob" => Ok(BatchFailurePolicy::PerJob),
            "all-or-nothing" | "all_or_nothing" | "strict" => Ok(BatchFailurePolicy::AllOrNothing),
            other => Err(crate::Error::Config(format!(
                "Invalid batch failure policy '{}'. Expected per-job or all-or-nothing",
                other
            ))),
        }
    }
}

// Configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub upload_dir: PathBuf,
    pub converted_dir: PathBuf,
    pub max_concurrent_conversions: usize,
    pub retention: Duration,
    pub default_format: OutputFormat,
    pub max_files: usize,
    pub max_file_size: usize,
    pub allowed_origins: Vec<String>,
    pub failure_policy: BatchFailurePolicy,
    /// `None` disables the periodic sweep.
    pub sweep_interval: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            upload_dir: PathBuf::from("uploads"),
            converted_dir: PathBuf::from("converted"),
            max_concurrent_conversions: 4,
            retention: Duration::from_secs(60 * 60),
            default_format: OutputFormat::Png,
            max_files: 10,
            max_file_size: 10 * 1024 * 1024,
            allowed_origins: Vec::new(),
            failure_policy: BatchFailurePolicy::PerJob,
            sweep_interval: Some(Duration::from_secs(300)),
        }
    }
}

impl Config {
    pub fn from_env() -> crate::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup, falling back to defaults.
    pub fn from_lookup<F>(lookup: F) -> crate::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let config = Self {
            host: lookup("HOST").unwrap_or(defaults.host),
            port: parse_var(&lookup, "PORT")?.unwrap_or(defaults.port),
            upload_dir: lookup("UPLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.upload_dir),
            converted_dir: lookup("CONVERTED_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.converted_dir),
            max_concurrent_conversions: parse_var(&lookup, "MAX_CONCURRENT_CONVERSIONS")?
                .unwrap_or(defaults.max_concurrent_conversions),
            retention: parse_var(&lookup, "RETENTION_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.retention),
            default_format: match lookup("DEFAULT_FORMAT") {
                Some(value) => value
                    .parse()
                    .map_err(|e| crate::Error::Config(format!("DEFAULT_FORMAT: {}", e)))?,
                None => defaults.default_format,
            },
            max_files: parse_var(&lookup, "MAX_FILES")?.unwrap_or(defaults.max_files),
            max_file_size: parse_var(&lookup, "MAX_FILE_SIZE_BYTES")?
                .unwrap_or(defaults.max_file_size),
            allowed_origins: lookup("CORS_ALLOWED_ORIGINS")
                .map(|value| {
                    value
                        .split(',')
                        .map(str::trim)
                        .filter(|origin| !origin.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or(defaults.allowed_origins),
            failure_policy: match lookup("BATCH_FAILURE_POLICY") {
                Some(value) => value.parse()?,
                None => defaults.failure_policy,
            },
            sweep_interval: match parse_var::<u64, _>(&lookup, "SWEEP_INTERVAL_SECS")? {
                Some(0) => None,
                Some(secs) => Some(Duration::from_secs(secs)),
                None => defaults.sweep_interval,
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.max_concurrent_conversions == 0 {
            return Err(crate::Error::Config(
                "MAX_CONCURRENT_CONVERSIONS must be at least 1".to_string(),
            ));
        }
        if self.max_files == 0 {
            return Err(crate::Error::Config("MAX_FILES must be at least 1".to_string()));
        }
        if self.retention.is_zero() {
            return Err(crate::Error::Config(
                "RETENTION_SECS must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> crate::Result<Option<T>>
where
    T: FromStr,
    T::Err: fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| crate::Error::Config(format!("{} has invalid value '{}': {}", key, value, e))),
        None => Ok(None),
    }
}
