//! Bounded-concurrency batch conversion
//!
//! A batch is split into consecutive sub-batches no larger than the
//! concurrency ceiling. Jobs inside a sub-batch run concurrently; the next
//! sub-batch starts only once the current one has fully completed. Each job
//! produces its own result, so one failed conversion never hides its siblings.

use crate::codec::CodecService;
use crate::models::{
    Config, ConversionJob, ConversionResult, ConvertedFile, FailedConversion, OutputFormat,
};
use crate::retention::{delete_quietly, RetentionScheduler};
use crate::{Error, Result};
use futures::future::join_all;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Public path under which converted files are served.
pub const CONVERTED_ROUTE: &str = "/converted";

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub max_concurrent_conversions: usize,
    pub retention: Duration,
    pub default_format: OutputFormat,
}

impl From<&Config> for EngineSettings {
    fn from(config: &Config) -> Self {
        Self {
            max_concurrent_conversions: config.max_concurrent_conversions,
            retention: config.retention,
            default_format: config.default_format,
        }
    }
}

pub struct BatchEngine {
    codec: Box<dyn CodecService>,
    retention: RetentionScheduler,
    settings: EngineSettings,
}

impl BatchEngine {
    pub fn new(
        codec: Box<dyn CodecService>,
        retention: RetentionScheduler,
        settings: EngineSettings,
    ) -> Self {
        Self {
            codec,
            retention,
            settings,
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn retention(&self) -> &RetentionScheduler {
        &self.retention
    }

    /// Convert every job, returning one result per job in input order.
    ///
    /// Fails only when the batch is empty; per-job failures are reported as
    /// [`ConversionResult::Failure`].
    pub async fn convert_batch(&self, jobs: Vec<ConversionJob>) -> Result<Vec<ConversionResult>> {
        if jobs.is_empty() {
            return Err(Error::Validation("No files uploaded".to_string()));
        }

        let batch_id = Uuid::new_v4();
        let ceiling = self.settings.max_concurrent_conversions.max(1);
        info!(%batch_id, jobs = jobs.len(), ceiling, "Starting conversion batch");

        let mut results = Vec::with_capacity(jobs.len());
        for (index, sub_batch) in jobs.chunks(ceiling).enumerate() {
            debug!(%batch_id, sub_batch = index, size = sub_batch.len(), "Converting sub-batch");
            let outcomes = join_all(sub_batch.iter().map(|job| self.convert_one(job))).await;
            results.extend(outcomes);
        }

        let failed = results.iter().filter(|result| !result.is_success()).count();
        info!(
            %batch_id,
            succeeded = results.len() - failed,
            failed,
            "Conversion batch complete"
        );

        Ok(results)
    }

    /// All-or-nothing variant of [`convert_batch`](Self::convert_batch).
    ///
    /// Returns the first failure (by position) as [`Error::Codec`]. Outputs of
    /// jobs that did succeed stay registered and expire on schedule.
    pub async fn convert_batch_strict(
        &self,
        jobs: Vec<ConversionJob>,
    ) -> Result<Vec<ConvertedFile>> {
        let results = self.convert_batch(jobs).await?;

        let mut converted = Vec::with_capacity(results.len());
        for result in results {
            match result {
                ConversionResult::Success(file) => converted.push(file),
                ConversionResult::Failure(failed) => {
                    return Err(Error::Codec(format!(
                        "{}: {}",
                        failed.original_name, failed.error
                    )))
                }
            }
        }
        Ok(converted)
    }

    async fn convert_one(&self, job: &ConversionJob) -> ConversionResult {
        let format = job.target_format.unwrap_or(self.settings.default_format);

        let outcome = self.codec.encode(&job.source_path, format).await;

        // The source is released whatever the outcome.
        delete_quietly(&job.source_path);

        match outcome.and_then(|output_path| self.publish(job, &output_path, format)) {
            Ok(file) => ConversionResult::Success(file),
            Err(e) => {
                warn!(
                    original_name = %job.original_name,
                    source = %job.source_path.display(),
                    error = %e,
                    "Conversion failed"
                );
                ConversionResult::Failure(FailedConversion {
                    original_name: job.original_name.clone(),
                    error: e.to_string(),
                })
            }
        }
    }

    fn publish(
        &self,
        job: &ConversionJob,
        output_path: &Path,
        format: OutputFormat,
    ) -> Result<ConvertedFile> {
        let Some(filename) = output_path.file_name().and_then(|name| name.to_str()) else {
            delete_quietly(output_path);
            return Err(Error::Invariant(format!(
                "Invalid output path: {}",
                output_path.display()
            )));
        };

        self.retention
            .schedule_deletion(output_path.to_path_buf(), self.settings.retention);

        Ok(ConvertedFile {
            original_name: job.original_name.clone(),
            filename: filename.to_string(),
            url: format!("{}/{}", CONVERTED_ROUTE, filename),
            format: format.display_name(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::mock::CodecEvent;
    use crate::codec::{ImageCodec, MockCodec};
    use std::path::PathBuf;
    use tempfile::TempDir;

    struct Harness {
        uploads: TempDir,
        converted: TempDir,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                uploads: TempDir::new().unwrap(),
                converted: TempDir::new().unwrap(),
            }
        }

        fn mock_codec(&self) -> MockCodec {
            MockCodec::new()
                .with_base_path(self.converted.path().to_path_buf())
                .with_output_files(true)
        }

        fn engine(&self, codec: impl CodecService + 'static, ceiling: usize) -> BatchEngine {
            BatchEngine::new(
                Box::new(codec),
                RetentionScheduler::new(),
                EngineSettings {
                    max_concurrent_conversions: ceiling,
                    retention: Duration::from_secs(3600),
                    default_format: OutputFormat::Png,
                },
            )
        }

        /// Stage an upload named like the ingress does.
        fn upload(
            &self,
            stored_name: &str,
            original_name: &str,
            format: Option<OutputFormat>,
        ) -> ConversionJob {
            let path = self.uploads.path().join(stored_name);
            std::fs::write(&path, b"upload").unwrap();
            ConversionJob::new(path, original_name.to_string(), format)
        }

        fn upload_png(&self, stored_name: &str, original_name: &str) -> ConversionJob {
            let path = self.uploads.path().join(stored_name);
            image::RgbImage::from_pixel(4, 4, image::Rgb([0, 128, 255]))
                .save_with_format(&path, image::ImageFormat::Png)
                .unwrap();
            ConversionJob::new(path, original_name.to_string(), Some(OutputFormat::Webp))
        }
    }

    #[tokio::test]
    async fn test_five_jobs_run_as_four_then_one() {
        let harness = Harness::new();
        let codec = harness.mock_codec().with_delay(Duration::from_millis(20));
        let probe = codec.clone();
        let engine = harness.engine(codec, 4);

        let jobs: Vec<ConversionJob> = (0..5)
            .map(|i| {
                harness.upload(
                    &format!("10{}-1.jpg", i),
                    &format!("photo{}.jpg", i),
                    Some(OutputFormat::Webp),
                )
            })
            .collect();

        let results = engine.convert_batch(jobs).await.unwrap();

        assert_eq!(results.len(), 5);
        for (i, result) in results.iter().enumerate() {
            let file = result.converted().expect("conversion should succeed");
            assert_eq!(file.original_name, format!("photo{}.jpg", i));
            assert_eq!(file.format, "WEBP");
            assert_eq!(file.filename, format!("10{}-1.webp", i));
            assert_eq!(file.url, format!("/converted/10{}-1.webp", i));
        }
        assert_eq!(probe.get_max_in_flight(), 4);

        // The fifth job starts only after the first four have finished
        let events = probe.get_events();
        let fifth_start = events
            .iter()
            .position(|e| *e == CodecEvent::Started("104-1.jpg".to_string()))
            .unwrap();
        let finished_before = events[..fifth_start]
            .iter()
            .filter(|e| matches!(e, CodecEvent::Finished(_)))
            .count();
        assert_eq!(finished_before, 4);
    }

    #[tokio::test]
    async fn test_concurrency_never_exceeds_ceiling() {
        let harness = Harness::new();
        let codec = harness.mock_codec().with_delay(Duration::from_millis(5));
        let probe = codec.clone();
        let engine = harness.engine(codec, 3);

        let jobs: Vec<ConversionJob> = (0..10)
            .map(|i| harness.upload(&format!("2{:02}-9.png", i), "same.png", None))
            .collect();

        let results = engine.convert_batch(jobs).await.unwrap();

        assert_eq!(results.len(), 10);
        assert_eq!(probe.get_call_count(), 10);
        assert_eq!(probe.get_max_in_flight(), 3);
    }

    #[tokio::test]
    async fn test_missing_format_uses_default() {
        let harness = Harness::new();
        let engine = harness.engine(harness.mock_codec(), 4);

        let results = engine
            .convert_batch(vec![harness.upload("300-1.webp", "in.webp", None)])
            .await
            .unwrap();

        let file = results[0].converted().unwrap();
        assert_eq!(file.format, "PNG");
        assert!(file.filename.ends_with(".png"));
    }

    #[tokio::test]
    async fn test_failure_is_isolated_to_its_job() {
        let harness = Harness::new();
        let codec = harness.mock_codec().with_failing_source("401-1.png");
        let engine = harness.engine(codec, 2);

        let jobs = vec![
            harness.upload("400-1.png", "first.png", Some(OutputFormat::Jpeg)),
            harness.upload("401-1.png", "second.png", Some(OutputFormat::Jpeg)),
            harness.upload("402-1.png", "third.png", Some(OutputFormat::Jpeg)),
        ];
        let sources: Vec<PathBuf> = jobs.iter().map(|job| job.source_path.clone()).collect();

        let results = engine.convert_batch(jobs).await.unwrap();

        assert!(results[0].is_success());
        assert!(!results[1].is_success());
        assert!(results[2].is_success());
        assert_eq!(results[1].original_name(), "second.png");

        for source in sources {
            assert!(!source.exists(), "source {} should be deleted", source.display());
        }
        assert_eq!(engine.retention().len(), 2);
    }

    #[tokio::test]
    async fn test_strict_mode_reports_first_failure() {
        let harness = Harness::new();
        let codec = harness.mock_codec().with_failing_source("501-1.png");
        let engine = harness.engine(codec, 4);

        let err = engine
            .convert_batch_strict(vec![
                harness.upload("500-1.png", "ok.png", None),
                harness.upload("501-1.png", "broken.png", None),
            ])
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Codec(_)));
        assert!(err.to_string().contains("broken.png"));
        // The sibling's output still expires on schedule
        assert_eq!(engine.retention().len(), 1);
    }

    #[tokio::test]
    async fn test_strict_mode_all_success() {
        let harness = Harness::new();
        let engine = harness.engine(harness.mock_codec(), 4);

        let files = engine
            .convert_batch_strict(vec![
                harness.upload("600-1.png", "a.png", None),
                harness.upload("600-2.png", "b.png", None),
            ])
            .await
            .unwrap();

        let names: Vec<&str> = files.iter().map(|f| f.original_name.as_str()).collect();
        assert_eq!(names, vec!["a.png", "b.png"]);
    }

    #[tokio::test]
    async fn test_duplicate_original_names_get_distinct_outputs() {
        let harness = Harness::new();
        let engine = harness.engine(harness.mock_codec(), 4);

        let results = engine
            .convert_batch(vec![
                harness.upload("700-111.jpg", "holiday.jpg", None),
                harness.upload("700-222.jpg", "holiday.jpg", None),
            ])
            .await
            .unwrap();

        let first = results[0].converted().unwrap();
        let second = results[1].converted().unwrap();
        assert_eq!(first.original_name, second.original_name);
        assert_ne!(first.filename, second.filename);
        assert!(harness.converted.path().join(&first.filename).exists());
        assert!(harness.converted.path().join(&second.filename).exists());
    }

    #[tokio::test]
    async fn test_empty_batch_is_rejected() {
        let harness = Harness::new();
        let codec = harness.mock_codec();
        let probe = codec.clone();
        let engine = harness.engine(codec, 4);

        let err = engine.convert_batch(Vec::new()).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(probe.get_call_count(), 0);
    }

    #[tokio::test]
    async fn test_corrupt_input_with_real_codec() {
        let harness = Harness::new();
        let codec = ImageCodec::new(harness.converted.path()).unwrap();
        let engine = harness.engine(codec, 4);

        let job = harness.upload("800-1.jpg", "corrupt.jpg", Some(OutputFormat::Png));
        let source = job.source_path.clone();

        let err = engine.convert_batch_strict(vec![job]).await.unwrap_err();
        assert!(err.to_string().contains("corrupt.jpg"));
        assert!(!source.exists());
        assert!(engine.retention().is_empty());
    }

    #[tokio::test]
    async fn test_real_codec_registers_output_for_retention() {
        let harness = Harness::new();
        let codec = ImageCodec::new(harness.converted.path()).unwrap();
        let engine = harness.engine(codec, 4);

        let results = engine
            .convert_batch(vec![harness.upload_png("900-1.png", "pic.png")])
            .await
            .unwrap();

        let file = results[0].converted().unwrap();
        let output = harness.converted.path().join(&file.filename);
        assert!(output.exists());
        assert!(engine.retention().contains(&output));
    }
}
