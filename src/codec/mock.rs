use super::{output_filename, CodecService};
use crate::models::OutputFormat;
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecEvent {
    Started(String),
    Finished(String),
}

/// Codec double that records calls and concurrency instead of touching pixels.
#[derive(Clone)]
pub struct MockCodec {
    base_path: PathBuf,
    delay: Duration,
    write_outputs: bool,
    should_fail: Arc<Mutex<bool>>,
    failing_sources: Arc<Mutex<HashSet<String>>>,
    call_count: Arc<Mutex<usize>>,
    in_flight: Arc<Mutex<usize>>,
    max_in_flight: Arc<Mutex<usize>>,
    events: Arc<Mutex<Vec<CodecEvent>>>,
}

impl MockCodec {
    pub fn new() -> Self {
        Self {
            base_path: PathBuf::from("/tmp"),
            delay: Duration::ZERO,
            write_outputs: false,
            should_fail: Arc::new(Mutex::new(false)),
            failing_sources: Arc::new(Mutex::new(HashSet::new())),
            call_count: Arc::new(Mutex::new(0)),
            in_flight: Arc::new(Mutex::new(0)),
            max_in_flight: Arc::new(Mutex::new(0)),
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_base_path(mut self, path: PathBuf) -> Self {
        self.base_path = path;
        self
    }

    /// Simulated encode time, so concurrent calls overlap.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Write a placeholder file at the output path on success.
    pub fn with_output_files(mut self, write_outputs: bool) -> Self {
        self.write_outputs = write_outputs;
        self
    }

    pub fn with_failure(self, should_fail: bool) -> Self {
        *self.should_fail.lock().unwrap() = should_fail;
        self
    }

    /// Fail only for sources with this file name.
    pub fn with_failing_source(self, file_name: &str) -> Self {
        self.failing_sources
            .lock()
            .unwrap()
            .insert(file_name.to_string());
        self
    }

    pub fn get_call_count(&self) -> usize {
        *self.call_count.lock().unwrap()
    }

    pub fn get_max_in_flight(&self) -> usize {
        *self.max_in_flight.lock().unwrap()
    }

    pub fn get_events(&self) -> Vec<CodecEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl Default for MockCodec {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CodecService for MockCodec {
    async fn encode(&self, source: &Path, format: OutputFormat) -> Result<PathBuf> {
        let source_name = source
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();

        {
            *self.call_count.lock().unwrap() += 1;
            let mut in_flight = self.in_flight.lock().unwrap();
            *in_flight += 1;
            let mut max = self.max_in_flight.lock().unwrap();
            *max = (*max).max(*in_flight);
            self.events
                .lock()
                .unwrap()
                .push(CodecEvent::Started(source_name.clone()));
        }

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        *self.in_flight.lock().unwrap() -= 1;
        self.events
            .lock()
            .unwrap()
            .push(CodecEvent::Finished(source_name.clone()));

        let fail = *self.should_fail.lock().unwrap()
            || self.failing_sources.lock().unwrap().contains(&source_name);
        if fail {
            return Err(Error::Codec(format!("Mock failure for {}", source_name)));
        }

        let output_path = self.base_path.join(output_filename(source, format)?);
        if self.write_outputs {
            std::fs::write(&output_path, format.as_str())?;
        }
        Ok(output_path)
    }
}
