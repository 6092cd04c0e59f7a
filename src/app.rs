//! Application wiring: directories, services, background sweep and HTTP server.

use crate::codec::{CodecService, ImageCodec};
use crate::engine::{BatchEngine, EngineSettings};
use crate::models::Config;
use crate::retention::{start_sweep_task, sweep_expired, RetentionScheduler};
use crate::server::{create_router, shutdown_signal, AppState};
use crate::{Error, Result};
use axum::Router;
use std::fs;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

/// Owns the shared state behind the HTTP server.
pub struct App {
    state: AppState,
}

/// Injectable service bundle used to construct [`App`] in tests/harnesses.
pub struct AppServices {
    pub codec: Box<dyn CodecService>,
    pub retention: RetentionScheduler,
}

impl App {
    /// Build an app from concrete service dependencies.
    ///
    /// The configured directories must already exist.
    pub fn with_services(services: AppServices, config: Config) -> Self {
        let engine = BatchEngine::new(
            services.codec,
            services.retention,
            EngineSettings::from(&config),
        );

        Self {
            state: AppState {
                engine: Arc::new(engine),
                config: Arc::new(config),
            },
        }
    }

    /// Create the working directories and wire up the real codec.
    pub fn new(mut config: Config) -> Result<Self> {
        config.validate()?;

        fs::create_dir_all(&config.upload_dir)?;
        fs::create_dir_all(&config.converted_dir)?;
        config.upload_dir = fs::canonicalize(&config.upload_dir)?;
        config.converted_dir = fs::canonicalize(&config.converted_dir)?;
        info!("Uploads directory: {}", config.upload_dir.display());
        info!("Converted directory: {}", config.converted_dir.display());

        let codec = Box::new(ImageCodec::new(&config.converted_dir)?);

        Ok(Self::with_services(
            AppServices {
                codec,
                retention: RetentionScheduler::new(),
            },
            config,
        ))
    }

    pub fn config(&self) -> &Config {
        &self.state.config
    }

    pub fn engine(&self) -> &BatchEngine {
        &self.state.engine
    }

    pub fn router(&self) -> Router {
        create_router(self.state.clone())
    }

    /// Remove leftovers older than the retention window, e.g. from a previous run.
    pub fn sweep_now(&self) -> usize {
        let config = &self.state.config;
        [&config.upload_dir, &config.converted_dir]
            .into_iter()
            .map(|dir| match sweep_expired(dir, config.retention) {
                Ok(count) => count,
                Err(e) => {
                    warn!("Sweep of {} failed: {}", dir.display(), e);
                    0
                }
            })
            .sum()
    }

    /// Serve until Ctrl+C / SIGTERM.
    pub async fn run(self) -> Result<()> {
        let config = Arc::clone(&self.state.config);

        let swept = self.sweep_now();
        if swept > 0 {
            info!("Removed {} expired files left from a previous run", swept);
        }

        let sweeper = config.sweep_interval.map(|interval| {
            start_sweep_task(
                vec![config.upload_dir.clone(), config.converted_dir.clone()],
                config.retention,
                interval,
            )
        });

        let addr: SocketAddr = format!("{}:{}", config.host, config.port)
            .parse()
            .map_err(|e| Error::Config(format!("Invalid server address: {}", e)))?;
        let listener = tokio::net::TcpListener::bind(addr).await?;

        info!("Server running on http://{}", listener.local_addr()?);
        info!("Health check: http://{}/health", listener.local_addr()?);
        info!(
            "Converting up to {} files at a time, outputs kept for {}s",
            config.max_concurrent_conversions,
            config.retention.as_secs()
        );

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        if let Some(sweeper) = sweeper {
            sweeper.abort();
        }
        info!("Server shutdown complete");
        Ok(())
    }
}
