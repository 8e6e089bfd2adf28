//! # Whisper Queue API - Main Application Entry Point
//!
//! An HTTP transcription service: clients upload audio, get a job id back, and
//! collect the transcript once a worker has run it through Whisper.
//!
//! ## Application Architecture:
//! - **config**: layered configuration (defaults, config.toml, environment)
//! - **pipeline**: job queue, worker pool, result and artifact stores, sweeper
//! - **transcription**: speech engine traits, the Candle Whisper backend, model registry
//! - **audio**: decoding of WAV, MP3, M4A, FLAC and Ogg uploads to 16 kHz mono
//! - **device**: compute device parsing and detection
//! - **state / health / middleware / handlers / error**: the HTTP surface
//!
//! ## Lifecycle:
//! 1. Load `.env`, set up tracing, load and validate configuration
//! 2. Start the pipeline (workers and sweeper run on this runtime)
//! 3. Serve HTTP until SIGINT/SIGTERM
//! 4. Stop the HTTP server, then drain and stop the pipeline

mod audio;
mod config;
mod device;
mod error;
mod handlers;
mod health;
mod middleware;
mod pipeline;
mod state;
mod transcription;

use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use pipeline::{Pipeline, PipelineSettings};
use state::AppState;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transcription::whisper::{HubSettings, WhisperEngine};
use transcription::SpeechEngine;

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting {} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    info!(
        host = %config.server.host,
        port = config.server.port,
        model = %config.models.whisper_model,
        devices = ?config.models.devices,
        workers = config.pipeline.workers,
        "Configuration loaded"
    );

    let devices = config.devices()?;
    let engine: Arc<dyn SpeechEngine> = Arc::new(WhisperEngine::new(
        config.model_size()?,
        HubSettings::from_env(),
    ));
    let pipeline = Arc::new(
        Pipeline::start(PipelineSettings::from_config(&config), engine, &devices).await?,
    );

    let app_state = AppState::new(config.clone(), pipeline.clone());
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    let shutdown = CancellationToken::new();
    spawn_signal_listener(shutdown.clone());

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        // Middleware runs in reverse registration order for responses.
        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(Logger::default())
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .configure(handlers::configure)
    })
    .disable_signals()
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = shutdown.cancelled() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    pipeline
        .shutdown(Duration::from_secs(config.pipeline.shutdown_grace_secs))
        .await;

    info!("Server stopped gracefully");
    Ok(())
}

/// Structured logging to the console. `RUST_LOG` overrides the default filter.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "whisper_queue_api=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;
    Ok(())
}

/// Cancel `shutdown` on the first SIGINT or SIGTERM.
fn spawn_signal_listener(shutdown: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        shutdown.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM"),
                _ = ctrl_c() => info!("Received SIGINT"),
            }
        }
        Err(e) => {
            warn!("Failed to install SIGTERM handler: {}", e);
            ctrl_c().await;
            info!("Received SIGINT");
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    ctrl_c().await;
    info!("Received Ctrl+C");
}

/// Resolves on Ctrl+C. Never resolves if the handler cannot be installed.
async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to install Ctrl+C handler: {}", e);
        std::future::pending::<()>().await;
    }
}
