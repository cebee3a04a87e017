// src/main.rs

mod config;
mod event_source;
mod frame_acquirer;
mod geolocator;
mod link;
mod pipeline;
mod recorder;
mod surface;
mod types;

use anyhow::{bail, Context, Result};
use event_source::EventSource;
use geolocator::GeoLocator;
use pipeline::{PipelineOrchestrator, PipelineSettings, RunOutcome, SessionSummary, ShutdownSignal};
use recorder::EventRecorder;
use std::path::Path;
use std::time::Instant;
use surface::SurfaceClassifier;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use types::Config;

const DEFAULT_CONFIG: &str = "config.yaml";
const CONFIG_ENV: &str = "POTHOLE_CONFIG";

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("pothole_detection={}", level)));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let started_at = Instant::now();
    let config_path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG.to_string());
    let config = Config::load_or_default(&config_path)?;
    init_tracing(&config.logging.level);

    info!("🕳️  Pothole Detection System Starting");
    if Path::new(&config_path).exists() {
        info!("✓ Configuration loaded from {}", config_path);
    } else {
        warn!("Config file {} not found, running on defaults", config_path);
    }

    let classifier = SurfaceClassifier::new(config.classifier.clone());
    let tuning = classifier.config();
    info!(
        "✓ Surface classifier ready (contrast {:?}, fusion {:?}, scoring {:?}, pothole ≥ {:.2}, uncertain ≥ {:.2})",
        tuning.contrast_channel,
        tuning.fusion,
        tuning.scoring,
        tuning.pothole_threshold,
        tuning.uncertain_threshold
    );

    let recorder = EventRecorder::new(&config.recorder)?;
    let mut camera = frame_acquirer::from_config(&config.camera)?;
    let mut locator = GeoLocator::from_config(&config.gps);

    let source = match EventSource::open(&config.link) {
        Ok(source) => source,
        Err(e) => {
            error!("{}", e);
            event_source::log_candidate_ports();
            camera.release();
            locator.release();
            println!("\n{}", SessionSummary::empty(started_at));
            return Err(e).context("cannot start without the vibration sensor");
        }
    };

    let shutdown = ShutdownSignal::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("🛑 Interrupt received, shutting down");
                signal.trigger();
            }
            Err(e) => warn!("Cannot listen for interrupt: {}", e),
        }
    });

    let orchestrator = PipelineOrchestrator::new(
        source,
        locator,
        camera,
        classifier,
        recorder,
        PipelineSettings::from_config(&config),
    );
    let report = tokio::task::spawn_blocking(move || orchestrator.run(&shutdown))
        .await
        .context("pipeline task failed")?;

    println!("\n{}", report.summary);

    match report.outcome {
        RunOutcome::Cancelled => {
            info!("✓ Shutdown complete");
            Ok(())
        }
        RunOutcome::LinkLost(reason) => bail!("sensor link lost: {}", reason),
    }
}
