use anyhow::{Context, Result};
use std::time::Duration;
use timeclock_core::{scheduler, LoopHandle};
use timeclock_hw::CameraSource;
use timeclock_models::OnnxExtractor;
use timeclock_store::Store;
use tracing_subscriber::EnvFilter;

mod config;
mod punch;

use config::Config;
use punch::PunchRecorder;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::load().context("failed to load configuration")?;
    tracing::info!(
        camera = %config.camera_device,
        db = %config.db_path.display(),
        models = %config.model_dir.display(),
        threshold = config.match_threshold,
        cooldown_ms = config.cooldown.as_millis() as u64,
        cadence_ms = config.cadence.as_millis() as u64,
        "timeclockd starting"
    );

    let store = Store::open(&config.db_path)
        .await
        .with_context(|| format!("failed to open database {}", config.db_path.display()))?;
    let registry = store.registry().await.context("failed to load employee registry")?;
    if registry.is_empty() {
        tracing::warn!("no employees enrolled; every face will be reported as not recognized");
    }
    tracing::info!(employees = registry.len(), "registry loaded");

    let source = CameraSource::spawn(&config.camera_device, config.warmup_frames)
        .with_context(|| format!("failed to open camera {}", config.camera_device))?;
    let extractor = OnnxExtractor::new(&config.model_dir);
    let recorder = PunchRecorder::new(store.clone(), config.min_punch_interval);

    let running = scheduler::spawn(source, extractor, registry, recorder, config.loop_config())
        .context("failed to start detection loop")?;
    let handle = running.handle();
    let refresher = tokio::spawn(refresh_registry(store, handle.clone(), config.registry_refresh));

    tracing::info!("timeclockd ready");

    let join = running.join();
    tokio::pin!(join);
    let outcome = tokio::select! {
        outcome = &mut join => outcome,
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for ctrl-c")?;
            tracing::info!("timeclockd shutting down");
            handle.stop();
            join.await
        }
    };
    refresher.abort();

    let stats = outcome.context("detection loop failed")?;
    tracing::info!(
        cycles = stats.cycles,
        recognitions = stats.fired,
        no_face = stats.no_face,
        errors = stats.transient_errors,
        "timeclockd stopped"
    );
    Ok(())
}

/// Periodically hand a fresh registry snapshot to the loop so enrollments
/// made with the CLI are picked up without a restart.
async fn refresh_registry(store: Store, handle: LoopHandle, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    let mut known = None;
    while !handle.is_stopped() {
        ticker.tick().await;
        match store.registry().await {
            Ok(registry) => {
                let count = registry.len();
                if known.is_some_and(|n| n != count) {
                    tracing::info!(employees = count, "registry changed");
                }
                known = Some(count);
                handle.update_registry(registry);
            }
            Err(e) => {
                tracing::warn!(error = %e, "registry refresh failed, keeping previous snapshot")
            }
        }
    }
}
