use anyhow::{Context, Result};
use clap::Parser;
use scicam_core::{BusKind, Config, CAMERA_OBJECT_PATH};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod acquisition;
mod camera;
mod config;
mod dbus_interface;
mod engine;
mod framebuffer;
mod output;
mod pipeline;

use dbus_interface::CameraService;
use output::{OutputPool, OutputSettings};
use pipeline::{DbusPipeline, FrameHandover};

#[derive(Parser)]
#[command(name = "scicam_camd", version, about = "Daemon for a SciCam camera")]
struct Args {
    /// Camera config name under $CAMD_CONFIG_ROOT, or a path to a json file
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let settings = config::Settings::from_env();
    let config_path = scicam_core::config::resolve(&args.config);
    let config = Arc::new(
        Config::load(&config_path)
            .with_context(|| format!("loading {}", config_path.display()))?,
    );
    tracing::info!(
        camera = %config.log_name,
        config = %config_path.display(),
        daemon = %config.daemon,
        "scicam_camd starting"
    );

    let handover: Arc<dyn FrameHandover> = Arc::new(DbusPipeline::from_config(&config));
    let output = OutputPool::spawn(OutputSettings::from_config(&config), handover)?;

    let backend = settings.backend(&config);
    let (engine, engine_thread) =
        engine::spawn_engine(Arc::clone(&config), backend, output.queue())?;

    let service = CameraService::new(engine.clone(), config.log_name.clone());
    let builder = match config.bus {
        BusKind::System => zbus::connection::Builder::system()?,
        BusKind::Session => zbus::connection::Builder::session()?,
    };
    let connection = builder
        .name(config.daemon.as_str())?
        .serve_at(CAMERA_OBJECT_PATH, service)?
        .build()
        .await
        .with_context(|| format!("registering {} on the bus", config.daemon))?;

    tracing::info!(camera = %config.log_name, "scicam_camd ready");

    wait_for_signal().await?;
    tracing::info!(camera = %config.log_name, "scicam_camd shutting down");

    drop(connection);
    engine.exit().await?;
    tokio::task::spawn_blocking(move || {
        if engine_thread.join().is_err() {
            tracing::error!("engine thread panicked");
        }
        output.join();
    })
    .await?;

    Ok(())
}

/// Resolve on ctrl-c or SIGTERM (systemd stop).
async fn wait_for_signal() -> Result<()> {
    let mut terminate =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = terminate.recv() => {}
    }
    Ok(())
}
