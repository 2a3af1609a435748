use crate::camera::{Camera, CameraShared};
use crate::output::OutputQueue;
use scicam_core::{CommandStatus, Config, StatusReport};
use scicam_hw::Backend;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::oneshot;

/// How long the engine waits for a request before checking the cooler.
const REQUEST_POLL: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("failed to spawn engine thread: {0}")]
    Spawn(std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Initialize {
        reply: oneshot::Sender<CommandStatus>,
    },
    Shutdown {
        reply: oneshot::Sender<CommandStatus>,
    },
    SetTemperature {
        temperature: Option<f64>,
        quiet: bool,
        reply: oneshot::Sender<CommandStatus>,
    },
    SetExposure {
        exposure: f64,
        quiet: bool,
        reply: oneshot::Sender<CommandStatus>,
    },
    StartSequence {
        count: u32,
        quiet: bool,
        reply: oneshot::Sender<CommandStatus>,
    },
    StopSequence {
        quiet: bool,
        reply: oneshot::Sender<CommandStatus>,
    },
    /// Shut the camera down and end the engine thread.
    Exit { reply: oneshot::Sender<()> },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    shared: Arc<CameraShared>,
}

impl EngineHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    pub async fn initialize(&self) -> Result<CommandStatus, EngineError> {
        self.request(|reply| EngineRequest::Initialize { reply }).await
    }

    pub async fn shutdown(&self) -> Result<CommandStatus, EngineError> {
        self.request(|reply| EngineRequest::Shutdown { reply }).await
    }

    /// `None` switches the cooler off and lets the sensor warm up.
    pub async fn set_temperature(
        &self,
        temperature: Option<f64>,
        quiet: bool,
    ) -> Result<CommandStatus, EngineError> {
        self.request(|reply| EngineRequest::SetTemperature {
            temperature,
            quiet,
            reply,
        })
        .await
    }

    pub async fn set_exposure(&self, exposure: f64, quiet: bool) -> Result<CommandStatus, EngineError> {
        self.request(|reply| EngineRequest::SetExposure {
            exposure,
            quiet,
            reply,
        })
        .await
    }

    pub async fn start_sequence(&self, count: u32, quiet: bool) -> Result<CommandStatus, EngineError> {
        self.request(|reply| EngineRequest::StartSequence {
            count,
            quiet,
            reply,
        })
        .await
    }

    pub async fn stop_sequence(&self, quiet: bool) -> Result<CommandStatus, EngineError> {
        self.request(|reply| EngineRequest::StopSequence { quiet, reply })
            .await
    }

    /// Read from the shared camera state without queueing behind a running
    /// command.
    pub fn report_status(&self) -> StatusReport {
        self.shared.report_status()
    }

    /// Ask the engine thread to release the camera and exit.
    pub async fn exit(&self) -> Result<(), EngineError> {
        self.request(|reply| EngineRequest::Exit { reply }).await
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The camera is not opened until an `Initialize` request arrives. Between
/// requests the thread polls the cooler every `cooler_update_delay` seconds.
pub fn spawn_engine(
    config: Arc<Config>,
    backend: Backend,
    output: OutputQueue,
) -> Result<(EngineHandle, JoinHandle<()>), EngineError> {
    let (tx, rx) = mpsc::channel::<EngineRequest>();
    let cooler_update_delay = Duration::from_secs_f64(config.cooler_update_delay);
    let log_name = config.log_name.clone();
    let mut camera = Camera::new(config, backend, output);
    let shared = camera.shared();

    let thread = std::thread::Builder::new()
        .name("scicam-engine".into())
        .spawn(move || {
            tracing::info!(camera = %log_name, "engine thread started");
            let mut last_cooler_update = Instant::now();

            loop {
                let mut temperature_changed = false;
                match rx.recv_timeout(REQUEST_POLL) {
                    Ok(EngineRequest::Exit { reply }) => {
                        if camera.is_initialized() {
                            camera.shutdown();
                        }
                        let _ = reply.send(());
                        break;
                    }
                    Ok(request) => {
                        temperature_changed = matches!(request, EngineRequest::SetTemperature { .. });
                        handle_request(&mut camera, request);
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }

                if camera.is_initialized()
                    && (temperature_changed || last_cooler_update.elapsed() >= cooler_update_delay)
                {
                    camera.update_cooler();
                    last_cooler_update = Instant::now();
                }
            }
            tracing::info!(camera = %log_name, "engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok((EngineHandle { tx, shared }, thread))
}

fn handle_request(camera: &mut Camera, request: EngineRequest) {
    // Replies fail only when the caller has gone away.
    match request {
        EngineRequest::Initialize { reply } => {
            let _ = reply.send(camera.initialize());
        }
        EngineRequest::Shutdown { reply } => {
            let _ = reply.send(camera.shutdown());
        }
        EngineRequest::SetTemperature {
            temperature,
            quiet,
            reply,
        } => {
            let _ = reply.send(camera.set_target_temperature(temperature, quiet));
        }
        EngineRequest::SetExposure {
            exposure,
            quiet,
            reply,
        } => {
            let _ = reply.send(camera.set_exposure(exposure, quiet));
        }
        EngineRequest::StartSequence {
            count,
            quiet,
            reply,
        } => {
            let _ = reply.send(camera.start_sequence(count, quiet));
        }
        EngineRequest::StopSequence { quiet, reply } => {
            let _ = reply.send(camera.stop_sequence(quiet));
        }
        EngineRequest::Exit { reply } => {
            let _ = reply.send(());
        }
    }
}
