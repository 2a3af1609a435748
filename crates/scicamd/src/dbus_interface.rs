use crate::engine::{EngineError, EngineHandle};
use scicam_core::CommandStatus;
use tokio::sync::Mutex;
use zbus::interface;

/// D-Bus interface for the camera daemon.
///
/// Bus name: from the `daemon` config key
/// Object path: /org/rockit/Camera
pub struct CameraService {
    engine: EngineHandle,
    log_name: String,
    /// Held while a control command runs; a second one is rejected as Blocked.
    command_lock: Mutex<()>,
}

impl CameraService {
    pub fn new(engine: EngineHandle, log_name: String) -> Self {
        Self {
            engine,
            log_name,
            command_lock: Mutex::new(()),
        }
    }

    fn engine_error(&self, e: EngineError) -> zbus::fdo::Error {
        tracing::error!(camera = %self.log_name, error = %e, "engine unavailable");
        zbus::fdo::Error::Failed(e.to_string())
    }

    async fn exclusive<F>(&self, command: F) -> zbus::fdo::Result<i32>
    where
        F: std::future::Future<Output = Result<CommandStatus, EngineError>>,
    {
        let Ok(_guard) = self.command_lock.try_lock() else {
            return Ok(CommandStatus::Blocked.code());
        };
        match command.await {
            Ok(status) => Ok(status.code()),
            Err(e) => Err(self.engine_error(e)),
        }
    }
}

#[interface(name = "org.rockit.Camera1")]
impl CameraService {
    /// Connect to and configure the camera.
    async fn initialize(&self) -> zbus::fdo::Result<i32> {
        self.exclusive(self.engine.initialize()).await
    }

    /// Disconnect from the camera.
    async fn shutdown(&self) -> zbus::fdo::Result<i32> {
        self.exclusive(self.engine.shutdown()).await
    }

    /// Set the sensor temperature, or switch the cooler off when `warm` is true.
    async fn set_temperature(&self, warm: bool, temperature: f64, quiet: bool) -> zbus::fdo::Result<i32> {
        let temperature = (!warm).then_some(temperature);
        self.exclusive(self.engine.set_temperature(temperature, quiet))
            .await
    }

    /// Set the exposure time in seconds.
    async fn set_exposure(&self, exposure: f64, quiet: bool) -> zbus::fdo::Result<i32> {
        self.exclusive(self.engine.set_exposure(exposure, quiet)).await
    }

    /// Start a sequence of `count` frames, 0 to run until stopped.
    async fn start_sequence(&self, count: u32, quiet: bool) -> zbus::fdo::Result<i32> {
        self.exclusive(self.engine.start_sequence(count, quiet)).await
    }

    async fn stop_sequence(&self, quiet: bool) -> zbus::fdo::Result<i32> {
        self.exclusive(self.engine.stop_sequence(quiet)).await
    }

    /// Current state as a JSON object.
    async fn report_status(&self) -> zbus::fdo::Result<String> {
        self.engine
            .report_status()
            .to_json()
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }
}
