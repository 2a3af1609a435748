//! Hand-off of saved frames to the pipeline daemon.

use scicam_core::{BusKind, Config};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HandoverError {
    #[error("pipeline daemon call failed: {0}")]
    Dbus(#[from] zbus::Error),
    #[error("pipeline rejected frame: {0}")]
    Rejected(String),
}

/// Receives the name of every frame written to the output directory.
pub trait FrameHandover: Send + Sync {
    fn notify_frame(&self, camera_id: &str, filename: &str) -> Result<(), HandoverError>;
}

#[zbus::proxy(
    interface = "org.rockit.Pipeline1",
    default_path = "/org/rockit/Pipeline",
    gen_async = false,
    blocking_name = "PipelineProxyBlocking"
)]
trait Pipeline {
    fn notify_frame(&self, camera_id: &str, filename: &str) -> zbus::Result<()>;
}

/// Calls `NotifyFrame` on the pipeline daemon, opening a fresh bus
/// connection per frame so a restarted pipeline is picked up.
pub struct DbusPipeline {
    bus: BusKind,
    destination: String,
    timeout: Option<Duration>,
}

impl DbusPipeline {
    pub fn from_config(config: &Config) -> Self {
        // A zero timeout waits for the pipeline indefinitely.
        let timeout = (config.pipeline_handover_timeout > 0.0)
            .then(|| Duration::from_secs_f64(config.pipeline_handover_timeout));
        Self {
            bus: config.bus,
            destination: config.pipeline_daemon.clone(),
            timeout,
        }
    }

    fn connect(&self) -> zbus::Result<zbus::blocking::Connection> {
        let builder = match self.bus {
            BusKind::System => zbus::blocking::connection::Builder::system()?,
            BusKind::Session => zbus::blocking::connection::Builder::session()?,
        };
        let builder = match self.timeout {
            Some(timeout) => builder.method_timeout(timeout),
            None => builder,
        };
        builder.build()
    }
}

impl FrameHandover for DbusPipeline {
    fn notify_frame(&self, camera_id: &str, filename: &str) -> Result<(), HandoverError> {
        let connection = self.connect()?;
        let proxy = PipelineProxyBlocking::builder(&connection)
            .destination(self.destination.as_str())?
            .build()?;

        proxy.notify_frame(camera_id, filename).map_err(|e| match e {
            zbus::Error::MethodError(name, message, _) => HandoverError::Rejected(format!(
                "{}: {}",
                name,
                message.unwrap_or_default()
            )),
            other => HandoverError::Dbus(other),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(timeout: f64) -> Config {
        let json = format!(
            r#"{{
                "daemon": "org.rockit.camera.cam1",
                "pipeline_daemon": "org.rockit.pipeline",
                "pipeline_handover_timeout": {timeout},
                "log_name": "scicam_camd@cam1",
                "camera_config_path": "/etc/camd/ninox.fmt",
                "camera_id": "CAM1",
                "cooler_setpoint": -40,
                "cooler_update_delay": 1,
                "worker_processes": 2,
                "framebuffer_bytes": 16384000,
                "header_card_capacity": 144,
                "output_path": "/var/tmp",
                "output_prefix": "cam1",
                "expcount_path": "/var/tmp/cam1-counter.json",
                "bus": "session"
            }}"#
        );
        Config::from_json(&json).unwrap()
    }

    #[test]
    fn test_timeout_from_config() {
        let pipeline = DbusPipeline::from_config(&config(2.5));
        assert_eq!(pipeline.timeout, Some(Duration::from_millis(2500)));
        assert_eq!(pipeline.destination, "org.rockit.pipeline");
        assert_eq!(pipeline.bus, BusKind::Session);
    }

    #[test]
    fn test_zero_timeout_waits_forever() {
        assert_eq!(DbusPipeline::from_config(&config(0.0)).timeout, None);
    }
}
