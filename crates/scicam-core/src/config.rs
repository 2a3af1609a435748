//! JSON daemon configuration.
//!
//! One file per camera, normally `/etc/camd/<name>.json`. The daemon and
//! the client both load it: the daemon for everything, the client only to
//! find the daemon on the bus.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use zbus::names::WellKnownName;

/// Default directory searched for camera configs.
pub const DEFAULT_CONFIG_ROOT: &str = "/etc/camd";

/// Smallest framebuffer that can hold one full-resolution frame.
pub const MIN_FRAMEBUFFER_BYTES: usize = 1280 * 800 * 2;

pub const MIN_COOLER_SETPOINT: f64 = -50.0;
pub const MAX_COOLER_SETPOINT: f64 = 30.0;

/// Upper bound for the timeout and poll interval fields, in seconds.
pub const MAX_DELAY_SECS: f64 = 86_400.0;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Message bus the daemon registers on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    #[default]
    System,
    Session,
}

/// Daemon configuration parsed from a json file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Well-known bus name claimed by the daemon.
    pub daemon: String,
    /// Well-known bus name of the pipeline daemon that receives frames.
    pub pipeline_daemon: String,
    /// Seconds to wait for the pipeline to accept a frame (0 waits forever).
    pub pipeline_handover_timeout: f64,
    /// Tag attached to every log event.
    pub log_name: String,
    /// EPIX video format (`.fmt`) file passed to the frame grabber.
    pub camera_config_path: PathBuf,
    pub camera_id: String,
    /// Sensor temperature set point applied at initialization (deg C).
    pub cooler_setpoint: f64,
    /// Seconds between cooler status polls.
    pub cooler_update_delay: f64,
    /// Number of output worker threads.
    pub worker_processes: usize,
    /// Total size of the framebuffer pool shared with the output workers.
    pub framebuffer_bytes: usize,
    /// Minimum number of header cards reserved in each FITS file.
    pub header_card_capacity: usize,
    pub output_path: PathBuf,
    pub output_prefix: String,
    /// JSON file holding the persistent exposure counter.
    pub expcount_path: PathBuf,
    #[serde(default)]
    pub bus: BusKind,
    /// Drive the in-process simulated camera instead of the frame grabber.
    #[serde(default)]
    pub simulated: bool,
}

impl Config {
    /// Load and validate a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_json(&text).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })?;
        tracing::debug!(path = %path.display(), daemon = %config.daemon, "loaded config");
        Ok(config)
    }

    /// Parse and validate config json.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(text).map_err(|source| ConfigError::Parse {
            path: PathBuf::new(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        validate_bus_name("daemon", &self.daemon)?;
        validate_bus_name("pipeline_daemon", &self.pipeline_daemon)?;
        validate_delay("pipeline_handover_timeout", self.pipeline_handover_timeout)?;
        validate_delay("cooler_update_delay", self.cooler_update_delay)?;
        validate_min("cooler_setpoint", self.cooler_setpoint, MIN_COOLER_SETPOINT)?;
        if self.cooler_setpoint > MAX_COOLER_SETPOINT {
            return Err(invalid(
                "cooler_setpoint",
                format!("{} is greater than {MAX_COOLER_SETPOINT}", self.cooler_setpoint),
            ));
        }
        if self.worker_processes < 1 {
            return Err(invalid("worker_processes", "must be at least 1".into()));
        }
        if self.framebuffer_bytes < MIN_FRAMEBUFFER_BYTES {
            return Err(invalid(
                "framebuffer_bytes",
                format!("must be at least {MIN_FRAMEBUFFER_BYTES}"),
            ));
        }
        for (field, value) in [
            ("log_name", &self.log_name),
            ("camera_id", &self.camera_id),
            ("output_prefix", &self.output_prefix),
        ] {
            if value.trim().is_empty() {
                return Err(invalid(field, "must not be empty".into()));
            }
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: String) -> ConfigError {
    ConfigError::Invalid { field, reason }
}

fn validate_min(field: &'static str, value: f64, min: f64) -> Result<(), ConfigError> {
    if !value.is_finite() || value < min {
        return Err(invalid(field, format!("{value} is less than {min}")));
    }
    Ok(())
}

/// Durations are later built with `Duration::from_secs_f64`, which panics
/// when out of range.
fn validate_delay(field: &'static str, value: f64) -> Result<(), ConfigError> {
    validate_min(field, value, 0.0)?;
    if value > MAX_DELAY_SECS {
        return Err(invalid(field, format!("{value} is greater than {MAX_DELAY_SECS}")));
    }
    Ok(())
}

fn validate_bus_name(field: &'static str, name: &str) -> Result<(), ConfigError> {
    WellKnownName::try_from(name)
        .map(|_| ())
        .map_err(|e| invalid(field, format!("`{name}` is not a valid bus name ({e})")))
}

/// Directory searched for named configs: `$CAMD_CONFIG_ROOT` or `/etc/camd`.
pub fn config_root() -> PathBuf {
    std::env::var_os("CAMD_CONFIG_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_ROOT))
}

/// Resolve a config argument to a file path.
///
/// Explicit paths (containing a separator or ending in `.json`) are used
/// as given; bare names such as the systemd instance `cam1` map to
/// `<config_root>/cam1.json`.
pub fn resolve(name: &str) -> PathBuf {
    resolve_in(&config_root(), name)
}

pub fn resolve_in(root: &Path, name: &str) -> PathBuf {
    if name.contains(std::path::MAIN_SEPARATOR) || name.ends_with(".json") {
        PathBuf::from(name)
    } else {
        root.join(format!("{name}.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> serde_json::Value {
        serde_json::json!({
            "daemon": "org.rockit.camera.cam1",
            "pipeline_daemon": "org.rockit.pipeline",
            "pipeline_handover_timeout": 10,
            "log_name": "scicam_camd@cam1",
            "camera_config_path": "/etc/camd/cam1.fmt",
            "camera_id": "CAM1",
            "cooler_setpoint": -40,
            "cooler_update_delay": 1,
            "worker_processes": 2,
            "framebuffer_bytes": 1280 * 800 * 2 * 8,
            "header_card_capacity": 144,
            "output_path": "/var/tmp",
            "output_prefix": "cam1",
            "expcount_path": "/var/tmp/cam1-counter.json"
        })
    }

    #[test]
    fn test_parse_valid() {
        let config = Config::from_json(&sample_json().to_string()).unwrap();
        assert_eq!(config.daemon, "org.rockit.camera.cam1");
        assert_eq!(config.worker_processes, 2);
        assert_eq!(config.cooler_setpoint, -40.0);
        assert_eq!(config.bus, BusKind::System);
        assert!(!config.simulated);
    }

    #[test]
    fn test_optional_fields() {
        let mut json = sample_json();
        json["bus"] = "session".into();
        json["simulated"] = true.into();
        let config = Config::from_json(&json.to_string()).unwrap();
        assert_eq!(config.bus, BusKind::Session);
        assert!(config.simulated);
    }

    #[test]
    fn test_rejects_unknown_field() {
        let mut json = sample_json();
        json["control_machines"] = serde_json::json!(["GOTOServer"]);
        assert!(matches!(
            Config::from_json(&json.to_string()),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_rejects_missing_field() {
        let mut json = sample_json();
        json.as_object_mut().unwrap().remove("expcount_path");
        assert!(Config::from_json(&json.to_string()).is_err());
    }

    #[test]
    fn test_setpoint_limits() {
        let mut json = sample_json();
        json["cooler_setpoint"] = (-51).into();
        assert!(matches!(
            Config::from_json(&json.to_string()),
            Err(ConfigError::Invalid { field: "cooler_setpoint", .. })
        ));

        json["cooler_setpoint"] = 31.into();
        assert!(Config::from_json(&json.to_string()).is_err());

        json["cooler_setpoint"] = 30.into();
        assert!(Config::from_json(&json.to_string()).is_ok());
    }

    #[test]
    fn test_framebuffer_minimum() {
        let mut json = sample_json();
        json["framebuffer_bytes"] = (MIN_FRAMEBUFFER_BYTES - 1).into();
        assert!(matches!(
            Config::from_json(&json.to_string()),
            Err(ConfigError::Invalid { field: "framebuffer_bytes", .. })
        ));
    }

    #[test]
    fn test_worker_count_is_integer() {
        let mut json = sample_json();
        json["worker_processes"] = 0.into();
        assert!(Config::from_json(&json.to_string()).is_err());

        json["worker_processes"] = 1.5.into();
        assert!(Config::from_json(&json.to_string()).is_err());
    }

    #[test]
    fn test_rejects_invalid_bus_name() {
        let mut json = sample_json();
        json["pipeline_daemon"] = "not a bus name".into();
        assert!(matches!(
            Config::from_json(&json.to_string()),
            Err(ConfigError::Invalid { field: "pipeline_daemon", .. })
        ));
    }

    #[test]
    fn test_negative_timeout_rejected() {
        let mut json = sample_json();
        json["pipeline_handover_timeout"] = (-1).into();
        assert!(Config::from_json(&json.to_string()).is_err());
    }

    #[test]
    fn test_huge_delays_rejected() {
        let mut json = sample_json();
        json["pipeline_handover_timeout"] = 1e20.into();
        assert!(matches!(
            Config::from_json(&json.to_string()),
            Err(ConfigError::Invalid { field: "pipeline_handover_timeout", .. })
        ));

        let mut json = sample_json();
        json["cooler_update_delay"] = 1e20.into();
        assert!(matches!(
            Config::from_json(&json.to_string()),
            Err(ConfigError::Invalid { field: "cooler_update_delay", .. })
        ));

        let mut json = sample_json();
        json["pipeline_handover_timeout"] = MAX_DELAY_SECS.into();
        json["cooler_update_delay"] = 0.into();
        let config = Config::from_json(&json.to_string()).unwrap();
        // Every accepted value converts without panicking
        let _ = std::time::Duration::from_secs_f64(config.pipeline_handover_timeout);
        let _ = std::time::Duration::from_secs_f64(config.cooler_update_delay);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cam1.json");
        std::fs::write(&path, sample_json().to_string()).unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.camera_id, "CAM1");

        let missing = Config::load(dir.path().join("missing.json"));
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_resolve_names() {
        let root = Path::new("/etc/camd");
        assert_eq!(resolve_in(root, "cam1"), PathBuf::from("/etc/camd/cam1.json"));
        assert_eq!(resolve_in(root, "local.json"), PathBuf::from("local.json"));
        assert_eq!(
            resolve_in(root, "/tmp/cam2.json"),
            PathBuf::from("/tmp/cam2.json")
        );
    }
}
