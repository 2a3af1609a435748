use scicam_core::Config;
use scicam_hw::{Backend, SimulatedOptions};
use std::time::Duration;

/// Daemon settings that come from the environment rather than the camera
/// config file.
pub struct Settings {
    /// Force the simulated camera regardless of the config file.
    pub force_simulated: bool,
    /// Path to the XCLIB shared library.
    pub xclib_path: String,
    /// Time constant of the simulated sensor cooling, in seconds.
    pub simulated_cooling_secs: f64,
}

impl Settings {
    /// Load settings from `SCICAMD_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self {
            force_simulated: std::env::var("SCICAMD_SIMULATE")
                .map(|v| v != "0")
                .unwrap_or(false),
            xclib_path: std::env::var("SCICAMD_XCLIB_PATH")
                .unwrap_or_else(|_| scicam_hw::xclib::DEFAULT_LIBRARY_PATH.to_string()),
            simulated_cooling_secs: env_f64("SCICAMD_SIM_COOLING_SECS", 20.0),
        }
    }

    /// Grabber backend for `config`.
    pub fn backend(&self, config: &Config) -> Backend {
        if self.force_simulated || config.simulated {
            let mut options = SimulatedOptions::default();
            options.cooling_time_constant =
                Duration::from_secs_f64(self.simulated_cooling_secs.max(0.0));
            Backend::Simulated(options)
        } else {
            Backend::Xclib {
                library: self.xclib_path.clone(),
            }
        }
    }
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
