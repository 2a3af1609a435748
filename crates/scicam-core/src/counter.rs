//! Persistent running exposure counter.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CounterError {
    #[error("failed to write exposure counter {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to encode exposure counter: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Number of frames taken since `reference`, the date the counter was reset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExposureCounter {
    #[serde(rename = "exposure_count")]
    pub count: u64,
    #[serde(rename = "exposure_reference")]
    pub reference: String,
}

impl ExposureCounter {
    /// A fresh counter referenced to today's UTC date.
    pub fn reset() -> Self {
        Self {
            count: 0,
            reference: Utc::now().format("%Y-%m-%d").to_string(),
        }
    }

    /// Load the counter, starting a fresh one if the file is missing or unreadable.
    pub fn load(path: &Path) -> Self {
        let loaded = std::fs::read_to_string(path)
            .map_err(|e| e.to_string())
            .and_then(|text| serde_json::from_str::<Self>(&text).map_err(|e| e.to_string()));

        match loaded {
            Ok(counter) => counter,
            Err(error) => {
                tracing::warn!(path = %path.display(), %error, "resetting exposure counter");
                Self::reset()
            }
        }
    }

    /// Write the counter to disk, replacing the previous file atomically.
    pub fn save(&self, path: &Path) -> Result<(), CounterError> {
        let json = serde_json::to_string(self)?;
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        std::fs::write(&tmp, json)
            .and_then(|_| std::fs::rename(&tmp, path))
            .map_err(|source| CounterError::Write {
                path: path.to_path_buf(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_resets() {
        let dir = tempfile::tempdir().unwrap();
        let counter = ExposureCounter::load(&dir.path().join("missing.json"));
        assert_eq!(counter.count, 0);
        assert_eq!(counter.reference, Utc::now().format("%Y-%m-%d").to_string());
    }

    #[test]
    fn test_corrupt_file_resets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("counter.json");
        std::fs::write(&path, "{\"exposure_count\": ").unwrap();
        assert_eq!(ExposureCounter::load(&path).count, 0);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("counter.json");
        let counter = ExposureCounter {
            count: 1234,
            reference: "2024-05-01".into(),
        };
        counter.save(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"exposure_count\":1234"));
        assert!(text.contains("\"exposure_reference\":\"2024-05-01\""));
        assert_eq!(ExposureCounter::load(&path), counter);
        assert!(!dir.path().join("counter.json.tmp").exists());
    }

    #[test]
    fn test_save_to_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope").join("counter.json");
        assert!(matches!(
            ExposureCounter::reset().save(&path),
            Err(CounterError::Write { .. })
        ));
    }
}
