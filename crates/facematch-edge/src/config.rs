use facematch_core::detector::{CropSettings, DEFAULT_CROP_SIZE, DEFAULT_MIN_FACE_SIZE};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("reading config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Edge daemon configuration.
///
/// Defaults, then the TOML file named by `FACEMATCH_CONFIG`, then
/// `FACEMATCH_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Spool directory the image topic is delivered into.
    pub inbox_dir: PathBuf,
    /// Queue of cropped faces for the cloud stage.
    pub request_queue_dir: PathBuf,
    /// Queue of final answers.
    pub response_queue_dir: PathBuf,
    /// SCRFD ONNX model.
    pub detector_model: PathBuf,
    /// Minimum face side length in pixels.
    pub min_face_size: f32,
    /// Side length of the forwarded face crop.
    pub crop_size: u32,
    pub poll_interval_ms: u64,
    /// Maximum messages taken from the inbox per poll.
    pub batch_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            inbox_dir: data_dir.join("inbox"),
            request_queue_dir: data_dir.join("requests"),
            response_queue_dir: data_dir.join("responses"),
            detector_model: data_dir.join("models/det_10g.onnx"),
            min_face_size: DEFAULT_MIN_FACE_SIZE,
            crop_size: DEFAULT_CROP_SIZE,
            poll_interval_ms: 200,
            batch_size: 8,
        }
    }
}

impl Config {
    /// Load configuration from the optional file and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var_os("FACEMATCH_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `FACEMATCH_*` overrides; unparsable values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("FACEMATCH_INBOX_DIR") {
            self.inbox_dir = v.into();
        }
        if let Some(v) = lookup("FACEMATCH_REQUEST_QUEUE_DIR") {
            self.request_queue_dir = v.into();
        }
        if let Some(v) = lookup("FACEMATCH_RESPONSE_QUEUE_DIR") {
            self.response_queue_dir = v.into();
        }
        if let Some(v) = lookup("FACEMATCH_DETECTOR_MODEL") {
            self.detector_model = v.into();
        }
        parse_into(&lookup, "FACEMATCH_MIN_FACE_SIZE", &mut self.min_face_size);
        parse_into(&lookup, "FACEMATCH_CROP_SIZE", &mut self.crop_size);
        parse_into(&lookup, "FACEMATCH_POLL_INTERVAL_MS", &mut self.poll_interval_ms);
        parse_into(&lookup, "FACEMATCH_BATCH_SIZE", &mut self.batch_size);
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn crop_settings(&self) -> CropSettings {
        CropSettings {
            min_face_size: self.min_face_size,
            crop_size: self.crop_size,
        }
    }
}

fn parse_into<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) {
    if let Some(v) = lookup(key).and_then(|v| v.parse().ok()) {
        *slot = v;
    }
}

fn default_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("FACEMATCH_DATA_DIR") {
        return PathBuf::from(dir);
    }
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facematch")
}
