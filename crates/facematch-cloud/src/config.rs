use facematch_core::embedder::{EmbedderSettings, DEFAULT_INPUT_SIZE};
use facematch_core::{EuclideanMatcher, MatchError};
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
    #[error("invalid max_distance: {0}")]
    MaxDistance(#[source] MatchError),
}

/// Cloud daemon configuration.
///
/// Defaults, then the TOML file named by `FACEMATCH_CONFIG`, then
/// `FACEMATCH_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Queue of face crops from the edge stage.
    pub request_queue_dir: PathBuf,
    /// Queue of final answers.
    pub response_queue_dir: PathBuf,
    /// Enrolled gallery file.
    pub gallery_path: PathBuf,
    /// Embedding ONNX model.
    pub embedder_model: PathBuf,
    /// Version tag of the embedding model; checked against the gallery's.
    pub model_version: Option<String>,
    /// Side length of the embedder input.
    pub input_size: u32,
    /// Expected embedding length, if known.
    pub dimension: Option<usize>,
    /// Nearest distances above this are answered `Unknown`. Unset means
    /// the nearest label is always returned.
    pub max_distance: Option<f32>,
    pub poll_interval_ms: u64,
    /// Maximum messages taken from the request queue per poll.
    pub batch_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            request_queue_dir: data_dir.join("requests"),
            response_queue_dir: data_dir.join("responses"),
            gallery_path: data_dir.join("gallery.json"),
            embedder_model: data_dir.join("models/embedder.onnx"),
            model_version: None,
            input_size: DEFAULT_INPUT_SIZE,
            dimension: None,
            max_distance: None,
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
        config.validate()?;
        Ok(config)
    }

    /// Reject values that parse but cannot be used.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.matcher().map(|_| ()).map_err(ConfigError::MaxDistance)
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
    ///
    /// `FACEMATCH_MAX_DISTANCE=none` (or empty) switches back to nearest-label mode.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("FACEMATCH_REQUEST_QUEUE_DIR") {
            self.request_queue_dir = v.into();
        }
        if let Some(v) = lookup("FACEMATCH_RESPONSE_QUEUE_DIR") {
            self.response_queue_dir = v.into();
        }
        if let Some(v) = lookup("FACEMATCH_GALLERY_PATH") {
            self.gallery_path = v.into();
        }
        if let Some(v) = lookup("FACEMATCH_EMBEDDER_MODEL") {
            self.embedder_model = v.into();
        }
        if let Some(v) = lookup("FACEMATCH_MODEL_VERSION") {
            self.model_version = Some(v).filter(|v| !v.is_empty());
        }
        if let Some(v) = lookup("FACEMATCH_MAX_DISTANCE") {
            let v = v.trim();
            if v.is_empty() || v.eq_ignore_ascii_case("none") {
                self.max_distance = None;
            } else if let Ok(d) = v.parse() {
                self.max_distance = Some(d);
            }
        }
        if let Some(d) = lookup("FACEMATCH_DIMENSION").and_then(|v| v.parse().ok()) {
            self.dimension = Some(d);
        }
        parse_into(&lookup, "FACEMATCH_INPUT_SIZE", &mut self.input_size);
        parse_into(&lookup, "FACEMATCH_POLL_INTERVAL_MS", &mut self.poll_interval_ms);
        parse_into(&lookup, "FACEMATCH_BATCH_SIZE", &mut self.batch_size);
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn matcher(&self) -> Result<EuclideanMatcher, MatchError> {
        EuclideanMatcher::from_max_distance(self.max_distance)
    }

    pub fn embedder_settings(&self) -> EmbedderSettings {
        EmbedderSettings {
            input_size: self.input_size,
            dimension: self.dimension,
            model_version: self.model_version.clone(),
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
