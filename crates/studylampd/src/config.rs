use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use studylamp_hw::CaptureConstraints;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Optional on-disk layer. Every key may be omitted.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    camera_device: Option<String>,
    model_dir: Option<PathBuf>,
    model_url: Option<String>,
    backend_url: Option<String>,
    api_token: Option<String>,
    chat_context: Option<String>,
    poll_interval_ms: Option<u64>,
    health_interval_secs: Option<u64>,
    health_timeout_ms: Option<u64>,
    warmup_frames: Option<usize>,
}

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// V4L2 device path. `None` picks the first capture device.
    pub camera_device: Option<String>,
    /// Directory holding the UltraFace ONNX model.
    pub model_dir: PathBuf,
    /// Where to fetch the model from when it is missing locally.
    pub model_url: Option<String>,
    /// Base URL of the assistant backend.
    pub backend_url: String,
    /// Bearer token for chat requests.
    pub api_token: Option<String>,
    /// `context` field sent with every chat message.
    pub chat_context: String,
    pub poll_interval_ms: u64,
    pub health_interval_secs: u64,
    pub health_timeout_ms: u64,
    /// Frames discarded after opening the camera (AGC/AE settle).
    pub warmup_frames: usize,
}

impl Config {
    /// Load the TOML file (if any) and apply `STUDYLAMP_*` overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let file = match config_path() {
            Some(path) if path.exists() => read_file(&path)?,
            _ => FileConfig::default(),
        };
        Ok(Self::resolve(file, |key| std::env::var(key).ok()))
    }

    fn resolve(file: FileConfig, env: impl Fn(&str) -> Option<String>) -> Self {
        let parsed = |key: &str| env(key).and_then(|v| v.trim().parse().ok());
        let text = |key: &str| env(key).filter(|v| !v.trim().is_empty());

        Self {
            camera_device: text("STUDYLAMP_CAMERA_DEVICE").or(file.camera_device),
            model_dir: text("STUDYLAMP_MODEL_DIR")
                .map(PathBuf::from)
                .or(file.model_dir)
                .unwrap_or_else(studylamp_core::default_model_dir),
            model_url: text("STUDYLAMP_MODEL_URL").or(file.model_url),
            backend_url: text("STUDYLAMP_BACKEND_URL")
                .or(file.backend_url)
                .unwrap_or_else(|| "http://127.0.0.1:8000".to_string()),
            api_token: text("STUDYLAMP_API_TOKEN").or(file.api_token),
            chat_context: text("STUDYLAMP_CHAT_CONTEXT")
                .or(file.chat_context)
                .unwrap_or_else(|| "study-assistant".to_string()),
            poll_interval_ms: parsed("STUDYLAMP_POLL_INTERVAL_MS")
                .or(file.poll_interval_ms)
                .unwrap_or(400)
                .max(1),
            health_interval_secs: parsed("STUDYLAMP_HEALTH_INTERVAL_SECS")
                .or(file.health_interval_secs)
                .unwrap_or(30)
                .max(1),
            health_timeout_ms: parsed("STUDYLAMP_HEALTH_TIMEOUT_MS")
                .or(file.health_timeout_ms)
                .unwrap_or(3000),
            warmup_frames: parsed("STUDYLAMP_WARMUP_FRAMES")
                .or(file.warmup_frames)
                .unwrap_or(2),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }

    /// Front-facing camera at 320x240, pinned to a device if configured.
    pub fn capture_constraints(&self) -> CaptureConstraints {
        CaptureConstraints {
            device: self.camera_device.clone(),
            ..CaptureConstraints::default()
        }
    }
}

/// `$STUDYLAMP_CONFIG`, else `$XDG_CONFIG_HOME/studylamp/config.toml`.
fn config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("STUDYLAMP_CONFIG") {
        return Some(PathBuf::from(path));
    }
    let config_dir = std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|_| std::env::var("HOME").map(|home| PathBuf::from(home).join(".config")))
        .ok()?;
    Some(config_dir.join("studylamp").join("config.toml"))
}

fn read_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
