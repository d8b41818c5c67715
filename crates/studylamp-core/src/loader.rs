//! One-shot model loading.
//!
//! [`ModelLoader::ensure_loaded`] is safe to call from any number of tasks:
//! callers that arrive while a load is running wait for it and share its
//! outcome instead of starting a second fetch.

use crate::detector::{DetectionModel, FaceDetector};
use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use thiserror::Error;
use tokio::sync::{watch, Mutex};

/// File name of the UltraFace model inside the model directory.
pub const ULTRAFACE_MODEL_FILE: &str = "version-RFB-320.onnx";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStatus {
    Unloaded,
    Loading,
    Ready,
    Failed,
}

#[derive(Error, Debug, Clone)]
pub enum LoadError {
    #[error("model asset not found: {0}")]
    NotFound(String),
    #[error("model download failed: {0}")]
    Download(String),
    #[error("model load failed: {0}")]
    Load(String),
}

/// Where a detection model comes from.
#[async_trait]
pub trait ModelSource: Send + Sync {
    async fn load(&self) -> Result<Arc<dyn DetectionModel>, LoadError>;

    /// Description for logs.
    fn describe(&self) -> String;
}

/// ONNX model on disk, optionally downloaded on first use.
pub struct OnnxModelSource {
    path: PathBuf,
    url: Option<String>,
    client: reqwest::Client,
}

impl OnnxModelSource {
    pub fn new(model_dir: &Path, url: Option<String>) -> Self {
        Self {
            path: model_dir.join(ULTRAFACE_MODEL_FILE),
            url,
            client: reqwest::Client::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn download(&self, url: &str) -> Result<(), LoadError> {
        tracing::info!(url, path = %self.path.display(), "downloading detection model");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| LoadError::Download(e.to_string()))?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| LoadError::Download(e.to_string()))?;

        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| LoadError::Download(format!("{}: {e}", dir.display())))?;
        }
        // Write beside the target and rename so a torn download never looks complete.
        let partial = self.path.with_extension("onnx.part");
        tokio::fs::write(&partial, &bytes)
            .await
            .map_err(|e| LoadError::Download(format!("{}: {e}", partial.display())))?;
        tokio::fs::rename(&partial, &self.path)
            .await
            .map_err(|e| LoadError::Download(format!("{}: {e}", self.path.display())))?;

        tracing::info!(bytes = bytes.len(), "detection model downloaded");
        Ok(())
    }
}

#[async_trait]
impl ModelSource for OnnxModelSource {
    async fn load(&self) -> Result<Arc<dyn DetectionModel>, LoadError> {
        if !self.path.exists() {
            match &self.url {
                Some(url) => self.download(url).await?,
                None => return Err(LoadError::NotFound(self.path.display().to_string())),
            }
        }

        let path = self.path.clone();
        let detector = tokio::task::spawn_blocking(move || FaceDetector::load(&path))
            .await
            .map_err(|e| LoadError::Load(format!("loader task failed: {e}")))?
            .map_err(|e| LoadError::Load(e.to_string()))?;
        Ok(Arc::new(detector))
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

struct LoadState {
    model: Option<Arc<dyn DetectionModel>>,
    attempts: u64,
    last_error: Option<LoadError>,
}

pub struct ModelLoader {
    source: Box<dyn ModelSource>,
    state: Mutex<LoadState>,
    attempts: AtomicU64,
    /// Set once the first load succeeds; read without touching `state`.
    ready: OnceLock<Arc<dyn DetectionModel>>,
    status: watch::Sender<ModelStatus>,
}

impl ModelLoader {
    pub fn new(source: impl ModelSource + 'static) -> Self {
        let (status, _) = watch::channel(ModelStatus::Unloaded);
        Self {
            source: Box::new(source),
            state: Mutex::new(LoadState {
                model: None,
                attempts: 0,
                last_error: None,
            }),
            attempts: AtomicU64::new(0),
            ready: OnceLock::new(),
            status,
        }
    }

    /// Load the model if needed and return it.
    ///
    /// A caller that waited on an attempt which failed gets that failure back.
    /// Calling again afterwards starts a new attempt.
    pub async fn ensure_loaded(&self) -> Result<Arc<dyn DetectionModel>, LoadError> {
        let seen = self.attempts.load(Ordering::Acquire);
        let mut state = self.state.lock().await;

        if let Some(model) = &state.model {
            return Ok(Arc::clone(model));
        }
        if state.attempts != seen {
            if let Some(err) = &state.last_error {
                return Err(err.clone());
            }
        }

        self.status.send_replace(ModelStatus::Loading);
        tracing::info!(source = %self.source.describe(), "loading detection model");

        let result = self.source.load().await;
        state.attempts += 1;
        self.attempts.store(state.attempts, Ordering::Release);

        match result {
            Ok(model) => {
                tracing::info!(model = model.name(), "detection model ready");
                state.model = Some(Arc::clone(&model));
                state.last_error = None;
                let _ = self.ready.set(Arc::clone(&model));
                self.status.send_replace(ModelStatus::Ready);
                Ok(model)
            }
            Err(e) => {
                tracing::warn!(error = %e, "detection model failed to load");
                state.last_error = Some(e.clone());
                self.status.send_replace(ModelStatus::Failed);
                Err(e)
            }
        }
    }

    /// The loaded model, without triggering a load.
    pub fn get(&self) -> Option<Arc<dyn DetectionModel>> {
        self.ready.get().cloned()
    }

    pub fn status(&self) -> ModelStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ModelStatus> {
        self.status.subscribe()
    }
}
