//! studylamp-core — Face-presence detection engine.
//!
//! Loads an UltraFace detector via ONNX Runtime, and turns noisy per-frame
//! detections into a stable presence signal.

pub mod context;
pub mod detector;
pub mod guard;
pub mod loader;
pub mod presence;
pub mod types;

pub use context::SessionContext;
pub use detector::{DetectionModel, FaceDetector};
pub use guard::{FlightPermit, OwnedFlightPermit, SingleFlight};
pub use loader::{LoadError, ModelLoader, ModelSource, ModelStatus, OnnxModelSource};
pub use presence::{PresenceDebouncer, PresenceState};
pub use types::{BoundingBox, Classification, Detection};

/// Default directory for ONNX model files.
///
/// Checks `$XDG_DATA_HOME/studylamp/models`, falling back to
/// `$HOME/.local/share/studylamp/models`.
pub fn default_model_dir() -> std::path::PathBuf {
    let data_dir = std::env::var("XDG_DATA_HOME")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            std::path::PathBuf::from(home).join(".local/share")
        });
    data_dir.join("studylamp").join("models")
}
