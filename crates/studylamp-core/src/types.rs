use serde::{Deserialize, Serialize};

/// Minimum confidence (exclusive) for a positive detection to count as a hit.
pub const HIT_CONFIDENCE: f32 = 0.5;

/// Bounding box for a detected face, in source-frame pixel coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }
}

/// Outcome of a single inference call against one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Whether the model reported any face at all.
    pub present: bool,
    /// Confidence of the best face, 0.0 when none was found.
    pub confidence: f32,
    /// The best face, if any.
    pub face: Option<BoundingBox>,
}

impl Detection {
    /// A detection with no face.
    pub fn absent() -> Self {
        Self {
            present: false,
            confidence: 0.0,
            face: None,
        }
    }

    /// Build a detection from a confidence-sorted face list (best first).
    pub fn from_faces(faces: &[BoundingBox]) -> Self {
        match faces.first() {
            Some(best) => Self {
                present: true,
                confidence: best.confidence,
                face: Some(best.clone()),
            },
            None => Self::absent(),
        }
    }

    /// Classify this reading for the presence debouncer.
    ///
    /// A hit requires a reported face with confidence strictly above
    /// [`HIT_CONFIDENCE`].
    pub fn classify(&self) -> Classification {
        if self.present && self.confidence > HIT_CONFIDENCE {
            Classification::Hit
        } else {
            Classification::Miss
        }
    }
}

/// Per-frame reading fed to the debouncer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Hit,
    Miss,
}
