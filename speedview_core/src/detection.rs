//! Detector input types.
//!
//! A `Detection` is transient: it is supplied by the external detector for one
//! frame and is not retained by any engine beyond that frame.

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// A point in pixel space.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PixelPoint {
    pub x: f64,
    pub y: f64,
}

impl PixelPoint {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    #[inline]
    pub fn distance_to(&self, other: &PixelPoint) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }

    #[inline]
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

/// Axis-aligned box `(xmin, ymin, xmax, ymax)` in pixels.
///
/// Serialized as a four-element array, matching the detector's wire format.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 4]", into = "[f64; 4]")]
pub struct BoundingBox {
    pub xmin: f64,
    pub ymin: f64,
    pub xmax: f64,
    pub ymax: f64,
}

impl BoundingBox {
    pub fn new(xmin: f64, ymin: f64, xmax: f64, ymax: f64) -> Self {
        Self { xmin, ymin, xmax, ymax }
    }

    /// Box of the given size centred on `center`.
    pub fn centered(center: PixelPoint, width: f64, height: f64) -> Self {
        Self {
            xmin: center.x - width / 2.0,
            ymin: center.y - height / 2.0,
            xmax: center.x + width / 2.0,
            ymax: center.y + height / 2.0,
        }
    }

    #[inline]
    pub fn center(&self) -> PixelPoint {
        PixelPoint::new((self.xmin + self.xmax) / 2.0, (self.ymin + self.ymax) / 2.0)
    }

    pub fn width(&self) -> f64 {
        self.xmax - self.xmin
    }

    pub fn height(&self) -> f64 {
        self.ymax - self.ymin
    }
}

impl From<[f64; 4]> for BoundingBox {
    fn from(v: [f64; 4]) -> Self {
        Self::new(v[0], v[1], v[2], v[3])
    }
}

impl From<BoundingBox> for [f64; 4] {
    fn from(b: BoundingBox) -> Self {
        [b.xmin, b.ymin, b.xmax, b.ymax]
    }
}

/// One object reported by the detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    #[serde(rename = "box")]
    pub bbox: BoundingBox,
    pub label: String,
    pub confidence: f64,
}

impl Detection {
    pub fn new(bbox: BoundingBox, label: impl Into<String>, confidence: f64) -> Self {
        Self {
            bbox,
            label: label.into(),
            confidence,
        }
    }

    pub fn center(&self) -> PixelPoint {
        self.bbox.center()
    }

    /// Checks the detection can be used by the engines.
    ///
    /// Rejects non-finite coordinates, inverted boxes and confidences that are
    /// non-finite or outside `[0, 1]`.
    pub fn validate(&self) -> Result<(), EngineError> {
        let b = &self.bbox;
        if ![b.xmin, b.ymin, b.xmax, b.ymax].iter().all(|v| v.is_finite()) {
            return Err(EngineError::malformed(format!(
                "non-finite box for '{}'",
                self.label
            )));
        }
        if b.xmax < b.xmin || b.ymax < b.ymin {
            return Err(EngineError::malformed(format!(
                "inverted box [{}, {}, {}, {}] for '{}'",
                b.xmin, b.ymin, b.xmax, b.ymax, self.label
            )));
        }
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(EngineError::malformed(format!(
                "confidence {} outside [0, 1] for '{}'",
                self.confidence, self.label
            )));
        }
        Ok(())
    }
}

/// All detections for a single frame, stamped with the frame's capture time (seconds).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FrameBatch {
    pub timestamp: f64,
    #[serde(default)]
    pub detections: Vec<Detection>,
}

impl FrameBatch {
    pub fn new(timestamp: f64, detections: Vec<Detection>) -> Self {
        Self { timestamp, detections }
    }
}

/// Splits a slice into valid detections and a count of malformed ones.
pub(crate) fn partition_valid(detections: &[Detection]) -> (Vec<&Detection>, usize) {
    let mut valid = Vec::with_capacity(detections.len());
    let mut malformed = 0;
    for det in detections {
        match det.validate() {
            Ok(()) => valid.push(det),
            Err(e) => {
                tracing::trace!("dropping detection: {}", e);
                malformed += 1;
            }
        }
    }
    (valid, malformed)
}
