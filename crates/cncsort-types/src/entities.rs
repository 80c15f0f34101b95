//! Detection-side entities: machine positions, detected objects, frames and
//! captured images.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::SorterError;

/// Identifier of a [`DetectedObject`].  Ordered, so it doubles as the
/// deterministic tie-breaker when planning visits.
pub type ObjectId = Uuid;

// ────────────────────────────────────────────────────────────────────────────
// MachinePosition
// ────────────────────────────────────────────────────────────────────────────

/// A point in the machine's own coordinate space (millimetres).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct MachinePosition {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl MachinePosition {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// The machine origin (home).
    pub fn origin() -> Self {
        Self::default()
    }

    /// Same XY, different Z.
    pub fn with_z(self, z: f64) -> Self {
        Self { z, ..self }
    }

    /// Euclidean distance in all three axes.
    pub fn distance_to(&self, other: &MachinePosition) -> f64 {
        let dz = self.z - other.z;
        (self.planar_distance_to(other).powi(2) + dz * dz).sqrt()
    }

    /// Euclidean distance in the XY plane only.
    pub fn planar_distance_to(&self, other: &MachinePosition) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }

    /// `true` when every coordinate is a finite number.
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

impl fmt::Display for MachinePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.3}, {:.3}, {:.3})", self.x, self.y, self.z)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Pixel space
// ────────────────────────────────────────────────────────────────────────────

/// A point in image (pixel) coordinates.  Y grows downwards.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct PixelPoint {
    pub x: f64,
    pub y: f64,
}

impl PixelPoint {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Axis-aligned pixel rectangle (`x`, `y` is the top-left corner).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

// ────────────────────────────────────────────────────────────────────────────
// WorkStatus
// ────────────────────────────────────────────────────────────────────────────

/// Processing lifecycle of a detected object.
///
/// Transitions only move forward: `pending → processing → completed | failed`.
/// `completed` and `failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum WorkStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

impl WorkStatus {
    fn rank(self) -> u8 {
        match self {
            WorkStatus::Pending => 0,
            WorkStatus::Processing => 1,
            WorkStatus::Completed | WorkStatus::Failed => 2,
        }
    }

    /// `true` for `completed` and `failed`.
    pub fn is_terminal(self) -> bool {
        self.rank() == 2
    }

    /// Whether moving from `self` to `next` respects the monotonic lifecycle.
    ///
    /// Re-asserting the current status is allowed and is a no-op.
    pub fn can_transition_to(self, next: WorkStatus) -> bool {
        self == next || (!self.is_terminal() && next.rank() > self.rank())
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkStatus::Pending => "pending",
            WorkStatus::Processing => "processing",
            WorkStatus::Completed => "completed",
            WorkStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(WorkStatus::Pending),
            "processing" => Some(WorkStatus::Processing),
            "completed" => Some(WorkStatus::Completed),
            "failed" => Some(WorkStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// SizeClass
// ────────────────────────────────────────────────────────────────────────────

/// Coarse size bucket derived from the pixel area of a detection.
///
/// The thresholds match fasteners photographed at 1080p from the mapping
/// height (M2 nuts up to M12 bolts with washers).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum SizeClass {
    Tiny,
    Small,
    Medium,
    Large,
    #[default]
    Unknown,
}

impl SizeClass {
    /// Classify by contour area in square pixels.
    pub fn from_area(area_px: f64) -> Self {
        match area_px {
            a if (50.0..500.0).contains(&a) => SizeClass::Tiny,
            a if (500.0..2_000.0).contains(&a) => SizeClass::Small,
            a if (2_000.0..10_000.0).contains(&a) => SizeClass::Medium,
            a if (10_000.0..=80_000.0).contains(&a) => SizeClass::Large,
            _ => SizeClass::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SizeClass::Tiny => "tiny",
            SizeClass::Small => "small",
            SizeClass::Medium => "medium",
            SizeClass::Large => "large",
            SizeClass::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "tiny" => Some(SizeClass::Tiny),
            "small" => Some(SizeClass::Small),
            "medium" => Some(SizeClass::Medium),
            "large" => Some(SizeClass::Large),
            "unknown" => Some(SizeClass::Unknown),
            _ => None,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// DetectedObject
// ────────────────────────────────────────────────────────────────────────────

/// One object found in a single frame.
///
/// Created by the vision collaborator in pixel space; the bed-mapping
/// orchestrator fills in `machine_coordinate`, `image_id` and `bed_map_id`.
/// Afterwards only `status` changes, and only forwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DetectedObject {
    pub id: ObjectId,
    /// Index of the detection within its frame, as reported by the detector.
    pub label: u32,
    pub contour: Vec<(i32, i32)>,
    pub bounding_box: BoundingBox,
    /// Contour area in square pixels.
    pub area: f64,
    pub center: PixelPoint,
    pub machine_coordinate: Option<MachinePosition>,
    /// Shape classification, e.g. `"hex_nut"` or `"unknown"`.
    pub classification: String,
    pub size_class: SizeClass,
    pub confidence: f64,
    pub status: WorkStatus,
    pub image_id: Option<String>,
    pub bed_map_id: Option<String>,
    pub source_camera: Option<u32>,
    pub detected_at: DateTime<Utc>,
}

impl DetectedObject {
    /// A pending, unclassified candidate as the detector would report it.
    pub fn candidate(
        label: u32,
        contour: Vec<(i32, i32)>,
        bounding_box: BoundingBox,
        area: f64,
        center: PixelPoint,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            label,
            contour,
            bounding_box,
            area,
            center,
            machine_coordinate: None,
            classification: "unknown".to_string(),
            size_class: SizeClass::from_area(area),
            confidence: 0.0,
            status: WorkStatus::Pending,
            image_id: None,
            bed_map_id: None,
            source_camera: None,
            detected_at: Utc::now(),
        }
    }

    /// Move to `next`, rejecting any regression.
    pub fn transition(&mut self, next: WorkStatus) -> Result<(), SorterError> {
        if !self.status.can_transition_to(next) {
            return Err(SorterError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Frames and captures
// ────────────────────────────────────────────────────────────────────────────

/// A raw image handle.  The pixel buffer is shared, so clones are cheap.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub data: Arc<[u8]>,
}

impl Frame {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            data: data.into(),
        }
    }

    /// An all-black greyscale frame.
    pub fn blank(width: u32, height: u32) -> Self {
        Self::new(width, height, vec![0u8; (width as usize) * (height as usize)])
    }
}

/// One frame taken at a known machine position, with its detections.
#[derive(Debug, Clone)]
pub struct CapturedImage {
    pub image_id: String,
    pub frame: Frame,
    pub position: MachinePosition,
    pub objects: Vec<DetectedObject>,
    pub captured_at: DateTime<Utc>,
}
