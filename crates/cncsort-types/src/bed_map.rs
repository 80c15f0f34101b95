//! [`BedMap`]: the aggregate built by one mapping session.
//!
//! All mutation goes through guarded transitions on [`MapState`]:
//!
//! | From | Operation | To |
//! |---|---|---|
//! | `Open` | [`BedMap::push_capture`] | `Open` |
//! | `Open` | [`BedMap::begin_stitching`] | `Stitching` |
//! | `Stitching` | [`BedMap::complete`] | `Completed` (frozen) |
//! | `Open` / `Stitching` | [`BedMap::abort`] | `Aborted` |
//!
//! Any other combination returns [`SorterError::SessionState`] and leaves the
//! map untouched.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::SorterError;
use crate::entities::{CapturedImage, DetectedObject, Frame};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MapState {
    Open,
    Stitching,
    Completed,
    Aborted,
}

impl fmt::Display for MapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MapState::Open => "open",
            MapState::Stitching => "stitching",
            MapState::Completed => "completed",
            MapState::Aborted => "aborted",
        })
    }
}

#[derive(Debug, Clone)]
pub struct BedMap {
    id: String,
    state: MapState,
    captures: Vec<CapturedImage>,
    composite: Option<Frame>,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    abort_reason: Option<String>,
}

impl BedMap {
    /// A fresh, open map.
    pub fn open(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: MapState::Open,
            captures: Vec::new(),
            composite: None,
            started_at: Utc::now(),
            finished_at: None,
            abort_reason: None,
        }
    }

    /// Map id of the form `map_YYYYmmdd_HHMMSS_<suffix>`.
    pub fn generate_id() -> String {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("map_{}_{}", Utc::now().format("%Y%m%d_%H%M%S"), &suffix[..8])
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> MapState {
        self.state
    }

    pub fn captures(&self) -> &[CapturedImage] {
        &self.captures
    }

    pub fn capture_count(&self) -> usize {
        self.captures.len()
    }

    pub fn composite(&self) -> Option<&Frame> {
        self.composite.as_ref()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn abort_reason(&self) -> Option<&str> {
        self.abort_reason.as_deref()
    }

    /// Every object across all captures, in capture order.
    pub fn objects(&self) -> impl Iterator<Item = &DetectedObject> {
        self.captures.iter().flat_map(|c| c.objects.iter())
    }

    pub fn object_count(&self) -> usize {
        self.captures.iter().map(|c| c.objects.len()).sum()
    }

    /// Image id for the next capture: `img_001`, `img_002`, …
    pub fn next_image_id(&self) -> String {
        format!("img_{:03}", self.captures.len() + 1)
    }

    pub fn push_capture(&mut self, capture: CapturedImage) -> Result<(), SorterError> {
        self.require(MapState::Open, "add capture to")?;
        self.captures.push(capture);
        Ok(())
    }

    pub fn begin_stitching(&mut self) -> Result<(), SorterError> {
        self.require(MapState::Open, "stitch")?;
        self.state = MapState::Stitching;
        Ok(())
    }

    /// Attach the stitched composite and freeze the map.
    pub fn complete(&mut self, composite: Frame) -> Result<(), SorterError> {
        self.require(MapState::Stitching, "complete")?;
        self.composite = Some(composite);
        self.state = MapState::Completed;
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    /// Abort an open or stitching map.  Captures are kept for diagnostics.
    pub fn abort(&mut self, reason: impl Into<String>) -> Result<(), SorterError> {
        match self.state {
            MapState::Open | MapState::Stitching => {
                self.state = MapState::Aborted;
                self.abort_reason = Some(reason.into());
                self.finished_at = Some(Utc::now());
                Ok(())
            }
            other => Err(SorterError::session("abort", format!("map {other}"))),
        }
    }

    fn require(&self, expected: MapState, operation: &str) -> Result<(), SorterError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(SorterError::session(operation, format!("map {}", self.state)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{BoundingBox, MachinePosition, PixelPoint};

    fn capture(map: &BedMap, objects: usize) -> CapturedImage {
        CapturedImage {
            image_id: map.next_image_id(),
            frame: Frame::blank(4, 4),
            position: MachinePosition::new(100.0, 100.0, 50.0),
            objects: (0..objects)
                .map(|i| DetectedObject::candidate(i as u32, vec![], BoundingBox::default(), 900.0, PixelPoint::default()))
                .collect(),
            captured_at: Utc::now(),
        }
    }

    #[test]
    fn image_ids_are_sequential() {
        let mut map = BedMap::open("m");
        assert_eq!(map.next_image_id(), "img_001");
        let c = capture(&map, 1);
        map.push_capture(c).unwrap();
        assert_eq!(map.next_image_id(), "img_002");
    }

    #[test]
    fn completed_map_is_frozen() {
        let mut map = BedMap::open("m");
        let c = capture(&map, 2);
        map.push_capture(c).unwrap();
        let c = capture(&map, 1);
        map.push_capture(c).unwrap();
        map.begin_stitching().unwrap();
        map.complete(Frame::blank(8, 4)).unwrap();

        assert_eq!(map.state(), MapState::Completed);
        assert_eq!(map.object_count(), 3);
        let late = capture(&map, 1);
        assert!(matches!(map.push_capture(late), Err(SorterError::SessionState { .. })));
        assert!(map.abort("late").is_err());
        assert_eq!(map.capture_count(), 2);
    }

    #[test]
    fn captures_rejected_while_stitching() {
        let mut map = BedMap::open("m");
        map.begin_stitching().unwrap();
        let c = capture(&map, 0);
        assert!(map.push_capture(c).is_err());
        assert!(map.complete(Frame::blank(1, 1)).is_ok());
    }

    #[test]
    fn abort_keeps_partial_captures() {
        let mut map = BedMap::open("m");
        let c = capture(&map, 1);
        map.push_capture(c).unwrap();
        map.abort("camera unplugged").unwrap();
        assert_eq!(map.state(), MapState::Aborted);
        assert_eq!(map.abort_reason(), Some("camera unplugged"));
        assert_eq!(map.capture_count(), 1);
        assert!(map.finished_at().is_some());
    }

    #[test]
    fn generated_ids_have_map_prefix() {
        let id = BedMap::generate_id();
        assert!(id.starts_with("map_"));
        assert_ne!(id, BedMap::generate_id());
    }
}
