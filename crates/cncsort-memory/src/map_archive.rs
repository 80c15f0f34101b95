//! On-disk archive of finished (or aborted) bed maps.
//!
//! Layout under the archive root:
//!
//! ```text
//! <root>/<map id>/
//!     metadata.json      ArchiveMetadata
//!     img_001.raw        raw frame bytes, one file per capture
//!     composite.raw      stitched composite, when present
//! ```
//!
//! Map and image ids are reduced to a single safe path component first, so
//! an id can never escape the archive root.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use cncsort_types::{BedMap, DetectedObject, MachinePosition, MapState};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::StoreError;

const METADATA_FILE: &str = "metadata.json";
const COMPOSITE_FILE: &str = "composite.raw";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivedFrame {
    pub file: String,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivedCapture {
    pub image_id: String,
    pub frame: ArchivedFrame,
    pub position: MachinePosition,
    pub object_count: usize,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveMetadata {
    pub map_id: String,
    pub state: MapState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub abort_reason: Option<String>,
    pub image_count: usize,
    pub object_count: usize,
    pub captures: Vec<ArchivedCapture>,
    pub composite: Option<ArchivedFrame>,
    pub objects: Vec<DetectedObject>,
}

#[derive(Debug, Clone)]
pub struct MapArchive {
    root: PathBuf,
}

impl MapArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory a map with `map_id` is (or would be) archived in.
    pub fn map_dir(&self, map_id: &str) -> PathBuf {
        self.root.join(sanitize_component(map_id))
    }

    /// Write `map` to disk and return its directory.  Existing files for the
    /// same map are overwritten.
    pub fn store(&self, map: &BedMap) -> Result<PathBuf, StoreError> {
        let dir = self.map_dir(map.id());
        fs::create_dir_all(&dir)?;

        let mut captures = Vec::with_capacity(map.capture_count());
        for capture in map.captures() {
            let file = format!("{}.raw", sanitize_component(&capture.image_id));
            fs::write(dir.join(&file), &capture.frame.data[..])?;
            captures.push(ArchivedCapture {
                image_id: capture.image_id.clone(),
                frame: ArchivedFrame {
                    file,
                    width: capture.frame.width,
                    height: capture.frame.height,
                },
                position: capture.position,
                object_count: capture.objects.len(),
                captured_at: capture.captured_at,
            });
        }

        let composite = match map.composite() {
            Some(frame) => {
                fs::write(dir.join(COMPOSITE_FILE), &frame.data[..])?;
                Some(ArchivedFrame {
                    file: COMPOSITE_FILE.to_string(),
                    width: frame.width,
                    height: frame.height,
                })
            }
            None => None,
        };

        let metadata = ArchiveMetadata {
            map_id: map.id().to_string(),
            state: map.state(),
            started_at: map.started_at(),
            finished_at: map.finished_at(),
            abort_reason: map.abort_reason().map(str::to_string),
            image_count: map.capture_count(),
            object_count: map.object_count(),
            captures,
            composite,
            objects: map.objects().cloned().collect(),
        };
        fs::write(dir.join(METADATA_FILE), serde_json::to_string_pretty(&metadata)?)?;

        info!(map_id = map.id(), dir = %dir.display(), images = metadata.image_count, "bed map archived");
        Ok(dir)
    }

    pub fn load_metadata(&self, map_id: &str) -> Result<ArchiveMetadata, StoreError> {
        let raw = fs::read_to_string(self.map_dir(map_id).join(METADATA_FILE))?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// Reduce `component` to one safe file name: directory parts and `..` are
/// dropped and anything outside `[A-Za-z0-9._-]` becomes `_`.
pub fn sanitize_component(component: &str) -> String {
    let base = component.rsplit(['/', '\\']).next().unwrap_or_default();
    let sanitized: String = base
        .replace("..", "")
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') { c } else { '_' })
        .collect();
    if sanitized.is_empty() || sanitized == "." {
        format!("item_{}", Utc::now().format("%Y%m%d_%H%M%S"))
    } else {
        sanitized
    }
}
