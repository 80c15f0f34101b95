//! Detection Record Store.
//!
//! Durable record of every [`DetectedObject`] and its processing status.
//! Status changes are monotonic (`pending → processing → completed | failed`);
//! a regression is rejected with [`StoreError::InvalidTransition`] and leaves
//! the record untouched.
//!
//! # Storage layout
//!
//! [`SqliteDetectionStore`] keeps one row per object in the table
//! `detected_objects`:
//!
//! | column | type | description |
//! |---|---|---|
//! | id | TEXT | object UUID, primary key |
//! | label | INTEGER | per-frame detection index |
//! | contour | TEXT | JSON array of `[x, y]` pixel pairs |
//! | bbox_x, bbox_y, bbox_w, bbox_h | INTEGER | pixel bounding box |
//! | area | REAL | contour area, px² |
//! | center_x, center_y | REAL | pixel center |
//! | machine_x, machine_y, machine_z | REAL | machine coordinate (NULL when unmapped) |
//! | classification | TEXT | shape label |
//! | size_class | TEXT | `tiny` … `large`, `unknown` |
//! | confidence | REAL | detector confidence |
//! | status | TEXT | `pending`, `processing`, `completed`, `failed` |
//! | image_id, bed_map_id | TEXT | provenance (nullable) |
//! | source_camera | INTEGER | camera index (nullable) |
//! | detected_at | TEXT | RFC-3339 UTC, nanosecond precision |
//!
//! # Example
//!
//! ```rust
//! use cncsort_memory::{DetectionStore, SqliteDetectionStore};
//! use cncsort_types::{BoundingBox, DetectedObject, PixelPoint, WorkStatus};
//!
//! let store = SqliteDetectionStore::open_in_memory().unwrap();
//! let obj = DetectedObject::candidate(0, vec![], BoundingBox::default(), 900.0, PixelPoint::new(10.0, 10.0));
//! store.save(&obj).unwrap();
//!
//! store.update_status(obj.id, WorkStatus::Processing).unwrap();
//! assert!(store.list_pending(None).unwrap().is_empty());
//! assert!(store.update_status(obj.id, WorkStatus::Pending).is_err());
//! ```

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, SecondsFormat, Utc};
use cncsort_types::{
    BoundingBox, DetectedObject, MachinePosition, ObjectId, PixelPoint, SizeClass, WorkStatus,
};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, params};
use tracing::debug;
use uuid::Uuid;

use crate::StoreError;

// ─────────────────────────────────────────────────────────────────────────────
// Trait
// ─────────────────────────────────────────────────────────────────────────────

pub trait DetectionStore: Send + Sync {
    /// Insert or update `object`.  Updating may not move its status backwards.
    fn save(&self, object: &DetectedObject) -> Result<(), StoreError>;

    fn get(&self, id: ObjectId) -> Result<Option<DetectedObject>, StoreError>;

    /// Pending objects in insertion order, optionally restricted to one bed map.
    fn list_pending(&self, map_id: Option<&str>) -> Result<Vec<DetectedObject>, StoreError>;

    /// Move `id` to `status`.  Re-asserting the current status is a no-op.
    fn update_status(&self, id: ObjectId, status: WorkStatus) -> Result<(), StoreError>;

    /// All objects, newest first, at most `limit` of them.
    fn list_all(&self, limit: Option<usize>) -> Result<Vec<DetectedObject>, StoreError>;
}

fn check_transition(id: ObjectId, from: WorkStatus, to: WorkStatus) -> Result<(), StoreError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(StoreError::InvalidTransition { id, from, to })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SQLite
// ─────────────────────────────────────────────────────────────────────────────

const COLUMNS: &str = "id, label, contour, bbox_x, bbox_y, bbox_w, bbox_h, area, center_x, center_y, \
     machine_x, machine_y, machine_z, classification, size_class, confidence, status, \
     image_id, bed_map_id, source_camera, detected_at";

pub struct SqliteDetectionStore {
    conn: Mutex<Connection>,
}

impl SqliteDetectionStore {
    /// Open (or create) a persistent store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Open a temporary in-memory store (useful for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.conn().execute_batch(
            "CREATE TABLE IF NOT EXISTS detected_objects (
                id             TEXT NOT NULL PRIMARY KEY,
                label          INTEGER NOT NULL,
                contour        TEXT NOT NULL,
                bbox_x         INTEGER NOT NULL,
                bbox_y         INTEGER NOT NULL,
                bbox_w         INTEGER NOT NULL,
                bbox_h         INTEGER NOT NULL,
                area           REAL NOT NULL,
                center_x       REAL NOT NULL,
                center_y       REAL NOT NULL,
                machine_x      REAL,
                machine_y      REAL,
                machine_z      REAL,
                classification TEXT NOT NULL,
                size_class     TEXT NOT NULL,
                confidence     REAL NOT NULL,
                status         TEXT NOT NULL DEFAULT 'pending',
                image_id       TEXT,
                bed_map_id     TEXT,
                source_camera  INTEGER,
                detected_at    TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_detected_objects_status
                ON detected_objects (status, bed_map_id);",
        )?;
        Ok(())
    }

    fn status_of(conn: &Connection, id: ObjectId) -> Result<Option<WorkStatus>, StoreError> {
        let raw: Option<String> = conn
            .query_row(
                "SELECT status FROM detected_objects WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|s| {
            WorkStatus::parse(&s).ok_or_else(|| StoreError::Corrupt {
                id: id.to_string(),
                details: format!("unknown status '{s}'"),
            })
        })
        .transpose()
    }
}

impl DetectionStore for SqliteDetectionStore {
    fn save(&self, object: &DetectedObject) -> Result<(), StoreError> {
        let conn = self.conn();
        if let Some(current) = Self::status_of(&conn, object.id)? {
            check_transition(object.id, current, object.status)?;
        }

        let contour = serde_json::to_string(&object.contour)?;
        let machine = object.machine_coordinate;
        conn.execute(
            &format!(
                "INSERT INTO detected_objects ({COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)
                 ON CONFLICT(id) DO UPDATE SET
                    label = excluded.label, contour = excluded.contour,
                    bbox_x = excluded.bbox_x, bbox_y = excluded.bbox_y,
                    bbox_w = excluded.bbox_w, bbox_h = excluded.bbox_h,
                    area = excluded.area, center_x = excluded.center_x, center_y = excluded.center_y,
                    machine_x = excluded.machine_x, machine_y = excluded.machine_y, machine_z = excluded.machine_z,
                    classification = excluded.classification, size_class = excluded.size_class,
                    confidence = excluded.confidence, status = excluded.status,
                    image_id = excluded.image_id, bed_map_id = excluded.bed_map_id,
                    source_camera = excluded.source_camera, detected_at = excluded.detected_at"
            ),
            params![
                object.id.to_string(),
                object.label,
                contour,
                object.bounding_box.x,
                object.bounding_box.y,
                object.bounding_box.width,
                object.bounding_box.height,
                object.area,
                object.center.x,
                object.center.y,
                machine.map(|m| m.x),
                machine.map(|m| m.y),
                machine.map(|m| m.z),
                object.classification,
                object.size_class.as_str(),
                object.confidence,
                object.status.as_str(),
                object.image_id,
                object.bed_map_id,
                object.source_camera,
                object.detected_at.to_rfc3339_opts(SecondsFormat::Nanos, true),
            ],
        )?;
        debug!(id = %object.id, status = %object.status, "detection saved");
        Ok(())
    }

    fn get(&self, id: ObjectId) -> Result<Option<DetectedObject>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM detected_objects WHERE id = ?1"))?;
        Ok(stmt.query_row(params![id.to_string()], row_to_object).optional()?)
    }

    fn list_pending(&self, map_id: Option<&str>) -> Result<Vec<DetectedObject>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM detected_objects
             WHERE status = ?1 AND (?2 IS NULL OR bed_map_id = ?2)
             ORDER BY rowid ASC"
        ))?;
        let rows = stmt.query_map(params![WorkStatus::Pending.as_str(), map_id], row_to_object)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn update_status(&self, id: ObjectId, status: WorkStatus) -> Result<(), StoreError> {
        let conn = self.conn();
        let current = Self::status_of(&conn, id)?.ok_or(StoreError::NotFound(id))?;
        check_transition(id, current, status)?;
        if current != status {
            conn.execute(
                "UPDATE detected_objects SET status = ?1 WHERE id = ?2",
                params![status.as_str(), id.to_string()],
            )?;
            debug!(%id, from = %current, to = %status, "status updated");
        }
        Ok(())
    }

    fn list_all(&self, limit: Option<usize>) -> Result<Vec<DetectedObject>, StoreError> {
        let conn = self.conn();
        // SQLite treats a negative LIMIT as "no limit".
        let limit = limit.map_or(-1, |l| i64::try_from(l).unwrap_or(i64::MAX));
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM detected_objects
             ORDER BY detected_at DESC, rowid DESC LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![limit], row_to_object)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

fn conversion_error<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn row_to_object(row: &rusqlite::Row<'_>) -> rusqlite::Result<DetectedObject> {
    let id: String = row.get(0)?;
    let id = Uuid::parse_str(&id).map_err(|e| conversion_error(0, e))?;
    let contour: String = row.get(2)?;
    let contour: Vec<(i32, i32)> = serde_json::from_str(&contour).map_err(|e| conversion_error(2, e))?;

    let machine_coordinate = match (
        row.get::<_, Option<f64>>(10)?,
        row.get::<_, Option<f64>>(11)?,
        row.get::<_, Option<f64>>(12)?,
    ) {
        (Some(x), Some(y), Some(z)) => Some(MachinePosition::new(x, y, z)),
        _ => None,
    };

    let size_class: String = row.get(14)?;
    let size_class = SizeClass::parse(&size_class)
        .ok_or_else(|| rusqlite::Error::InvalidColumnType(14, size_class, Type::Text))?;
    let status: String = row.get(16)?;
    let status = WorkStatus::parse(&status)
        .ok_or_else(|| rusqlite::Error::InvalidColumnType(16, status, Type::Text))?;
    let detected_at: String = row.get(20)?;
    let detected_at = DateTime::parse_from_rfc3339(&detected_at)
        .map_err(|e| conversion_error(20, e))?
        .with_timezone(&Utc);

    Ok(DetectedObject {
        id,
        label: row.get(1)?,
        contour,
        bounding_box: BoundingBox {
            x: row.get(3)?,
            y: row.get(4)?,
            width: row.get(5)?,
            height: row.get(6)?,
        },
        area: row.get(7)?,
        center: PixelPoint::new(row.get(8)?, row.get(9)?),
        machine_coordinate,
        classification: row.get(13)?,
        size_class,
        confidence: row.get(15)?,
        status,
        image_id: row.get(17)?,
        bed_map_id: row.get(18)?,
        source_camera: row.get(19)?,
        detected_at,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory
// ─────────────────────────────────────────────────────────────────────────────

/// Volatile store with the same semantics as the SQLite one.
#[derive(Debug, Default)]
pub struct InMemoryDetectionStore {
    objects: Mutex<Vec<DetectedObject>>,
}

impl InMemoryDetectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn objects(&self) -> MutexGuard<'_, Vec<DetectedObject>> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl DetectionStore for InMemoryDetectionStore {
    fn save(&self, object: &DetectedObject) -> Result<(), StoreError> {
        let mut objects = self.objects();
        match objects.iter_mut().find(|o| o.id == object.id) {
            Some(existing) => {
                check_transition(object.id, existing.status, object.status)?;
                *existing = object.clone();
            }
            None => objects.push(object.clone()),
        }
        Ok(())
    }

    fn get(&self, id: ObjectId) -> Result<Option<DetectedObject>, StoreError> {
        Ok(self.objects().iter().find(|o| o.id == id).cloned())
    }

    fn list_pending(&self, map_id: Option<&str>) -> Result<Vec<DetectedObject>, StoreError> {
        Ok(self
            .objects()
            .iter()
            .filter(|o| o.status == WorkStatus::Pending)
            .filter(|o| map_id.is_none_or(|m| o.bed_map_id.as_deref() == Some(m)))
            .cloned()
            .collect())
    }

    fn update_status(&self, id: ObjectId, status: WorkStatus) -> Result<(), StoreError> {
        let mut objects = self.objects();
        let object = objects
            .iter_mut()
            .find(|o| o.id == id)
            .ok_or(StoreError::NotFound(id))?;
        check_transition(id, object.status, status)?;
        object.status = status;
        Ok(())
    }

    fn list_all(&self, limit: Option<usize>) -> Result<Vec<DetectedObject>, StoreError> {
        let mut all: Vec<DetectedObject> = self.objects().iter().rev().cloned().collect();
        all.sort_by(|a, b| b.detected_at.cmp(&a.detected_at));
        if let Some(limit) = limit {
            all.truncate(limit);
        }
        Ok(all)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
