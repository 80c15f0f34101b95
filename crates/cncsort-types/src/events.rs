//! Domain events carried by the event channel.
//!
//! Every event travels in the same [`Event`] envelope; the [`EventPayload`]
//! variant decides which handlers see it (via [`EventKind`]).
//!
//! | Kind | Published by |
//! |---|---|
//! | `objects_detected` | bed-mapping orchestrator, once per capture |
//! | `bed_map_completed` | bed-mapping orchestrator, after a successful stitch |
//! | `bed_map_aborted` | bed-mapping orchestrator, on abort or failure |
//! | `position_updated` | motion gate, after each accepted command |
//! | `boundary_violation_detected` | motion validator, on rejection |
//! | `pick_task_created` | visit planner, once per planned visit |

use std::fmt;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entities::{DetectedObject, MachinePosition, ObjectId};
use crate::motion::{MotionCommand, ViolationReason};

/// Unified event wrapper for the event channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g. `"cncsort-kernel::validator"`
    pub source: String,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    /// Objects found in one capture; `objects` may be empty.
    ObjectsDetected {
        objects: Vec<DetectedObject>,
        image_id: String,
        map_id: String,
    },
    BedMapCompleted {
        map_id: String,
        object_count: usize,
        image_count: usize,
    },
    BedMapAborted { map_id: String, reason: String },
    PositionUpdated {
        position: MachinePosition,
        previous: MachinePosition,
    },
    BoundaryViolationDetected {
        command: MotionCommand,
        reason: ViolationReason,
    },
    PickTaskCreated {
        task_id: Uuid,
        object_id: ObjectId,
        target: MachinePosition,
    },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::ObjectsDetected { .. } => EventKind::ObjectsDetected,
            EventPayload::BedMapCompleted { .. } => EventKind::BedMapCompleted,
            EventPayload::BedMapAborted { .. } => EventKind::BedMapAborted,
            EventPayload::PositionUpdated { .. } => EventKind::PositionUpdated,
            EventPayload::BoundaryViolationDetected { .. } => EventKind::BoundaryViolationDetected,
            EventPayload::PickTaskCreated { .. } => EventKind::PickTaskCreated,
        }
    }
}

/// Routing key for subscriptions: one per [`EventPayload`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ObjectsDetected,
    BedMapCompleted,
    BedMapAborted,
    PositionUpdated,
    BoundaryViolationDetected,
    PickTaskCreated,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        EventKind::ObjectsDetected,
        EventKind::BedMapCompleted,
        EventKind::BedMapAborted,
        EventKind::PositionUpdated,
        EventKind::BoundaryViolationDetected,
        EventKind::PickTaskCreated,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::ObjectsDetected => "objects_detected",
            EventKind::BedMapCompleted => "bed_map_completed",
            EventKind::BedMapAborted => "bed_map_aborted",
            EventKind::PositionUpdated => "position_updated",
            EventKind::BoundaryViolationDetected => "boundary_violation_detected",
            EventKind::PickTaskCreated => "pick_task_created",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
