//! Shared vocabulary of the sorter: entities, motion values, keep-out
//! geometry, bed maps, domain events and the workspace-wide [`SorterError`].
//!
//! Every other `cncsort-*` crate depends on this one and nothing here
//! performs I/O.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod bed_map;
pub mod entities;
pub mod events;
pub mod motion;

pub use bed_map::{BedMap, MapState};
pub use entities::{
    BoundingBox, CapturedImage, DetectedObject, Frame, MachinePosition, ObjectId, PixelPoint,
    SizeClass, WorkStatus,
};
pub use events::{Event, EventKind, EventPayload};
pub use motion::{
    Axis, CommandOrigin, FeedRateLimits, KeepOutZone, MotionCommand, MotionKind, ViolationReason,
    WorkspaceLimits,
};

/// Global error type spanning motion rejections, session misuse,
/// collaborator failures and storage problems.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SorterError {
    #[error("Boundary violation: {0}")]
    BoundaryViolation(ViolationReason),

    #[error("Cannot {operation} while session is {state}")]
    SessionState { operation: String, state: String },

    #[error("Collaborator failure in {component}: {details}")]
    Collaborator { component: String, details: String },

    #[error("Invalid status transition {from} -> {to}")]
    InvalidTransition { from: WorkStatus, to: WorkStatus },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Store error: {0}")]
    Store(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl SorterError {
    pub fn collaborator(component: impl Into<String>, details: impl ToString) -> Self {
        SorterError::Collaborator {
            component: component.into(),
            details: details.to_string(),
        }
    }

    pub fn session(operation: impl Into<String>, state: impl ToString) -> Self {
        SorterError::SessionState {
            operation: operation.into(),
            state: state.to_string(),
        }
    }
}

impl From<serde_json::Error> for SorterError {
    fn from(e: serde_json::Error) -> Self {
        SorterError::Serialization(e.to_string())
    }
}

/// Cooperative cancellation flag shared between the operator (Ctrl-C, REPL)
/// and long-running steps.  Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clear the flag so the next operation can run.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    /// `Err(SorterError::Cancelled)` once cancelled.
    pub fn check(&self) -> Result<(), SorterError> {
        if self.is_cancelled() {
            Err(SorterError::Cancelled)
        } else {
            Ok(())
        }
    }
}
