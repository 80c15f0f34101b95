//! `cncsort-runtime` – Session orchestration
//!
//! Everything that turns collaborators and the motion gate into a sorting
//! run.
//!
//! # Modules
//!
//! - [`bed_mapping`] – [`BedMappingOrchestrator`]: one mapping session at a
//!   time, `Idle → Open → Stitching → Completed`, with `Aborted` on failure
//!   or cancellation.
//! - [`scan`] – [`ScanPlan::grid`] builds a serpentine grid of capture
//!   points; [`run_scan`] drives a whole session over it.
//! - [`coords`] – [`PixelMapper`]: pixel centre to machine coordinate.
//! - [`planner`] – [`VisitPlanner`] orders pending objects into
//!   rise/lateral/descend visits, with tool changes and places when sorting
//!   is configured; [`PickExecutor`] runs a plan through the gate and
//!   records progress in the store.
//! - [`sorting`] – [`SortingConfig`]: tools, bins and how objects are
//!   matched to them.
//! - [`subscribers`] – persistence, display, audit and planner handlers for
//!   the event channel.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: global
//!   `tracing` subscriber with optional OTLP export.
//!
//! # Motion
//!
//! Nothing in this crate talks to a controller directly.  Every move goes
//! through [`MotionGate::submit`], which validates before forwarding.

pub mod bed_mapping;
pub mod coords;
pub mod planner;
pub mod scan;
pub mod sorting;
pub mod subscribers;
pub mod telemetry;

pub use bed_mapping::{BedMappingOrchestrator, CaptureSummary, MapSummary, SessionState};
pub use coords::{CameraMount, PixelMapper};
pub use planner::{
    Exclusion, ExclusionReason, PickExecutor, PickPlan, Placement, PlannerConfig, PlannerError,
    ToolChange, Visit, VisitPlanner,
};
pub use scan::{Arrival, ScanArea, ScanPlan, run_scan};
pub use sorting::{BinConfig, SortingConfig, ToolChoice, ToolConfig};
pub use subscribers::{
    AuditSubscriber, DisplayState, DisplaySubscriber, PersistenceSubscriber, PlannerSubscriber,
    attach_defaults,
};
pub use telemetry::{TracerProviderGuard, init_tracing};

pub use cncsort_kernel::MotionGate;
