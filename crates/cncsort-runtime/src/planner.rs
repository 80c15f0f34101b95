//! Visit-order planning and execution.
//!
//! [`VisitPlanner::plan`] turns the pending objects of a bed map into an
//! ordered [`PickPlan`]:
//!
//! 1. Objects that are not `pending` are ignored.
//! 2. Objects without a machine coordinate, outside the limits, inside a
//!    keep-out zone, or whose vertical approach from safe height is blocked
//!    are listed in [`PickPlan::excluded`] with a reason.
//! 3. The rest are visited nearest-neighbour first, measured in the XY plane
//!    from the current position.  Equal distances go to the lowest object
//!    id.  A candidate whose lateral move at safe height would cross a zone
//!    is skipped for that step; candidates that stay unreachable are
//!    excluded.
//!
//! Each pick is three commands: rise to safe height (rapid), move
//! laterally above the object (rapid), descend onto it (linear, pick feed).
//! The planner performs no I/O apart from publishing one `PickTaskCreated`
//! per visit; the commands are validated again by the gate when executed.
//!
//! # Sorting
//!
//! With a [`SortingConfig`] attached through [`VisitPlanner::with_sorting`]
//! every object is also given a tool and a bin (see [`crate::sorting`]):
//!
//! - objects without a fitting tool or bin are excluded;
//! - objects are grouped by tool in configuration order, and each group
//!   starts with a trip to that tool's change station;
//! - every pick is followed by a place: rise, lateral to the bin, descend;
//! - nearest-neighbour distance is measured from where the last place left
//!   the head, and a candidate whose carry to its bin would cross a zone is
//!   skipped like one whose approach is blocked.
//!
//! [`PickExecutor`] runs a plan through a [`MotionGate`] and records each
//! object's progress in a [`DetectionStore`].

use std::collections::BTreeMap;

use cncsort_kernel::MotionGate;
use cncsort_memory::DetectionStore;
use cncsort_middleware::EventChannel;
use cncsort_types::{
    Axis, CancelToken, CommandOrigin, DetectedObject, Event, EventPayload, KeepOutZone,
    MachinePosition, MotionCommand, ObjectId, SorterError, ViolationReason, WorkStatus,
    WorkspaceLimits,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::sorting::{BinConfig, SortingConfig, ToolChoice};

const EVENT_SOURCE: &str = "cncsort-runtime::planner";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlannerError {
    #[error("safe height {safe_z:.2}mm is outside the Z limits [{min:.2}, {max:.2}]")]
    SafeHeightOutOfLimits { safe_z: f64, min: f64, max: f64 },

    #[error("{station} at {location} is unreachable: {reason}")]
    StationUnreachable {
        station: String,
        location: MachinePosition,
        reason: String,
    },

    #[error("sorting configuration: {0}")]
    Sorting(String),
}

impl From<PlannerError> for SorterError {
    fn from(e: PlannerError) -> Self {
        match e {
            PlannerError::SafeHeightOutOfLimits { safe_z, min, max } => {
                SorterError::BoundaryViolation(ViolationReason::OutOfBounds {
                    axis: Axis::Z,
                    value: safe_z,
                    min,
                    max,
                })
            }
            other => SorterError::Config(other.to_string()),
        }
    }
}

/// Why an object was left out of a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExclusionReason {
    MissingCoordinate,
    OutOfLimits { reason: ViolationReason },
    InsideKeepOut { zone: String },
    ApproachBlocked { zone: String },
    NoMatchingTool { classification: String },
    NoMatchingBin { classification: String, size: String },
    PlaceBlocked { bin: String, zone: String },
    ToolChangeBlocked { tool: String, zone: String },
}

impl std::fmt::Display for ExclusionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExclusionReason::MissingCoordinate => f.write_str("no machine coordinate"),
            ExclusionReason::OutOfLimits { reason } => write!(f, "{reason}"),
            ExclusionReason::InsideKeepOut { zone } => write!(f, "inside keep-out zone '{zone}'"),
            ExclusionReason::ApproachBlocked { zone } => write!(f, "approach blocked by zone '{zone}'"),
            ExclusionReason::NoMatchingTool { classification } => {
                write!(f, "no tool handles '{classification}'")
            }
            ExclusionReason::NoMatchingBin { classification, size } => {
                write!(f, "no bin accepts {size} '{classification}'")
            }
            ExclusionReason::PlaceBlocked { bin, zone } => {
                write!(f, "carry to bin '{bin}' blocked by zone '{zone}'")
            }
            ExclusionReason::ToolChangeBlocked { tool, zone } => {
                write!(f, "change station of tool '{tool}' blocked by zone '{zone}'")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exclusion {
    pub object_id: ObjectId,
    pub reason: ExclusionReason,
}

/// Trip to a tool change station.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolChange {
    pub tool_id: String,
    pub location: MachinePosition,
    pub commands: [MotionCommand; 3],
}

/// Carry from the object to its bin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    pub bin_id: String,
    pub location: MachinePosition,
    pub commands: [MotionCommand; 3],
}

/// Everything done for one object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Visit {
    pub task_id: Uuid,
    pub object_id: ObjectId,
    pub target: MachinePosition,
    /// Tool the pick is made with, when tools are configured.
    pub tool: Option<String>,
    /// Set on the first visit of each tool group.
    pub tool_change: Option<ToolChange>,
    /// Rise, lateral and descend onto the object.
    pub pick: [MotionCommand; 3],
    pub place: Option<Placement>,
}

impl Visit {
    /// Tool change, pick and place commands, in execution order.
    pub fn commands(&self) -> impl Iterator<Item = &MotionCommand> {
        self.tool_change
            .iter()
            .flat_map(|t| t.commands.iter())
            .chain(self.pick.iter())
            .chain(self.place.iter().flat_map(|p| p.commands.iter()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PickPlan {
    pub visits: Vec<Visit>,
    pub excluded: Vec<Exclusion>,
}

impl PickPlan {
    /// Object ids in visit order.
    pub fn order(&self) -> Vec<ObjectId> {
        self.visits.iter().map(|v| v.object_id).collect()
    }

    /// Every command of the plan, in execution order.
    pub fn commands(&self) -> impl Iterator<Item = &MotionCommand> {
        self.visits.iter().flat_map(Visit::commands)
    }

    pub fn tool_changes(&self) -> usize {
        self.visits.iter().filter(|v| v.tool_change.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.visits.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Z height (mm) for all lateral travel.
    pub safe_z: f64,
    /// Feed rate (mm/min) of the final descent.
    pub pick_feed_rate: f64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            safe_z: 50.0,
            pick_feed_rate: 1_000.0,
        }
    }
}

/// A screened object and the bin it goes to.
struct Candidate<'a> {
    id: ObjectId,
    target: MachinePosition,
    bin: Option<&'a BinConfig>,
}

pub struct VisitPlanner {
    limits: WorkspaceLimits,
    zones: Vec<KeepOutZone>,
    config: PlannerConfig,
    sorting: Option<SortingConfig>,
    channel: Option<EventChannel>,
}

impl VisitPlanner {
    pub fn new(limits: WorkspaceLimits, zones: Vec<KeepOutZone>, config: PlannerConfig) -> Self {
        Self {
            limits,
            zones,
            config,
            sorting: None,
            channel: None,
        }
    }

    /// Pick with tools and place into bins.  Every bin and tool change
    /// station must be inside the limits with a clear descent from safe
    /// height.  An empty bin list leaves sorting off.
    pub fn with_sorting(mut self, sorting: SortingConfig) -> Result<Self, PlannerError> {
        sorting.check_references().map_err(PlannerError::Sorting)?;
        for bin in &sorting.bins {
            self.check_station(format!("bin '{}'", bin.id), &bin.location)?;
        }
        for tool in &sorting.tools {
            if let Some(station) = &tool.change_location {
                self.check_station(format!("change station of tool '{}'", tool.id), station)?;
            }
        }
        self.sorting = sorting.is_enabled().then_some(sorting);
        Ok(self)
    }

    pub fn sorting(&self) -> Option<&SortingConfig> {
        self.sorting.as_ref()
    }

    pub fn with_channel(mut self, channel: EventChannel) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    /// Plan visits to the pending objects in `objects`, starting at `from`.
    pub fn plan(&self, objects: &[DetectedObject], from: &MachinePosition) -> Result<PickPlan, PlannerError> {
        let safe_z = self.config.safe_z;
        if !safe_z.is_finite() || safe_z < self.limits.min_z || safe_z > self.limits.max_z {
            return Err(PlannerError::SafeHeightOutOfLimits {
                safe_z,
                min: self.limits.min_z,
                max: self.limits.max_z,
            });
        }

        let mut plan = PickPlan::default();
        let mut groups: BTreeMap<Option<usize>, Vec<Candidate<'_>>> = BTreeMap::new();
        for obj in objects.iter().filter(|o| o.status == WorkStatus::Pending) {
            match self.screen(obj).and_then(|target| self.assign(obj, target)) {
                Ok((tool, candidate)) => groups.entry(tool).or_default().push(candidate),
                Err(reason) => plan.excluded.push(Exclusion {
                    object_id: obj.id,
                    reason,
                }),
            }
        }

        let mut here = *from;
        let mut mounted: Option<usize> = None;
        for (tool, mut candidates) in groups {
            let tool_config = tool.and_then(|i| self.sorting.as_ref().map(|s| &s.tools[i]));
            let before_change = (here, mounted);
            let mut tool_change = None;
            if let Some(t) = tool_config
                && mounted != tool
            {
                if let Some(station) = t.change_location {
                    if let Some(zone) = self.blocking_zone(&here.with_z(safe_z), &station.with_z(safe_z)) {
                        candidates.sort_by_key(|c| c.id);
                        plan.excluded.extend(candidates.drain(..).map(|c| Exclusion {
                            object_id: c.id,
                            reason: ExclusionReason::ToolChangeBlocked {
                                tool: t.id.clone(),
                                zone: zone.clone(),
                            },
                        }));
                        continue;
                    }
                    tool_change = Some(ToolChange {
                        tool_id: t.id.clone(),
                        location: station,
                        commands: self.travel(&here, &station),
                    });
                    here = station;
                }
                mounted = tool;
            }
            let changed = tool_change.is_some();

            let mut visited = 0;
            while !candidates.is_empty() {
                let hover_from = here.with_z(safe_z);
                let next = candidates
                    .iter()
                    .enumerate()
                    .filter(|(_, c)| self.route_blocked(&hover_from, c).is_none())
                    .min_by(|(_, a), (_, b)| {
                        here.planar_distance_to(&a.target)
                            .total_cmp(&here.planar_distance_to(&b.target))
                            .then_with(|| a.id.cmp(&b.id))
                    })
                    .map(|(i, _)| i);

                let Some(i) = next else {
                    // Nothing left in this group is reachable from here.
                    candidates.sort_by_key(|c| c.id);
                    for c in candidates.drain(..) {
                        let reason = self
                            .route_blocked(&hover_from, &c)
                            .unwrap_or(ExclusionReason::ApproachBlocked { zone: String::new() });
                        plan.excluded.push(Exclusion {
                            object_id: c.id,
                            reason,
                        });
                    }
                    break;
                };

                let c = candidates.remove(i);
                let pick = self.travel(&here, &c.target);
                let place = c.bin.map(|bin| Placement {
                    bin_id: bin.id.clone(),
                    location: bin.location,
                    commands: self.travel(&c.target, &bin.location),
                });
                here = place.as_ref().map_or(c.target, |p| p.location);
                plan.visits.push(Visit {
                    task_id: Uuid::new_v4(),
                    object_id: c.id,
                    target: c.target,
                    tool: tool_config.map(|t| t.id.clone()),
                    tool_change: tool_change.take(),
                    pick,
                    place,
                });
                visited += 1;
            }
            if changed && visited == 0 {
                // The station trip was for nothing; forget it.
                (here, mounted) = before_change;
            }
        }

        for v in &plan.visits {
            debug!(object_id = %v.object_id, target = %v.target, "visit planned");
        }
        for e in &plan.excluded {
            warn!(object_id = %e.object_id, reason = %e.reason, "object excluded from plan");
        }
        info!(visits = plan.visits.len(), excluded = plan.excluded.len(), "pick plan ready");

        if let Some(channel) = &self.channel {
            for v in &plan.visits {
                channel.publish(Event::new(
                    EVENT_SOURCE,
                    EventPayload::PickTaskCreated {
                        task_id: v.task_id,
                        object_id: v.object_id,
                        target: v.target,
                    },
                ));
            }
        }
        Ok(plan)
    }

    /// Reject objects that cannot be visited no matter the order.
    fn screen(&self, obj: &DetectedObject) -> Result<MachinePosition, ExclusionReason> {
        let target = obj.machine_coordinate.ok_or(ExclusionReason::MissingCoordinate)?;
        self.limits
            .check(&target)
            .map_err(|reason| ExclusionReason::OutOfLimits { reason })?;
        if let Some(zone) = self.zones.iter().find(|z| z.contains(&target)) {
            return Err(ExclusionReason::InsideKeepOut {
                zone: zone.name.clone(),
            });
        }
        let hover = target.with_z(self.config.safe_z);
        if let Some(zone) = self.zones.iter().find(|z| z.intersects_segment(&hover, &target)) {
            return Err(ExclusionReason::ApproachBlocked {
                zone: zone.name.clone(),
            });
        }
        Ok(target)
    }

    /// Tool group and bin for a screened object.
    fn assign<'a>(
        &'a self,
        obj: &DetectedObject,
        target: MachinePosition,
    ) -> Result<(Option<usize>, Candidate<'a>), ExclusionReason> {
        let Some(sorting) = &self.sorting else {
            return Ok((
                None,
                Candidate {
                    id: obj.id,
                    target,
                    bin: None,
                },
            ));
        };
        let tool = match sorting.select_tool(obj) {
            ToolChoice::Mounted => None,
            ToolChoice::Tool(i) => Some(i),
            ToolChoice::NoneFits => {
                return Err(ExclusionReason::NoMatchingTool {
                    classification: obj.classification.clone(),
                });
            }
        };
        let bin = sorting.select_bin(obj).ok_or_else(|| ExclusionReason::NoMatchingBin {
            classification: obj.classification.clone(),
            size: obj.size_class.as_str().to_string(),
        })?;
        Ok((
            tool,
            Candidate {
                id: obj.id,
                target,
                bin: Some(bin),
            },
        ))
    }

    /// Why `c` cannot be visited from `hover_from`, if it cannot.
    fn route_blocked(&self, hover_from: &MachinePosition, c: &Candidate<'_>) -> Option<ExclusionReason> {
        let safe_z = self.config.safe_z;
        let hover = c.target.with_z(safe_z);
        if let Some(zone) = self.blocking_zone(hover_from, &hover) {
            return Some(ExclusionReason::ApproachBlocked { zone });
        }
        let bin = c.bin?;
        self.blocking_zone(&hover, &bin.location.with_z(safe_z))
            .map(|zone| ExclusionReason::PlaceBlocked {
                bin: bin.id.clone(),
                zone,
            })
    }

    fn check_station(&self, station: String, location: &MachinePosition) -> Result<(), PlannerError> {
        let unreachable = |reason: String| PlannerError::StationUnreachable {
            station: station.clone(),
            location: *location,
            reason,
        };
        self.limits
            .check(location)
            .map_err(|reason| unreachable(reason.to_string()))?;
        if let Some(zone) = self.zones.iter().find(|z| z.contains(location)) {
            return Err(unreachable(format!("inside keep-out zone '{}'", zone.name)));
        }
        if let Some(zone) = self.blocking_zone(&location.with_z(self.config.safe_z), location) {
            return Err(unreachable(format!("descent blocked by zone '{zone}'")));
        }
        Ok(())
    }

    fn blocking_zone(&self, from: &MachinePosition, to: &MachinePosition) -> Option<String> {
        self.zones
            .iter()
            .find(|z| z.intersects_segment(from, to))
            .map(|z| z.name.clone())
    }

    /// Rise at `here`, cross at safe height, descend onto `target`.
    fn travel(&self, here: &MachinePosition, target: &MachinePosition) -> [MotionCommand; 3] {
        let safe_z = self.config.safe_z;
        [
            MotionCommand::rapid(here.with_z(safe_z), CommandOrigin::Planner),
            MotionCommand::rapid(target.with_z(safe_z), CommandOrigin::Planner),
            MotionCommand::linear(*target, self.config.pick_feed_rate, CommandOrigin::Planner),
        ]
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Execution
// ─────────────────────────────────────────────────────────────────────────────

pub struct PickExecutor;

impl PickExecutor {
    /// Execute `plan` visit by visit.
    ///
    /// Each object goes `processing` before its first command (the tool
    /// change, when there is one) and `completed` after its last (the
    /// place, when there is one).  On the first failed or rejected command,
    /// or on cancellation, the current object is marked `failed` and the
    /// error returned; the machine stays at its last-known position.
    ///
    /// Returns the ids of the completed objects.
    pub fn run(
        gate: &mut MotionGate,
        plan: &PickPlan,
        store: &dyn DetectionStore,
        cancel: &CancelToken,
    ) -> Result<Vec<ObjectId>, SorterError> {
        let mut done = Vec::with_capacity(plan.visits.len());
        for visit in &plan.visits {
            cancel.check()?;
            store.update_status(visit.object_id, WorkStatus::Processing)?;
            if let Some(change) = &visit.tool_change {
                info!(tool = %change.tool_id, station = %change.location, "changing tool");
            }
            match gate.submit_all(visit.commands().copied(), cancel) {
                Ok(_) => {
                    store.update_status(visit.object_id, WorkStatus::Completed)?;
                    info!(
                        object_id = %visit.object_id,
                        target = %visit.target,
                        bin = visit.place.as_ref().map(|p| p.bin_id.as_str()),
                        "object visited"
                    );
                    done.push(visit.object_id);
                }
                Err(e) => {
                    warn!(object_id = %visit.object_id, error = %e, "visit failed");
                    store.update_status(visit.object_id, WorkStatus::Failed)?;
                    return Err(e);
                }
            }
        }
        Ok(done)
    }
}
