//! Automatic grid scan: visit a serpentine grid of capture points at safe
//! height, capture at each, then stitch.
//!
//! A capture is only taken once the reported position is within
//! [`Arrival::tolerance_mm`] of the grid point and the head has dwelt for
//! [`Arrival::dwell`].  A head that never arrives aborts the session.

use std::thread;
use std::time::{Duration, Instant};

use cncsort_kernel::MotionGate;
use cncsort_types::{CancelToken, CommandOrigin, MachinePosition, MotionCommand, SorterError, WorkspaceLimits};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::bed_mapping::{BedMappingOrchestrator, MapSummary};

/// Rectangle of tool-head positions the scan covers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScanArea {
    pub x_min: f64,
    pub x_max: f64,
    pub y_min: f64,
    pub y_max: f64,
}

impl ScanArea {
    pub fn from_limits(limits: &WorkspaceLimits) -> Self {
        Self {
            x_min: limits.min_x,
            x_max: limits.max_x,
            y_min: limits.min_y,
            y_max: limits.max_y,
        }
    }
}

/// Arrival check before each capture.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Arrival {
    /// Straight-line distance from the grid point that counts as arrived.
    pub tolerance_mm: f64,
    pub poll_interval: Duration,
    pub timeout: Duration,
    /// Pause after arrival for the gantry to stop ringing.
    pub dwell: Duration,
}

impl Default for Arrival {
    fn default() -> Self {
        Self {
            tolerance_mm: 1.0,
            poll_interval: Duration::from_millis(100),
            timeout: Duration::from_secs(30),
            dwell: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScanPlan {
    safe_z: f64,
    points: Vec<MachinePosition>,
    arrival: Arrival,
}

impl ScanPlan {
    /// `grid_x` × `grid_y` points spanning `area` edge to edge, row by row
    /// along Y, with every other row reversed so consecutive points are
    /// adjacent.  A grid dimension of 1 places that axis at its minimum.
    pub fn grid(area: ScanArea, grid_x: usize, grid_y: usize, safe_z: f64) -> Result<Self, SorterError> {
        if grid_x == 0 || grid_y == 0 {
            return Err(SorterError::Config(format!(
                "scan grid must be at least 1x1, got {grid_x}x{grid_y}"
            )));
        }
        let step = |min: f64, max: f64, n: usize| if n > 1 { (max - min) / (n - 1) as f64 } else { 0.0 };
        let x_step = step(area.x_min, area.x_max, grid_x);
        let y_step = step(area.y_min, area.y_max, grid_y);

        let mut points = Vec::with_capacity(grid_x * grid_y);
        for row in 0..grid_y {
            let y = area.y_min + row as f64 * y_step;
            for col in 0..grid_x {
                let xi = if row % 2 == 1 { grid_x - 1 - col } else { col };
                points.push(MachinePosition::new(area.x_min + xi as f64 * x_step, y, safe_z));
            }
        }
        Ok(Self {
            safe_z,
            points,
            arrival: Arrival::default(),
        })
    }

    pub fn with_arrival(mut self, arrival: Arrival) -> Self {
        self.arrival = arrival;
        self
    }

    pub fn arrival(&self) -> &Arrival {
        &self.arrival
    }

    pub fn points(&self) -> &[MachinePosition] {
        &self.points
    }

    pub fn safe_z(&self) -> f64 {
        self.safe_z
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Run a whole mapping session over `plan`.
///
/// Rises to safe height first when below it, then moves to each point
/// through the gate, waits for arrival and captures there.  A rejected or
/// failed move, or one that never arrives, aborts the session; capture and
/// stitch failures abort it inside the orchestrator.
pub fn run_scan(
    orchestrator: &mut BedMappingOrchestrator,
    gate: &mut MotionGate,
    plan: &ScanPlan,
) -> Result<MapSummary, SorterError> {
    let map_id = orchestrator.start_session()?;
    let cancel = orchestrator.cancel_token();
    info!(map_id = %map_id, points = plan.len(), "grid scan started");

    if let Err(e) = rise_to_safe_height(gate, &cancel, plan) {
        return Err(abort_scan(orchestrator, e));
    }

    for (i, point) in plan.points().iter().enumerate() {
        let step = cancel
            .check()
            .and_then(|()| gate.submit(MotionCommand::rapid(*point, CommandOrigin::Scanner)))
            .and_then(|_| wait_for_arrival(gate, point, plan.arrival(), &cancel));
        if let Err(e) = step {
            warn!(map_id = %map_id, point = i + 1, error = %e, "scan move failed");
            return Err(abort_scan(orchestrator, e));
        }
        orchestrator.capture(gate)?;
    }
    orchestrator.finish()
}

fn rise_to_safe_height(gate: &mut MotionGate, cancel: &CancelToken, plan: &ScanPlan) -> Result<(), SorterError> {
    let here = gate.position()?;
    if here.z < plan.safe_z() {
        cancel.check()?;
        let top = here.with_z(plan.safe_z());
        gate.submit(MotionCommand::rapid(top, CommandOrigin::Scanner))?;
        wait_for_arrival(gate, &top, plan.arrival(), cancel)?;
    }
    Ok(())
}

fn wait_for_arrival(
    gate: &mut MotionGate,
    target: &MachinePosition,
    arrival: &Arrival,
    cancel: &CancelToken,
) -> Result<(), SorterError> {
    let deadline = Instant::now() + arrival.timeout;
    loop {
        cancel.check()?;
        let here = gate.position()?;
        if here.distance_to(target) <= arrival.tolerance_mm {
            break;
        }
        if Instant::now() >= deadline {
            return Err(SorterError::collaborator(
                "scan",
                format!(
                    "head did not reach {target} within {} ms (last at {here})",
                    arrival.timeout.as_millis()
                ),
            ));
        }
        thread::sleep(arrival.poll_interval);
    }
    if !arrival.dwell.is_zero() {
        thread::sleep(arrival.dwell);
    }
    Ok(())
}

fn abort_scan(orchestrator: &mut BedMappingOrchestrator, e: SorterError) -> SorterError {
    // Already aborted if the orchestrator saw the failure itself.
    let _ = orchestrator.abort(&e.to_string());
    e
}
