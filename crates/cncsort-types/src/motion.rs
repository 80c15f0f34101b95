//! Motion values and the safety envelope they are checked against:
//! [`MotionCommand`], [`WorkspaceLimits`], [`KeepOutZone`] and
//! [`FeedRateLimits`], plus the [`ViolationReason`] reported on rejection.

use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::entities::MachinePosition;

// ────────────────────────────────────────────────────────────────────────────
// Commands
// ────────────────────────────────────────────────────────────────────────────

/// How the machine travels to a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum MotionKind {
    /// Positioning move at maximum machine speed (G0).
    Rapid,
    /// Controlled-feed move (G1).
    Linear,
    /// Probing move that stops on contact (G38.2).
    Probe,
}

/// Which component produced a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum CommandOrigin {
    Operator,
    Scanner,
    Planner,
}

/// A requested machine movement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct MotionCommand {
    pub target: MachinePosition,
    /// Feed rate in mm/min.  `None` lets the controller use its default.
    pub feed_rate: Option<f64>,
    pub kind: MotionKind,
    pub origin: CommandOrigin,
}

impl MotionCommand {
    pub fn rapid(target: MachinePosition, origin: CommandOrigin) -> Self {
        Self {
            target,
            feed_rate: None,
            kind: MotionKind::Rapid,
            origin,
        }
    }

    pub fn linear(target: MachinePosition, feed_rate: f64, origin: CommandOrigin) -> Self {
        Self {
            target,
            feed_rate: Some(feed_rate),
            kind: MotionKind::Linear,
            origin,
        }
    }

    pub fn probe(target: MachinePosition, feed_rate: f64, origin: CommandOrigin) -> Self {
        Self {
            target,
            feed_rate: Some(feed_rate),
            kind: MotionKind::Probe,
            origin,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Workspace limits
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    X,
    Y,
    Z,
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Axis::X => f.write_str("X"),
            Axis::Y => f.write_str("Y"),
            Axis::Z => f.write_str("Z"),
        }
    }
}

/// Hard physical travel envelope.  Bounds are inclusive; minimums default
/// to zero when omitted from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct WorkspaceLimits {
    #[serde(default)]
    pub min_x: f64,
    pub max_x: f64,
    #[serde(default)]
    pub min_y: f64,
    pub max_y: f64,
    #[serde(default)]
    pub min_z: f64,
    pub max_z: f64,
}

impl WorkspaceLimits {
    /// Limits from the origin up to the given maxima.
    pub fn new(max_x: f64, max_y: f64, max_z: f64) -> Self {
        Self {
            min_x: 0.0,
            max_x,
            min_y: 0.0,
            max_y,
            min_z: 0.0,
            max_z,
        }
    }

    /// Check `p` against every axis in X, Y, Z order and report the first
    /// axis that is out of range (non-finite values are always out of range).
    pub fn check(&self, p: &MachinePosition) -> Result<(), ViolationReason> {
        let axes = [
            (Axis::X, p.x, self.min_x, self.max_x),
            (Axis::Y, p.y, self.min_y, self.max_y),
            (Axis::Z, p.z, self.min_z, self.max_z),
        ];
        for (axis, value, min, max) in axes {
            if !value.is_finite() || value < min || value > max {
                return Err(ViolationReason::OutOfBounds {
                    axis,
                    value,
                    min,
                    max,
                });
            }
        }
        Ok(())
    }

    pub fn contains(&self, p: &MachinePosition) -> bool {
        self.check(p).is_ok()
    }
}

impl Default for WorkspaceLimits {
    /// 800 × 400 × 300 mm bed.
    fn default() -> Self {
        Self::new(800.0, 400.0, 300.0)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Feed rate
// ────────────────────────────────────────────────────────────────────────────

/// Machine feed-rate capability, mm/min, inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FeedRateLimits {
    pub min: f64,
    pub max: f64,
}

impl FeedRateLimits {
    pub fn check(&self, feed_rate: f64) -> Result<(), ViolationReason> {
        if !feed_rate.is_finite() || feed_rate < self.min || feed_rate > self.max {
            return Err(ViolationReason::FeedRate {
                requested: feed_rate,
                min: self.min,
                max: self.max,
            });
        }
        Ok(())
    }
}

impl Default for FeedRateLimits {
    fn default() -> Self {
        Self {
            min: 1.0,
            max: 5_000.0,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Keep-out zones
// ────────────────────────────────────────────────────────────────────────────

/// A region the tool must never enter: an XY polygon footprint extruded over
/// a Z range.  The footprint is closed, so its boundary counts as inside.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct KeepOutZone {
    pub name: String,
    /// Ordered `[x, y]` vertices; the last connects back to the first.
    pub footprint: Vec<[f64; 2]>,
    pub z_min: f64,
    pub z_max: f64,
}

impl KeepOutZone {
    /// Axis-aligned box zone.
    pub fn rect(
        name: impl Into<String>,
        (x0, y0): (f64, f64),
        (x1, y1): (f64, f64),
        z_min: f64,
        z_max: f64,
    ) -> Self {
        let (lx, hx) = (x0.min(x1), x0.max(x1));
        let (ly, hy) = (y0.min(y1), y0.max(y1));
        Self {
            name: name.into(),
            footprint: vec![[lx, ly], [hx, ly], [hx, hy], [lx, hy]],
            z_min,
            z_max,
        }
    }

    /// `true` when `p` lies in the footprint and inside the Z range.
    pub fn contains(&self, p: &MachinePosition) -> bool {
        p.z >= self.z_min && p.z <= self.z_max && self.contains_xy(p.x, p.y)
    }

    /// Point-in-polygon on the footprint, boundary inclusive.
    pub fn contains_xy(&self, x: f64, y: f64) -> bool {
        let n = self.footprint.len();
        if n < 3 {
            return false;
        }
        let mut inside = false;
        for i in 0..n {
            let a = self.footprint[i];
            let b = self.footprint[(i + 1) % n];
            if on_segment(a, b, [x, y]) {
                return true;
            }
            // Even-odd crossing test.
            if (a[1] > y) != (b[1] > y) {
                let x_cross = a[0] + (y - a[1]) * (b[0] - a[0]) / (b[1] - a[1]);
                if x < x_cross {
                    inside = !inside;
                }
            }
        }
        inside
    }

    /// `true` when the straight segment `from → to` passes through the zone.
    ///
    /// The segment is first clipped to the part whose Z lies inside
    /// `[z_min, z_max]`; the clipped XY segment is then tested against the
    /// footprint.
    pub fn intersects_segment(&self, from: &MachinePosition, to: &MachinePosition) -> bool {
        let Some((t0, t1)) = self.z_window(from.z, to.z) else {
            return false;
        };
        let lerp = |t: f64| {
            [
                from.x + (to.x - from.x) * t,
                from.y + (to.y - from.y) * t,
            ]
        };
        let (a, b) = (lerp(t0), lerp(t1));
        if self.contains_xy(a[0], a[1]) || self.contains_xy(b[0], b[1]) {
            return true;
        }
        let n = self.footprint.len();
        if n < 3 {
            return false;
        }
        (0..n).any(|i| segments_intersect(a, b, self.footprint[i], self.footprint[(i + 1) % n]))
    }

    /// Parameter interval of a segment from `z0` to `z1` that lies inside
    /// the zone's Z range, or `None` if it never does.
    fn z_window(&self, z0: f64, z1: f64) -> Option<(f64, f64)> {
        if z0 == z1 {
            return (z0 >= self.z_min && z0 <= self.z_max).then_some((0.0, 1.0));
        }
        let ta = (self.z_min - z0) / (z1 - z0);
        let tb = (self.z_max - z0) / (z1 - z0);
        let lo = ta.min(tb).max(0.0);
        let hi = ta.max(tb).min(1.0);
        (lo <= hi).then_some((lo, hi))
    }
}

const EPS: f64 = 1e-9;

fn cross(o: [f64; 2], a: [f64; 2], b: [f64; 2]) -> f64 {
    (a[0] - o[0]) * (b[1] - o[1]) - (a[1] - o[1]) * (b[0] - o[0])
}

fn on_segment(a: [f64; 2], b: [f64; 2], p: [f64; 2]) -> bool {
    cross(a, b, p).abs() <= EPS
        && p[0] >= a[0].min(b[0]) - EPS
        && p[0] <= a[0].max(b[0]) + EPS
        && p[1] >= a[1].min(b[1]) - EPS
        && p[1] <= a[1].max(b[1]) + EPS
}

fn segments_intersect(p1: [f64; 2], p2: [f64; 2], q1: [f64; 2], q2: [f64; 2]) -> bool {
    let d1 = cross(q1, q2, p1);
    let d2 = cross(q1, q2, p2);
    let d3 = cross(p1, p2, q1);
    let d4 = cross(p1, p2, q2);
    if ((d1 > EPS && d2 < -EPS) || (d1 < -EPS && d2 > EPS))
        && ((d3 > EPS && d4 < -EPS) || (d3 < -EPS && d4 > EPS))
    {
        return true;
    }
    on_segment(q1, q2, p1) || on_segment(q1, q2, p2) || on_segment(p1, p2, q1) || on_segment(p1, p2, q2)
}

// ────────────────────────────────────────────────────────────────────────────
// ViolationReason
// ────────────────────────────────────────────────────────────────────────────

/// Why a [`MotionCommand`] was rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ViolationReason {
    /// Target coordinate outside the workspace limits.
    OutOfBounds { axis: Axis, value: f64, min: f64, max: f64 },
    /// Target inside a keep-out zone.
    KeepOutTarget { zone: String },
    /// Straight-line travel to the target crosses a keep-out zone.
    KeepOutPath { zone: String },
    /// Feed rate outside machine capability.
    FeedRate { requested: f64, min: f64, max: f64 },
    /// Rejected by an additional, custom rule.
    Rule { rule: String, details: String },
}

impl ViolationReason {
    /// Short category label: `"workspace"`, `"keep_out"`, `"feed_rate"` or
    /// `"rule"`.
    pub fn boundary_type(&self) -> &'static str {
        match self {
            ViolationReason::OutOfBounds { .. } => "workspace",
            ViolationReason::KeepOutTarget { .. } | ViolationReason::KeepOutPath { .. } => "keep_out",
            ViolationReason::FeedRate { .. } => "feed_rate",
            ViolationReason::Rule { .. } => "rule",
        }
    }
}

impl fmt::Display for ViolationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ViolationReason::OutOfBounds { axis, value, min, max } => {
                write!(f, "{axis} coordinate {value:.2}mm out of bounds [{min:.2}, {max:.2}]")
            }
            ViolationReason::KeepOutTarget { zone } => {
                write!(f, "target lies inside keep-out zone '{zone}'")
            }
            ViolationReason::KeepOutPath { zone } => {
                write!(f, "travel path crosses keep-out zone '{zone}'")
            }
            ViolationReason::FeedRate { requested, min, max } => {
                write!(f, "feed rate {requested:.1} mm/min outside [{min:.1}, {max:.1}]")
            }
            ViolationReason::Rule { rule, details } => write!(f, "rule '{rule}': {details}"),
        }
    }
}
