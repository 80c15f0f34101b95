//! [`MotionValidator`] – hard boundary checks for every motion command.
//!
//! A command is checked in a fixed order and the first failure wins:
//!
//! 1. **Workspace limits** – every target axis must be finite and inside the
//!    inclusive [`WorkspaceLimits`].
//! 2. **Keep-out zones** – the target may not lie inside a zone, and the
//!    straight path from the current position may not cross one (both tests
//!    honour each zone's Z range).
//! 3. **Feed rate** – when the command carries one, it must be within the
//!    machine's [`FeedRateLimits`].
//! 4. **Extra rules** – any [`MotionRule`]s added with
//!    [`MotionValidator::add_rule`], in insertion order.
//!
//! Rejections are counted, logged and, when a channel is attached, published
//! as `BoundaryViolationDetected`.
//!
//! # Example
//!
//! ```
//! use cncsort_kernel::{MotionValidator, SafetyEnvelope, Verdict};
//! use cncsort_types::{CommandOrigin, MachinePosition, MotionCommand, WorkspaceLimits};
//!
//! let envelope = SafetyEnvelope::new(WorkspaceLimits::new(800.0, 400.0, 100.0)).unwrap();
//! let validator = MotionValidator::new(envelope);
//! let home = MachinePosition::origin();
//!
//! let ok = MotionCommand::rapid(MachinePosition::new(10.0, 10.0, 50.0), CommandOrigin::Operator);
//! assert!(matches!(validator.validate(ok, &home), Verdict::Accepted(_)));
//!
//! let off_bed = MotionCommand::rapid(MachinePosition::new(850.0, 10.0, 0.0), CommandOrigin::Operator);
//! assert!(matches!(validator.validate(off_bed, &home), Verdict::Rejected(_)));
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use cncsort_middleware::EventChannel;
use cncsort_types::{
    Event, EventPayload, FeedRateLimits, KeepOutZone, MachinePosition, MotionCommand,
    SorterError, ViolationReason, WorkspaceLimits,
};
use tracing::{debug, warn};

use crate::controller::ValidatedCommand;

const EVENT_SOURCE: &str = "cncsort-kernel::validator";

// ────────────────────────────────────────────────────────────────────────────
// SafetyEnvelope
// ────────────────────────────────────────────────────────────────────────────

/// Static safety configuration: limits, zones and feed bounds.
///
/// Loaded once at startup; changing it means building a new validator.
/// Every constructor checks its input, so an envelope that exists is one a
/// [`ValidatedCommand`] can be trusted against: finite ordered limits,
/// closed zones with a real Z range, and a positive feed window.
#[derive(Debug, Clone, PartialEq)]
pub struct SafetyEnvelope {
    limits: WorkspaceLimits,
    zones: Vec<KeepOutZone>,
    feed: FeedRateLimits,
}

impl SafetyEnvelope {
    /// Envelope with the given limits, no zones and default feed bounds.
    pub fn new(limits: WorkspaceLimits) -> Result<Self, SorterError> {
        let axes = [
            ("x", limits.min_x, limits.max_x),
            ("y", limits.min_y, limits.max_y),
            ("z", limits.min_z, limits.max_z),
        ];
        for (axis, min, max) in axes {
            if !min.is_finite() || !max.is_finite() || min >= max {
                return Err(SorterError::Config(format!(
                    "workspace {axis} range [{min}, {max}] must be finite with min < max"
                )));
            }
        }
        Ok(Self {
            limits,
            zones: Vec::new(),
            feed: FeedRateLimits::default(),
        })
    }

    pub fn with_zones(mut self, zones: Vec<KeepOutZone>) -> Result<Self, SorterError> {
        for zone in &zones {
            let bad = |why: &str| SorterError::Config(format!("keep-out zone '{}': {why}", zone.name));
            if zone.name.trim().is_empty() {
                return Err(bad("name is empty"));
            }
            if zone.footprint.len() < 3 {
                return Err(bad("footprint needs at least 3 vertices"));
            }
            if zone.footprint.iter().flatten().any(|c| !c.is_finite()) {
                return Err(bad("footprint has a non-finite vertex"));
            }
            if !zone.z_min.is_finite() || !zone.z_max.is_finite() || zone.z_min > zone.z_max {
                return Err(bad("z range must be finite with z_min <= z_max"));
            }
        }
        self.zones = zones;
        Ok(self)
    }

    pub fn with_feed(mut self, feed: FeedRateLimits) -> Result<Self, SorterError> {
        if !feed.min.is_finite() || !feed.max.is_finite() || feed.min <= 0.0 || feed.min > feed.max {
            return Err(SorterError::Config(format!(
                "feed window [{}, {}] must be positive with min <= max",
                feed.min, feed.max
            )));
        }
        self.feed = feed;
        Ok(self)
    }

    pub fn limits(&self) -> &WorkspaceLimits {
        &self.limits
    }

    pub fn zones(&self) -> &[KeepOutZone] {
        &self.zones
    }

    pub fn feed(&self) -> &FeedRateLimits {
        &self.feed
    }

    /// Built-in checks 1–3.  Pure: no counters, no events.
    pub fn evaluate(
        &self,
        command: &MotionCommand,
        from: &MachinePosition,
    ) -> Result<(), ViolationReason> {
        let target = &command.target;
        self.limits.check(target)?;

        if let Some(zone) = self.zones.iter().find(|z| z.contains(target)) {
            return Err(ViolationReason::KeepOutTarget {
                zone: zone.name.clone(),
            });
        }
        if from.is_finite()
            && let Some(zone) = self.zones.iter().find(|z| z.intersects_segment(from, target))
        {
            return Err(ViolationReason::KeepOutPath {
                zone: zone.name.clone(),
            });
        }

        if let Some(feed) = command.feed_rate {
            self.feed.check(feed)?;
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Extra rules
// ────────────────────────────────────────────────────────────────────────────

/// An additional invariant checked after the built-in envelope.
pub trait MotionRule: Send + Sync {
    fn name(&self) -> &str;

    fn check(&self, command: &MotionCommand, from: &MachinePosition) -> Result<(), String>;
}

// ────────────────────────────────────────────────────────────────────────────
// MotionValidator
// ────────────────────────────────────────────────────────────────────────────

/// Result of [`MotionValidator::validate`].
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Accepted(ValidatedCommand),
    Rejected(ViolationReason),
}

impl Verdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Verdict::Accepted(_))
    }
}

/// Running counters since construction (or the last reset).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidationStats {
    pub validations_performed: u64,
    pub violations_detected: u64,
    /// `violations_detected / validations_performed`, `0.0` before any
    /// validation.
    pub violation_rate: f64,
}

pub struct MotionValidator {
    envelope: SafetyEnvelope,
    rules: Vec<Box<dyn MotionRule>>,
    channel: Option<EventChannel>,
    performed: AtomicU64,
    violations: AtomicU64,
}

impl MotionValidator {
    pub fn new(envelope: SafetyEnvelope) -> Self {
        Self {
            envelope,
            rules: Vec::new(),
            channel: None,
            performed: AtomicU64::new(0),
            violations: AtomicU64::new(0),
        }
    }

    /// Publish `BoundaryViolationDetected` on `channel` for every rejection.
    pub fn with_channel(mut self, channel: EventChannel) -> Self {
        self.channel = Some(channel);
        self
    }

    /// Register a [`MotionRule`].  Rules run after the built-in checks, in
    /// insertion order.
    pub fn add_rule(&mut self, rule: Box<dyn MotionRule>) {
        self.rules.push(rule);
    }

    pub fn envelope(&self) -> &SafetyEnvelope {
        &self.envelope
    }

    /// Check `command` as if the machine were at `from`.
    pub fn validate(&self, command: MotionCommand, from: &MachinePosition) -> Verdict {
        self.performed.fetch_add(1, Ordering::Relaxed);

        match self.check(&command, from) {
            Ok(()) => {
                debug!(target_pos = %command.target, kind = ?command.kind, "motion command accepted");
                Verdict::Accepted(ValidatedCommand::new(command, *from))
            }
            Err(reason) => {
                self.violations.fetch_add(1, Ordering::Relaxed);
                warn!(
                    target_pos = %command.target,
                    origin = ?command.origin,
                    boundary = reason.boundary_type(),
                    %reason,
                    "motion command rejected"
                );
                if let Some(channel) = &self.channel {
                    channel.publish(Event::new(
                        EVENT_SOURCE,
                        EventPayload::BoundaryViolationDetected {
                            command,
                            reason: reason.clone(),
                        },
                    ));
                }
                Verdict::Rejected(reason)
            }
        }
    }

    pub fn validation_stats(&self) -> ValidationStats {
        let performed = self.performed.load(Ordering::Relaxed);
        let violations = self.violations.load(Ordering::Relaxed);
        ValidationStats {
            validations_performed: performed,
            violations_detected: violations,
            violation_rate: if performed == 0 {
                0.0
            } else {
                violations as f64 / performed as f64
            },
        }
    }

    pub fn reset_stats(&self) {
        self.performed.store(0, Ordering::Relaxed);
        self.violations.store(0, Ordering::Relaxed);
    }

    fn check(&self, command: &MotionCommand, from: &MachinePosition) -> Result<(), ViolationReason> {
        self.envelope.evaluate(command, from)?;
        for rule in &self.rules {
            rule.check(command, from).map_err(|details| ViolationReason::Rule {
                rule: rule.name().to_string(),
                details,
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cncsort_types::{Axis, CommandOrigin, EventKind};
    use std::sync::{Arc, Mutex};

    fn envelope() -> SafetyEnvelope {
        SafetyEnvelope::new(WorkspaceLimits::new(800.0, 400.0, 100.0))
            .unwrap()
            .with_zones(vec![KeepOutZone::rect(
                "clamp",
                (100.0, 100.0),
                (200.0, 200.0),
                0.0,
                40.0,
            )])
            .unwrap()
            .with_feed(FeedRateLimits { min: 10.0, max: 3000.0 })
            .unwrap()
    }

    fn at(x: f64, y: f64, z: f64) -> MachinePosition {
        MachinePosition::new(x, y, z)
    }

    fn rapid(x: f64, y: f64, z: f64) -> MotionCommand {
        MotionCommand::rapid(at(x, y, z), CommandOrigin::Operator)
    }

    #[test]
    fn accepts_command_inside_envelope() {
        let v = MotionValidator::new(envelope());
        match v.validate(rapid(400.0, 300.0, 50.0), &at(0.0, 0.0, 50.0)) {
            Verdict::Accepted(cmd) => {
                assert_eq!(cmd.target(), at(400.0, 300.0, 50.0));
                assert_eq!(cmd.from(), at(0.0, 0.0, 50.0));
            }
            Verdict::Rejected(r) => panic!("unexpected rejection: {r}"),
        }
    }

    #[test]
    fn boundary_values_are_accepted() {
        let v = MotionValidator::new(envelope());
        assert!(v.validate(rapid(800.0, 400.0, 100.0), &at(800.0, 400.0, 50.0)).is_accepted());
        assert!(v.validate(rapid(0.0, 0.0, 0.0), &at(0.0, 0.0, 50.0)).is_accepted());
    }

    #[test]
    fn rejects_out_of_limits_and_publishes_violation() {
        let channel = EventChannel::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        channel.subscribe(EventKind::BoundaryViolationDetected, move |e| {
            s.lock().unwrap().push(e.clone());
            Ok(())
        });

        let v = MotionValidator::new(envelope()).with_channel(channel);
        let verdict = v.validate(rapid(850.0, 10.0, 0.0), &at(0.0, 0.0, 50.0));
        assert!(matches!(
            verdict,
            Verdict::Rejected(ViolationReason::OutOfBounds { axis: Axis::X, .. })
        ));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        match &seen[0].payload {
            EventPayload::BoundaryViolationDetected { command, reason } => {
                assert_eq!(command.target.x, 850.0);
                assert_eq!(reason.boundary_type(), "workspace");
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn rejects_non_finite_target() {
        let v = MotionValidator::new(envelope());
        assert!(!v.validate(rapid(f64::NAN, 10.0, 10.0), &at(0.0, 0.0, 50.0)).is_accepted());
        assert!(!v.validate(rapid(10.0, f64::INFINITY, 10.0), &at(0.0, 0.0, 50.0)).is_accepted());
    }

    #[test]
    fn rejects_target_inside_keep_out() {
        let v = MotionValidator::new(envelope());
        let verdict = v.validate(rapid(150.0, 150.0, 10.0), &at(150.0, 150.0, 60.0));
        assert_eq!(
            verdict,
            Verdict::Rejected(ViolationReason::KeepOutTarget { zone: "clamp".into() })
        );
    }

    #[test]
    fn accepts_target_above_keep_out() {
        let v = MotionValidator::new(envelope());
        assert!(v.validate(rapid(150.0, 150.0, 50.0), &at(0.0, 0.0, 50.0)).is_accepted());
    }

    #[test]
    fn rejects_path_through_keep_out() {
        let v = MotionValidator::new(envelope());
        let verdict = v.validate(rapid(300.0, 150.0, 10.0), &at(50.0, 150.0, 10.0));
        assert_eq!(
            verdict,
            Verdict::Rejected(ViolationReason::KeepOutPath { zone: "clamp".into() })
        );
    }

    #[test]
    fn feed_rate_checked_after_geometry() {
        let v = MotionValidator::new(envelope());
        let too_fast = MotionCommand::linear(at(300.0, 300.0, 10.0), 9000.0, CommandOrigin::Planner);
        assert!(matches!(
            v.validate(too_fast, &at(300.0, 300.0, 50.0)),
            Verdict::Rejected(ViolationReason::FeedRate { .. })
        ));

        // Out of bounds and too fast: the limits violation is reported.
        let both = MotionCommand::linear(at(900.0, 300.0, 10.0), 9000.0, CommandOrigin::Planner);
        assert!(matches!(
            v.validate(both, &at(300.0, 300.0, 50.0)),
            Verdict::Rejected(ViolationReason::OutOfBounds { .. })
        ));
    }

    struct NoProbeAboveZ(f64);

    impl MotionRule for NoProbeAboveZ {
        fn name(&self) -> &str {
            "probe_height"
        }

        fn check(&self, command: &MotionCommand, _from: &MachinePosition) -> Result<(), String> {
            if command.kind == cncsort_types::MotionKind::Probe && command.target.z > self.0 {
                return Err(format!("probe target z {} above {}", command.target.z, self.0));
            }
            Ok(())
        }
    }

    #[test]
    fn extra_rules_run_after_builtins() {
        let mut v = MotionValidator::new(envelope());
        v.add_rule(Box::new(NoProbeAboveZ(20.0)));

        let probe = MotionCommand::probe(at(300.0, 300.0, 30.0), 100.0, CommandOrigin::Operator);
        match v.validate(probe, &at(300.0, 300.0, 50.0)) {
            Verdict::Rejected(ViolationReason::Rule { rule, .. }) => assert_eq!(rule, "probe_height"),
            other => panic!("unexpected verdict {other:?}"),
        }
    }

    #[test]
    fn stats_track_rate() {
        let v = MotionValidator::new(envelope());
        let from = at(0.0, 0.0, 50.0);
        v.validate(rapid(10.0, 10.0, 50.0), &from);
        v.validate(rapid(10.0, 10.0, 50.0), &from);
        v.validate(rapid(10.0, 10.0, 50.0), &from);
        v.validate(rapid(-1.0, 10.0, 50.0), &from);

        let stats = v.validation_stats();
        assert_eq!(stats.validations_performed, 4);
        assert_eq!(stats.violations_detected, 1);
        assert!((stats.violation_rate - 0.25).abs() < 1e-12);

        v.reset_stats();
        assert_eq!(v.validation_stats().violation_rate, 0.0);
    }

    #[test]
    fn envelope_rejects_unbounded_limits() {
        let open = WorkspaceLimits::new(f64::INFINITY, 400.0, 100.0);
        assert!(matches!(SafetyEnvelope::new(open), Err(SorterError::Config(_))));

        let nan = WorkspaceLimits::new(800.0, f64::NAN, 100.0);
        assert!(SafetyEnvelope::new(nan).is_err());

        let inverted = WorkspaceLimits {
            min_z: 100.0,
            ..WorkspaceLimits::new(800.0, 400.0, 50.0)
        };
        let err = SafetyEnvelope::new(inverted).unwrap_err();
        assert!(err.to_string().contains("workspace z range"));
    }

    #[test]
    fn envelope_rejects_degenerate_zones() {
        let base = || SafetyEnvelope::new(WorkspaceLimits::new(800.0, 400.0, 100.0)).unwrap();

        let sliver = KeepOutZone {
            name: "sliver".into(),
            footprint: vec![[0.0, 0.0], [10.0, 10.0]],
            z_min: 0.0,
            z_max: 10.0,
        };
        assert!(base().with_zones(vec![sliver]).is_err());

        let upside_down = KeepOutZone::rect("clamp", (0.0, 0.0), (10.0, 10.0), 40.0, 0.0);
        assert!(base().with_zones(vec![upside_down]).is_err());

        let infinite = KeepOutZone::rect("clamp", (0.0, 0.0), (f64::INFINITY, 10.0), 0.0, 40.0);
        assert!(base().with_zones(vec![infinite]).is_err());

        let unnamed = KeepOutZone::rect(" ", (0.0, 0.0), (10.0, 10.0), 0.0, 40.0);
        assert!(base().with_zones(vec![unnamed]).is_err());
    }

    #[test]
    fn envelope_rejects_open_feed_window() {
        let base = || SafetyEnvelope::new(WorkspaceLimits::new(800.0, 400.0, 100.0)).unwrap();
        assert!(base().with_feed(FeedRateLimits { min: 0.0, max: 3000.0 }).is_err());
        assert!(base().with_feed(FeedRateLimits { min: 10.0, max: f64::INFINITY }).is_err());
        assert!(base().with_feed(FeedRateLimits { min: 500.0, max: 100.0 }).is_err());
        assert_eq!(
            base().with_feed(FeedRateLimits { min: 10.0, max: 3000.0 }).unwrap().feed().max,
            3000.0
        );
    }
}
