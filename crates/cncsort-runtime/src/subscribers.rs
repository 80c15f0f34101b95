//! Event-channel subscribers that wire the sorter together.
//!
//! | Subscriber | Listens to | Does |
//! |---|---|---|
//! | [`PersistenceSubscriber`] | `objects_detected` | saves every object to the [`DetectionStore`] |
//! | [`DisplaySubscriber`] | all kinds | keeps a [`DisplayState`] snapshot for the UI |
//! | [`AuditSubscriber`] | all kinds | logs every event through `tracing` |
//! | [`PlannerSubscriber`] | `position_updated`, `bed_map_completed` | plans (and optionally executes) visits for a finished map |
//!
//! `attach` registers the handlers and returns the subscriber behind an
//! `Arc` so its state can still be read.  Handler errors are isolated by the
//! channel and show up in [`EventChannel::failures`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, TryLockError};

use cncsort_kernel::MotionGate;
use cncsort_memory::DetectionStore;
use cncsort_middleware::EventChannel;
use cncsort_types::{
    CancelToken, Event, EventKind, EventPayload, MachinePosition, SorterError, ViolationReason,
};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::planner::{PickExecutor, PickPlan, VisitPlanner};

// ─────────────────────────────────────────────────────────────────────────────
// Persistence
// ─────────────────────────────────────────────────────────────────────────────

pub struct PersistenceSubscriber {
    store: Arc<dyn DetectionStore>,
    saved: AtomicUsize,
}

impl PersistenceSubscriber {
    pub fn new(store: Arc<dyn DetectionStore>) -> Self {
        Self {
            store,
            saved: AtomicUsize::new(0),
        }
    }

    pub fn attach(self, channel: &EventChannel) -> Arc<Self> {
        let this = Arc::new(self);
        let sub = this.clone();
        channel.subscribe(EventKind::ObjectsDetected, move |e| sub.on_event(e));
        this
    }

    /// Objects saved so far.
    pub fn saved(&self) -> usize {
        self.saved.load(Ordering::Relaxed)
    }

    fn on_event(&self, event: &Event) -> Result<(), SorterError> {
        let EventPayload::ObjectsDetected { objects, image_id, .. } = &event.payload else {
            return Ok(());
        };
        // Keep going after a failed save so one bad record does not cost the
        // rest of the frame.
        let mut failed = 0;
        for obj in objects {
            match self.store.save(obj) {
                Ok(()) => {
                    self.saved.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    warn!(object_id = %obj.id, image_id = %image_id, error = %e, "failed to save object");
                    failed += 1;
                }
            }
        }
        debug!(image_id = %image_id, saved = objects.len() - failed, "objects persisted");
        if failed > 0 {
            return Err(SorterError::Store(format!(
                "{failed} of {} objects from {image_id} not saved",
                objects.len()
            )));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Display
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletedMap {
    pub map_id: String,
    pub object_count: usize,
    pub image_count: usize,
}

/// What the operator display shows.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DisplayState {
    pub position: Option<MachinePosition>,
    pub captures: usize,
    pub objects_detected: usize,
    pub last_image_id: Option<String>,
    pub last_completed: Option<CompletedMap>,
    pub last_abort: Option<String>,
    pub violations: usize,
    pub last_violation: Option<ViolationReason>,
    pub pick_tasks: usize,
}

#[derive(Default)]
pub struct DisplaySubscriber {
    state: RwLock<DisplayState>,
}

impl DisplaySubscriber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(self, channel: &EventChannel) -> Arc<Self> {
        let this = Arc::new(self);
        for kind in EventKind::ALL {
            let sub = this.clone();
            channel.subscribe(kind, move |e| {
                sub.on_event(e);
                Ok(())
            });
        }
        this
    }

    pub fn snapshot(&self) -> DisplayState {
        self.state.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn on_event(&self, event: &Event) {
        let mut s = self.state.write().unwrap_or_else(PoisonError::into_inner);
        match &event.payload {
            EventPayload::ObjectsDetected { objects, image_id, .. } => {
                s.captures += 1;
                s.objects_detected += objects.len();
                s.last_image_id = Some(image_id.clone());
            }
            EventPayload::BedMapCompleted {
                map_id,
                object_count,
                image_count,
            } => {
                s.last_completed = Some(CompletedMap {
                    map_id: map_id.clone(),
                    object_count: *object_count,
                    image_count: *image_count,
                });
            }
            EventPayload::BedMapAborted { map_id, reason } => {
                s.last_abort = Some(format!("{map_id}: {reason}"));
            }
            EventPayload::PositionUpdated { position, .. } => s.position = Some(*position),
            EventPayload::BoundaryViolationDetected { reason, .. } => {
                s.violations += 1;
                s.last_violation = Some(reason.clone());
            }
            EventPayload::PickTaskCreated { .. } => s.pick_tasks += 1,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Audit
// ─────────────────────────────────────────────────────────────────────────────

/// Logs every event; violations at `warn`, everything else at `info`.
#[derive(Default)]
pub struct AuditSubscriber {
    seen: AtomicUsize,
}

impl AuditSubscriber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(self, channel: &EventChannel) -> Arc<Self> {
        let this = Arc::new(self);
        for kind in EventKind::ALL {
            let sub = this.clone();
            channel.subscribe(kind, move |e| {
                sub.on_event(e);
                Ok(())
            });
        }
        this
    }

    pub fn events_seen(&self) -> usize {
        self.seen.load(Ordering::Relaxed)
    }

    fn on_event(&self, event: &Event) {
        self.seen.fetch_add(1, Ordering::Relaxed);
        let kind = event.kind();
        match &event.payload {
            EventPayload::ObjectsDetected { objects, image_id, map_id } => {
                info!(target: "audit", %kind, source = %event.source, map_id = %map_id, image_id = %image_id, objects = objects.len());
            }
            EventPayload::BedMapCompleted {
                map_id,
                object_count,
                image_count,
            } => {
                info!(target: "audit", %kind, source = %event.source, map_id = %map_id, objects = object_count, images = image_count);
            }
            EventPayload::BedMapAborted { map_id, reason } => {
                warn!(target: "audit", %kind, source = %event.source, map_id = %map_id, reason = %reason);
            }
            EventPayload::PositionUpdated { position, previous } => {
                info!(target: "audit", %kind, source = %event.source, %position, %previous);
            }
            EventPayload::BoundaryViolationDetected { command, reason } => {
                warn!(
                    target: "audit",
                    %kind,
                    source = %event.source,
                    boundary = reason.boundary_type(),
                    attempted = %command.target,
                    %reason
                );
            }
            EventPayload::PickTaskCreated {
                task_id,
                object_id,
                target,
            } => {
                info!(target: "audit", %kind, source = %event.source, %task_id, %object_id, %target);
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Planner
// ─────────────────────────────────────────────────────────────────────────────

struct AutoExecute {
    gate: Arc<Mutex<MotionGate>>,
    cancel: CancelToken,
}

/// Plans a pick run whenever a bed map completes.
///
/// Pending objects of the completed map are read back from the store, so
/// the [`PersistenceSubscriber`] must be attached first.  Planning starts at
/// the last position seen in `position_updated`.  Re-publishing the same
/// `bed_map_completed` yields an equivalent plan as long as the store and
/// position have not changed.
pub struct PlannerSubscriber {
    planner: VisitPlanner,
    store: Arc<dyn DetectionStore>,
    position: Mutex<MachinePosition>,
    latest: Mutex<Option<PickPlan>>,
    plans: AtomicUsize,
    execute: Option<AutoExecute>,
}

impl PlannerSubscriber {
    pub fn new(planner: VisitPlanner, store: Arc<dyn DetectionStore>, start: MachinePosition) -> Self {
        Self {
            planner,
            store,
            position: Mutex::new(start),
            latest: Mutex::new(None),
            plans: AtomicUsize::new(0),
            execute: None,
        }
    }

    /// Run each new plan through `gate` straight away.
    ///
    /// Execution is skipped (the plan is still kept) when the gate is locked
    /// by whoever published the completion, e.g. a scan holding it.
    pub fn with_executor(mut self, gate: Arc<Mutex<MotionGate>>, cancel: CancelToken) -> Self {
        self.execute = Some(AutoExecute { gate, cancel });
        self
    }

    pub fn attach(self, channel: &EventChannel) -> Arc<Self> {
        let this = Arc::new(self);
        let sub = this.clone();
        channel.subscribe(EventKind::PositionUpdated, move |e| {
            if let EventPayload::PositionUpdated { position, .. } = &e.payload {
                *sub.position.lock().unwrap_or_else(PoisonError::into_inner) = *position;
            }
            Ok(())
        });
        let sub = this.clone();
        channel.subscribe(EventKind::BedMapCompleted, move |e| sub.on_completed(e));
        this
    }

    pub fn latest_plan(&self) -> Option<PickPlan> {
        self.latest.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Number of plans computed so far.
    pub fn plans_computed(&self) -> usize {
        self.plans.load(Ordering::Relaxed)
    }

    pub fn last_position(&self) -> MachinePosition {
        *self.position.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn on_completed(&self, event: &Event) -> Result<(), SorterError> {
        let EventPayload::BedMapCompleted { map_id, .. } = &event.payload else {
            return Ok(());
        };
        let objects = self.store.list_pending(Some(map_id))?;
        let from = self.last_position();
        let plan = self.planner.plan(&objects, &from)?;
        info!(map_id = %map_id, visits = plan.visits.len(), excluded = plan.excluded.len(), "plan computed for completed map");
        self.plans.fetch_add(1, Ordering::Relaxed);
        *self.latest.lock().unwrap_or_else(PoisonError::into_inner) = Some(plan.clone());

        let Some(exec) = &self.execute else {
            return Ok(());
        };
        let mut gate = match exec.gate.try_lock() {
            Ok(gate) => gate,
            Err(TryLockError::Poisoned(p)) => p.into_inner(),
            Err(TryLockError::WouldBlock) => {
                warn!(map_id = %map_id, "motion gate busy; plan kept for manual execution");
                return Ok(());
            }
        };
        let done = PickExecutor::run(&mut gate, &plan, self.store.as_ref(), &exec.cancel)?;
        info!(map_id = %map_id, completed = done.len(), "pick run finished");
        Ok(())
    }
}

/// Attach the standard persistence, display and audit subscribers.
pub fn attach_defaults(
    channel: &EventChannel,
    store: Arc<dyn DetectionStore>,
) -> (Arc<PersistenceSubscriber>, Arc<DisplaySubscriber>, Arc<AuditSubscriber>) {
    (
        PersistenceSubscriber::new(store).attach(channel),
        DisplaySubscriber::new().attach(channel),
        AuditSubscriber::new().attach(channel),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bed_mapping::BedMappingOrchestrator;
    use crate::coords::{CameraMount, PixelMapper};
    use crate::planner::PlannerConfig;
    use cncsort_hal::{MosaicStitcher, ScriptedBlob, ScriptedVision, SimHandle, SimulatedController};
    use cncsort_kernel::{MotionValidator, SafetyEnvelope};
    use cncsort_memory::{InMemoryDetectionStore, SqliteDetectionStore};
    use cncsort_types::{
        BoundingBox, CommandOrigin, DetectedObject, MotionCommand, PixelPoint, WorkStatus,
        WorkspaceLimits,
    };

    fn limits() -> WorkspaceLimits {
        WorkspaceLimits::new(800.0, 400.0, 100.0)
    }

    fn detected(objects: Vec<DetectedObject>) -> Event {
        Event::new(
            "test",
            EventPayload::ObjectsDetected {
                objects,
                image_id: "img_001".into(),
                map_id: "map_a".into(),
            },
        )
    }

    fn object() -> DetectedObject {
        let mut obj = DetectedObject::candidate(0, vec![], BoundingBox::default(), 900.0, PixelPoint::default());
        obj.bed_map_id = Some("map_a".into());
        obj.machine_coordinate = Some(MachinePosition::new(10.0, 10.0, 0.0));
        obj
    }

    #[test]
    fn persistence_saves_every_object() {
        let channel = EventChannel::new();
        let store = Arc::new(InMemoryDetectionStore::new());
        let sub = PersistenceSubscriber::new(store.clone()).attach(&channel);

        channel.publish(detected(vec![object(), object()]));
        assert_eq!(sub.saved(), 2);
        assert_eq!(store.list_pending(Some("map_a")).unwrap().len(), 2);
    }

    #[test]
    fn persisted_objects_survive_reopening_the_database() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("detections.db");
        let channel = EventChannel::new();
        let store = Arc::new(SqliteDetectionStore::open(&path).unwrap());
        PersistenceSubscriber::new(store.clone()).attach(&channel);

        let objects = vec![object(), object()];
        channel.publish(detected(objects.clone()));
        drop(channel);
        drop(store);

        let reopened = SqliteDetectionStore::open(&path).unwrap();
        assert_eq!(reopened.list_pending(Some("map_a")).unwrap(), objects);
    }

    #[test]
    fn persistence_failure_is_isolated_and_recorded() {
        let channel = EventChannel::new();
        let store = Arc::new(InMemoryDetectionStore::new());
        let display = DisplaySubscriber::new().attach(&channel);
        let sub = PersistenceSubscriber::new(store.clone()).attach(&channel);

        let mut done = object();
        store.save(&done).unwrap();
        store.update_status(done.id, WorkStatus::Completed).unwrap();
        // Same id coming back as pending would move the status backwards.
        done.status = WorkStatus::Pending;

        let report = channel.publish(detected(vec![done, object()]));
        assert_eq!(report.failed, 1);
        assert_eq!(sub.saved(), 1);
        assert_eq!(channel.failures().len(), 1);
        assert_eq!(display.snapshot().objects_detected, 2);
    }

    #[test]
    fn display_tracks_latest_state() {
        let channel = EventChannel::new();
        let display = DisplaySubscriber::new().attach(&channel);
        let audit = AuditSubscriber::new().attach(&channel);

        channel.publish(detected(vec![object()]));
        channel.publish(Event::new(
            "test",
            EventPayload::PositionUpdated {
                position: MachinePosition::new(1.0, 2.0, 3.0),
                previous: MachinePosition::origin(),
            },
        ));
        channel.publish(Event::new(
            "test",
            EventPayload::BoundaryViolationDetected {
                command: MotionCommand::rapid(MachinePosition::new(900.0, 0.0, 0.0), CommandOrigin::Operator),
                reason: ViolationReason::KeepOutTarget { zone: "clamp".into() },
            },
        ));
        channel.publish(Event::new(
            "test",
            EventPayload::BedMapAborted {
                map_id: "map_a".into(),
                reason: "operator".into(),
            },
        ));

        let s = display.snapshot();
        assert_eq!(s.captures, 1);
        assert_eq!(s.last_image_id.as_deref(), Some("img_001"));
        assert_eq!(s.position, Some(MachinePosition::new(1.0, 2.0, 3.0)));
        assert_eq!(s.violations, 1);
        assert_eq!(s.last_abort.as_deref(), Some("map_a: operator"));
        assert!(s.last_completed.is_none());
        assert_eq!(audit.events_seen(), 4);
    }

    struct Rig {
        channel: EventChannel,
        store: Arc<InMemoryDetectionStore>,
        gate: Arc<Mutex<MotionGate>>,
        sim: SimHandle,
        orchestrator: BedMappingOrchestrator,
    }

    fn rig() -> Rig {
        let channel = EventChannel::new();
        let store = Arc::new(InMemoryDetectionStore::new());
        let sim = SimulatedController::new(MachinePosition::new(0.0, 0.0, 50.0));
        let handle = sim.handle();
        let validator = MotionValidator::new(SafetyEnvelope::new(limits()).unwrap()).with_channel(channel.clone());
        let mut gate = MotionGate::new(validator, Box::new(sim)).with_channel(channel.clone());
        gate.connect().unwrap();
        let vision = ScriptedVision::new(64, 48)
            .then_detect(vec![ScriptedBlob::at(10.0, 10.0), ScriptedBlob::at(40.0, 30.0)])
            .cycling();
        let orchestrator = BedMappingOrchestrator::new(
            Box::new(vision),
            Box::new(MosaicStitcher),
            PixelMapper::new(CameraMount::default()),
            channel.clone(),
        );
        Rig {
            channel,
            store,
            gate: Arc::new(Mutex::new(gate)),
            sim: handle,
            orchestrator,
        }
    }

    /// Three captures at x = 200, 300, 400 (y = 150), two objects each.
    fn map_three(rig: &mut Rig) -> Event {
        let completed = Arc::new(Mutex::new(None));
        let sink = completed.clone();
        rig.channel.subscribe(EventKind::BedMapCompleted, move |e| {
            *sink.lock().unwrap() = Some(e.clone());
            Ok(())
        });

        rig.orchestrator.start_session().unwrap();
        for x in [200.0, 300.0, 400.0] {
            let mut gate = rig.gate.lock().unwrap();
            gate.submit(MotionCommand::rapid(MachinePosition::new(x, 150.0, 50.0), CommandOrigin::Scanner))
                .unwrap();
            rig.orchestrator.capture(&mut gate).unwrap();
        }
        rig.orchestrator.finish().unwrap();
        let event = completed.lock().unwrap().clone();
        event.unwrap()
    }

    fn planner_for(rig: &Rig) -> PlannerSubscriber {
        let planner = VisitPlanner::new(limits(), vec![], PlannerConfig::default()).with_channel(rig.channel.clone());
        PlannerSubscriber::new(planner, rig.store.clone(), MachinePosition::origin())
    }

    #[test]
    fn completed_map_is_planned_from_store() {
        let mut rig = rig();
        PersistenceSubscriber::new(rig.store.clone()).attach(&rig.channel);
        let display = DisplaySubscriber::new().attach(&rig.channel);
        let planner = planner_for(&rig).attach(&rig.channel);

        map_three(&mut rig);
        let plan = planner.latest_plan().unwrap();
        assert_eq!(plan.visits.len(), 6);
        assert!(plan.excluded.is_empty());
        assert_eq!(planner.last_position(), MachinePosition::new(400.0, 150.0, 50.0));
        assert_eq!(display.snapshot().pick_tasks, 6);
        assert_eq!(display.snapshot().last_completed.unwrap().object_count, 6);
        // Nothing executes without an executor.
        assert_eq!(rig.sim.sent_count(), 3);
    }

    #[test]
    fn republished_completion_replans_identically() {
        let mut rig = rig();
        PersistenceSubscriber::new(rig.store.clone()).attach(&rig.channel);
        let planner = planner_for(&rig).attach(&rig.channel);

        let event = map_three(&mut rig);
        let first = planner.latest_plan().unwrap();
        rig.channel.publish(event);
        let second = planner.latest_plan().unwrap();

        assert_eq!(planner.plans_computed(), 2);
        assert_eq!(first.order(), second.order());
        assert!(first.commands().eq(second.commands()));
    }

    #[test]
    fn executor_runs_plan_when_gate_is_free() {
        let mut rig = rig();
        PersistenceSubscriber::new(rig.store.clone()).attach(&rig.channel);
        let planner = planner_for(&rig)
            .with_executor(rig.gate.clone(), CancelToken::new())
            .attach(&rig.channel);

        map_three(&mut rig);
        assert_eq!(planner.plans_computed(), 1);
        assert_eq!(rig.sim.sent_count(), 3 + 18);
        assert!(rig.store.list_pending(None).unwrap().is_empty());
        assert!(rig.channel.failures().is_empty());
    }

    #[test]
    fn executor_skips_when_gate_is_held() {
        let mut rig = rig();
        PersistenceSubscriber::new(rig.store.clone()).attach(&rig.channel);
        let planner = planner_for(&rig)
            .with_executor(rig.gate.clone(), CancelToken::new())
            .attach(&rig.channel);

        let event = map_three(&mut rig);
        let sent = rig.sim.sent_count();
        let held = rig.gate.lock().unwrap();
        // Objects are completed now, so the replan is empty either way; what
        // matters is that the held gate is not waited on.
        rig.channel.publish(event);
        drop(held);
        assert_eq!(planner.plans_computed(), 2);
        assert_eq!(rig.sim.sent_count(), sent);
    }
}
