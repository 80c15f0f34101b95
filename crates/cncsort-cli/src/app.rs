//! Wiring of one sorter instance from a [`Config`], plus the operations the
//! REPL exposes.
//!
//! Every motion goes through the single [`MotionGate`].  The shared
//! [`CancelToken`] is the one the Ctrl-C handler sets; operations that move
//! the machine reset it before they start.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cncsort_hal::{MosaicStitcher, ScriptedVision, build_controller};
use cncsort_kernel::{MotionValidator, SafetyEnvelope, ValidationStats};
use cncsort_memory::{DetectionStore, InMemoryDetectionStore, MapArchive, SqliteDetectionStore};
use cncsort_middleware::EventChannel;
use cncsort_runtime::{
    AuditSubscriber, BedMappingOrchestrator, CaptureSummary, DisplayState, DisplaySubscriber,
    MapSummary, MotionGate, PersistenceSubscriber, PickExecutor, PickPlan, PixelMapper,
    PlannerSubscriber, ScanPlan, SessionState, VisitPlanner, attach_defaults, run_scan,
};
use cncsort_types::{
    CancelToken, CommandOrigin, MachinePosition, MotionCommand, ObjectId, SorterError,
};
use tracing::{info, warn};

use crate::config::Config;

/// Snapshot for `/status`.
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub controller: String,
    pub connected: bool,
    pub session: SessionState,
    pub map_id: Option<String>,
    pub captures: usize,
    pub pending_objects: usize,
    pub display: DisplayState,
    pub stats: ValidationStats,
    pub auto_plan_visits: Option<usize>,
    pub objects_saved: usize,
    pub events_seen: usize,
    pub last_archive: Option<PathBuf>,
}

pub struct App {
    config: Config,
    gate: MotionGate,
    orchestrator: BedMappingOrchestrator,
    planner: VisitPlanner,
    store: Arc<dyn DetectionStore>,
    archive: MapArchive,
    display: Arc<DisplaySubscriber>,
    persistence: Arc<PersistenceSubscriber>,
    audit: Arc<AuditSubscriber>,
    auto_planner: Arc<PlannerSubscriber>,
    cancel: CancelToken,
    last_archive: Option<PathBuf>,
}

impl App {
    /// Build every component from `config`.  Relative storage paths resolve
    /// against `base_dir`.  Does not connect to the controller.
    pub fn build(config: Config, base_dir: &Path, cancel: CancelToken) -> Result<Self, SorterError> {
        let store: Arc<dyn DetectionStore> = match config.storage.database_path(base_dir) {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).map_err(|e| SorterError::Store(e.to_string()))?;
                }
                Arc::new(SqliteDetectionStore::open(&path)?)
            }
            None => Arc::new(InMemoryDetectionStore::new()),
        };
        let archive = MapArchive::new(config.storage.archive_path(base_dir));

        let channel = EventChannel::new();
        let (persistence, display, audit) = attach_defaults(&channel, store.clone());

        let envelope = SafetyEnvelope::new(config.workspace)?
            .with_zones(config.keep_out.clone())?
            .with_feed(config.motion.feed)?;
        let validator = MotionValidator::new(envelope).with_channel(channel.clone());
        let gate = MotionGate::new(validator, build_controller(&config.controller)?)
            .with_channel(channel.clone());

        let vision = ScriptedVision::new(config.camera.frame_width, config.camera.frame_height)
            .then_detect(config.camera.scripted_blobs())
            .cycling();
        let orchestrator = BedMappingOrchestrator::new(
            Box::new(vision),
            Box::new(MosaicStitcher),
            PixelMapper::new(config.camera.mount),
            channel.clone(),
        )
        .with_min_captures(config.mapping.min_captures)
        .with_cancel_token(cancel.clone());

        let visit_planner = || {
            VisitPlanner::new(config.workspace, config.keep_out.clone(), config.planner())
                .with_sorting(config.sorting.clone())
        };
        let planner = visit_planner()?.with_channel(channel.clone());
        let auto_planner = PlannerSubscriber::new(
            visit_planner()?,
            store.clone(),
            MachinePosition::origin(),
        )
        .attach(&channel);

        info!(
            controller = gate.controller().name(),
            zones = config.keep_out.len(),
            archive = %archive.root().display(),
            "sorter assembled"
        );

        Ok(Self {
            config,
            gate,
            orchestrator,
            planner,
            store,
            archive,
            display,
            persistence,
            audit,
            auto_planner,
            cancel,
            last_archive: None,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Directory of the most recently archived bed map.
    pub fn last_archive(&self) -> Option<&Path> {
        self.last_archive.as_deref()
    }

    pub fn connect(&mut self) -> Result<MachinePosition, SorterError> {
        self.gate.connect()?;
        self.gate.position()
    }

    pub fn status(&self) -> Result<StatusReport, SorterError> {
        let map = self.orchestrator.current_map();
        Ok(StatusReport {
            controller: self.gate.controller().name().to_string(),
            connected: self.gate.is_connected(),
            session: self.orchestrator.state(),
            map_id: map.map(|m| m.id().to_string()),
            captures: map.map_or(0, |m| m.capture_count()),
            pending_objects: self.store.list_pending(None)?.len(),
            display: self.display.snapshot(),
            stats: self.gate.validation_stats(),
            auto_plan_visits: self.auto_planner.latest_plan().map(|p| p.visits.len()),
            objects_saved: self.persistence.saved(),
            events_seen: self.audit.events_seen(),
            last_archive: self.last_archive.clone(),
        })
    }

    // ── Mapping ──────────────────────────────────────────────────────────

    pub fn start(&mut self) -> Result<String, SorterError> {
        self.orchestrator.start_session()
    }

    pub fn capture(&mut self) -> Result<CaptureSummary, SorterError> {
        self.cancel.reset();
        self.orchestrator.capture(&mut self.gate)
    }

    /// Stitch the open session.  The map is archived whether it completes
    /// or aborts.
    pub fn finish(&mut self) -> Result<MapSummary, SorterError> {
        self.cancel.reset();
        let result = self.orchestrator.finish();
        self.archive_terminal_map();
        result
    }

    pub fn abort(&mut self, reason: &str) -> Result<(), SorterError> {
        self.orchestrator.abort(reason)?;
        self.archive_terminal_map();
        Ok(())
    }

    /// Grid scan over the whole workspace at safe height.
    pub fn scan(&mut self) -> Result<MapSummary, SorterError> {
        self.cancel.reset();
        let plan = ScanPlan::grid(
            self.config.scan_area(),
            self.config.mapping.grid_x,
            self.config.mapping.grid_y,
            self.config.motion.safe_z,
        )?
        .with_arrival(self.config.arrival());
        let result = run_scan(&mut self.orchestrator, &mut self.gate, &plan);
        self.archive_terminal_map();
        result
    }

    fn archive_terminal_map(&mut self) {
        if matches!(self.orchestrator.state(), SessionState::Open | SessionState::Stitching) {
            return;
        }
        let Some(map) = self.orchestrator.current_map() else {
            return;
        };
        if self.last_archive.as_ref().is_some_and(|dir| *dir == self.archive.map_dir(map.id())) {
            return;
        }
        match self.archive.store(map) {
            Ok(dir) => self.last_archive = Some(dir),
            Err(e) => warn!(map_id = map.id(), error = %e, "bed map not archived"),
        }
    }

    // ── Picking ──────────────────────────────────────────────────────────

    /// Plan a visit order over the pending objects of the current map, or
    /// of every map when no session has run yet.
    pub fn plan(&mut self) -> Result<PickPlan, SorterError> {
        let map_id = self.orchestrator.current_map().map(|m| m.id().to_string());
        let objects = self.store.list_pending(map_id.as_deref())?;
        let from = self
            .gate
            .last_known_position()
            .unwrap_or_else(MachinePosition::origin);
        Ok(self.planner.plan(&objects, &from)?)
    }

    /// Replan from the store and execute.  Returns the plan and the objects
    /// completed.
    pub fn pick(&mut self) -> Result<(PickPlan, Vec<ObjectId>), SorterError> {
        if self.gate.last_known_position().is_none() {
            self.gate.position()?;
        }
        let plan = self.plan()?;
        self.cancel.reset();
        let done = PickExecutor::run(&mut self.gate, &plan, self.store.as_ref(), &self.cancel)?;
        Ok((plan, done))
    }

    // ── Manual motion ────────────────────────────────────────────────────

    /// Rapid move, or a linear move when `feed_rate` is given.
    pub fn move_to(&mut self, target: MachinePosition, feed_rate: Option<f64>) -> Result<MachinePosition, SorterError> {
        self.cancel.reset();
        let command = match feed_rate {
            Some(feed) => MotionCommand::linear(target, feed, CommandOrigin::Operator),
            None => MotionCommand::rapid(target, CommandOrigin::Operator),
        };
        self.gate.submit(command)
    }

    /// Rise to safe height, then travel to the workspace minimum corner.
    pub fn home(&mut self) -> Result<MachinePosition, SorterError> {
        self.cancel.reset();
        let safe_z = self.config.motion.safe_z;
        let here = self.gate.position()?;
        let w = &self.config.workspace;
        let mut commands = Vec::with_capacity(2);
        if here.z < safe_z {
            commands.push(MotionCommand::rapid(here.with_z(safe_z), CommandOrigin::Operator));
        }
        commands.push(MotionCommand::rapid(
            MachinePosition::new(w.min_x, w.min_y, safe_z),
            CommandOrigin::Operator,
        ));
        self.gate.submit_all(commands, &self.cancel)?;
        self.gate.position()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IN_MEMORY_DATABASE;
    use cncsort_runtime::BinConfig;
    use cncsort_types::{KeepOutZone, WorkStatus};

    fn config() -> Config {
        let mut cfg = Config::default();
        cfg.storage.database = IN_MEMORY_DATABASE.to_string();
        cfg.mapping.grid_x = 2;
        cfg.mapping.grid_y = 2;
        cfg.mapping.settle_dwell_ms = 0;
        cfg.camera.simulated_detections = vec![[320.0, 240.0]];
        cfg
    }

    fn app(cfg: Config, dir: &Path) -> App {
        let mut app = App::build(cfg, dir, CancelToken::new()).expect("build");
        app.connect().expect("connect");
        app
    }

    #[test]
    fn scan_plan_and_pick() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let mut app = app(config(), dir.path());

        let summary = app.scan().expect("scan");
        assert_eq!(summary.image_count, 4);
        assert_eq!(summary.object_count, 4);

        let archived = app.status().unwrap().last_archive.expect("archived");
        assert!(archived.starts_with(dir.path().join("maps")));
        assert!(archived.join("metadata.json").exists());

        let plan = app.plan().expect("plan");
        assert_eq!(plan.visits.len(), 4);
        assert_eq!(app.status().unwrap().auto_plan_visits, Some(4));

        let (_, done) = app.pick().expect("pick");
        assert_eq!(done.len(), 4);
        for id in done {
            assert_eq!(app.store.get(id).unwrap().unwrap().status, WorkStatus::Completed);
        }
        assert_eq!(app.status().unwrap().pending_objects, 0);
        assert!(app.plan().unwrap().is_empty());
        assert_eq!(app.status().unwrap().objects_saved, 4);
    }

    #[test]
    fn picks_are_carried_to_the_configured_bin() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let mut cfg = config();
        cfg.sorting.bins.push(BinConfig {
            id: "tray".into(),
            location: MachinePosition::new(750.0, 380.0, 10.0),
            accepts: vec!["all".into()],
            size_range: vec!["all".into()],
        });
        let mut app = app(cfg, dir.path());

        app.scan().expect("scan");
        let plan = app.plan().expect("plan");
        assert_eq!(plan.visits.len(), 4);
        assert!(plan.visits.iter().all(|v| v.place.as_ref().is_some_and(|p| p.bin_id == "tray")));

        let (_, done) = app.pick().expect("pick");
        assert_eq!(done.len(), 4);
        assert_eq!(app.gate.last_known_position(), Some(MachinePosition::new(750.0, 380.0, 10.0)));
    }

    #[test]
    fn manual_session_archives_on_abort() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let mut app = app(config(), dir.path());

        let map_id = app.start().expect("start");
        app.capture().expect("capture");
        let err = app.finish().unwrap_err();
        assert!(matches!(err, SorterError::SessionState { .. }));
        assert_eq!(app.status().unwrap().session, SessionState::Open);
        assert!(app.status().unwrap().last_archive.is_none());

        app.abort("operator stop").expect("abort");
        let status = app.status().unwrap();
        assert_eq!(status.session, SessionState::Aborted);
        assert_eq!(status.display.last_abort, Some(format!("{map_id}: operator stop")));
        assert!(status.last_archive.unwrap().ends_with(&map_id));
    }

    #[test]
    fn manual_move_is_validated() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let mut cfg = config();
        cfg.keep_out.push(KeepOutZone::rect("vise", (100.0, 100.0), (200.0, 200.0), 0.0, 80.0));
        let mut app = app(cfg, dir.path());

        let pos = app.move_to(MachinePosition::new(50.0, 50.0, 60.0), None).expect("move");
        assert_eq!(pos, MachinePosition::new(50.0, 50.0, 60.0));

        let err = app
            .move_to(MachinePosition::new(150.0, 150.0, 10.0), Some(500.0))
            .unwrap_err();
        assert!(matches!(err, SorterError::BoundaryViolation(_)));
        assert_eq!(app.status().unwrap().stats.violations_detected, 1);
        assert_eq!(app.status().unwrap().display.violations, 1);

        let home = app.home().expect("home");
        assert_eq!(home, MachinePosition::new(0.0, 0.0, 50.0));
    }

    #[test]
    fn cancelled_token_is_reset_for_new_motion() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let mut app = app(config(), dir.path());
        app.cancel_token().cancel();
        app.home().expect("home after stale cancel");
    }

    #[test]
    fn stale_cancel_does_not_abort_next_capture() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let mut app = app(config(), dir.path());
        app.start().expect("start");
        app.capture().expect("first capture");

        // Left over from an interrupted pick.
        app.cancel_token().cancel();
        app.capture().expect("capture after stale cancel");
        assert_eq!(app.status().unwrap().session, SessionState::Open);
        assert_eq!(app.status().unwrap().captures, 2);

        app.cancel_token().cancel();
        app.finish().expect("finish after stale cancel");
        assert_eq!(app.status().unwrap().session, SessionState::Completed);
    }

    #[test]
    fn sqlite_store_is_created_under_base_dir() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let mut cfg = config();
        cfg.storage.database = "data/detections.db".to_string();
        let _app = App::build(cfg, dir.path(), CancelToken::new()).expect("build");
        assert!(dir.path().join("data").join("detections.db").exists());
    }
}
