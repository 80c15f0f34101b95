//! [`BedMappingOrchestrator`] – drives one scanning session at a time.
//!
//! | From | Operation | To |
//! |---|---|---|
//! | `Idle` / `Completed` / `Aborted` | [`start_session`] | `Open` |
//! | `Open` | [`capture`] | `Open` |
//! | `Open` | [`finish`] | `Stitching` → `Completed` or `Aborted` |
//! | `Open` / `Stitching` | [`abort`] | `Aborted` |
//!
//! Each capture reads the machine position through the [`MotionGate`], grabs
//! a frame, detects objects, maps their pixel centres to machine coordinates
//! and publishes `ObjectsDetected`, even when nothing was found.  A failing
//! collaborator, or a cancellation observed between collaborator calls,
//! aborts the session before anything is appended.
//!
//! [`start_session`]: BedMappingOrchestrator::start_session
//! [`capture`]: BedMappingOrchestrator::capture
//! [`finish`]: BedMappingOrchestrator::finish
//! [`abort`]: BedMappingOrchestrator::abort

use std::fmt;

use chrono::Utc;
use cncsort_hal::{Stitcher, VisionSource};
use cncsort_kernel::MotionGate;
use cncsort_middleware::EventChannel;
use cncsort_types::{
    BedMap, CancelToken, CapturedImage, DetectedObject, Event, EventPayload, Frame,
    MachinePosition, MapState, SorterError,
};
use tracing::{debug, info, warn};

use crate::coords::PixelMapper;

const EVENT_SOURCE: &str = "cncsort-runtime::bed_mapping";

/// Fewest captures a map may be stitched from.
pub const MIN_CAPTURES: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Open,
    Stitching,
    Completed,
    Aborted,
}

impl SessionState {
    fn is_active(self) -> bool {
        matches!(self, SessionState::Open | SessionState::Stitching)
    }
}

impl From<MapState> for SessionState {
    fn from(s: MapState) -> Self {
        match s {
            MapState::Open => SessionState::Open,
            MapState::Stitching => SessionState::Stitching,
            MapState::Completed => SessionState::Completed,
            MapState::Aborted => SessionState::Aborted,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionState::Idle => "idle",
            SessionState::Open => "open",
            SessionState::Stitching => "stitching",
            SessionState::Completed => "completed",
            SessionState::Aborted => "aborted",
        })
    }
}

/// What one successful capture step added to the map.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureSummary {
    pub image_id: String,
    pub position: MachinePosition,
    pub object_count: usize,
}

/// Totals of a completed map, as published in `BedMapCompleted`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapSummary {
    pub map_id: String,
    pub image_count: usize,
    pub object_count: usize,
}

pub struct BedMappingOrchestrator {
    vision: Box<dyn VisionSource>,
    stitcher: Box<dyn Stitcher>,
    mapper: PixelMapper,
    channel: EventChannel,
    min_captures: usize,
    map: Option<BedMap>,
    cancel: CancelToken,
}

impl BedMappingOrchestrator {
    pub fn new(
        vision: Box<dyn VisionSource>,
        stitcher: Box<dyn Stitcher>,
        mapper: PixelMapper,
        channel: EventChannel,
    ) -> Self {
        Self {
            vision,
            stitcher,
            mapper,
            channel,
            min_captures: MIN_CAPTURES,
            map: None,
            cancel: CancelToken::new(),
        }
    }

    /// Require `n` captures before [`finish`](Self::finish); never fewer than
    /// [`MIN_CAPTURES`].
    pub fn with_min_captures(mut self, n: usize) -> Self {
        self.min_captures = n.max(MIN_CAPTURES);
        self
    }

    /// Share an externally owned cancellation flag (e.g. the Ctrl-C handler's).
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn min_captures(&self) -> usize {
        self.min_captures
    }

    pub fn state(&self) -> SessionState {
        self.map.as_ref().map_or(SessionState::Idle, |m| m.state().into())
    }

    /// Clone of the flag observed by in-flight steps.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// The map of the current or most recent session.
    pub fn current_map(&self) -> Option<&BedMap> {
        self.map.as_ref()
    }

    /// Hand over a completed or aborted map and return to `Idle`.  Returns
    /// `None` (and keeps the map) while a session is still active.
    pub fn take_finished(&mut self) -> Option<BedMap> {
        if self.state().is_active() {
            return None;
        }
        self.map.take()
    }

    /// Open a new session and return its map id.
    ///
    /// # Errors
    ///
    /// [`SorterError::SessionState`] while another session is open or
    /// stitching; that session is left untouched.
    pub fn start_session(&mut self) -> Result<String, SorterError> {
        let state = self.state();
        if state.is_active() {
            warn!(%state, "start rejected: session already active");
            return Err(SorterError::session("start a new session", state));
        }
        self.cancel.reset();
        let map = BedMap::open(BedMap::generate_id());
        let id = map.id().to_string();
        self.map = Some(map);
        info!(map_id = %id, "mapping session opened");
        Ok(id)
    }

    /// Take one capture at the machine's current position.
    pub fn capture(&mut self, gate: &mut MotionGate) -> Result<CaptureSummary, SorterError> {
        let map = self.open_map("capture")?;
        let map_id = map.id().to_string();
        let image_id = map.next_image_id();

        let (position, frame, mut objects) = match self.acquire(gate) {
            Ok(acquired) => acquired,
            Err(e) => {
                self.abort_with(&e.to_string());
                return Err(e);
            }
        };

        for obj in &mut objects {
            self.mapper.locate(obj, frame.width, frame.height, &position);
            obj.image_id = Some(image_id.clone());
            obj.bed_map_id = Some(map_id.clone());
        }

        let summary = CaptureSummary {
            image_id: image_id.clone(),
            position,
            object_count: objects.len(),
        };
        self.open_map("capture")?.push_capture(CapturedImage {
            image_id: image_id.clone(),
            frame,
            position,
            objects: objects.clone(),
            captured_at: Utc::now(),
        })?;
        debug!(map_id = %map_id, image_id = %image_id, %position, objects = summary.object_count, "capture appended");

        self.channel.publish(Event::new(
            EVENT_SOURCE,
            EventPayload::ObjectsDetected {
                objects,
                image_id,
                map_id,
            },
        ));
        Ok(summary)
    }

    /// Stitch the captures and complete the map.
    ///
    /// # Errors
    ///
    /// - [`SorterError::SessionState`] – no open session, or fewer than
    ///   [`min_captures`](Self::min_captures) captures.  The session stays
    ///   open.
    /// - [`SorterError::Cancelled`] or [`SorterError::Collaborator`] – the
    ///   session was aborted and `BedMapAborted` published.
    pub fn finish(&mut self) -> Result<MapSummary, SorterError> {
        let min = self.min_captures;
        let map = self.open_map("finish")?;
        let count = map.capture_count();
        if count < min {
            return Err(SorterError::session(
                "finish",
                format!("open with {count} of {min} required captures"),
            ));
        }
        map.begin_stitching()?;
        let frames: Vec<Frame> = map.captures().iter().map(|c| c.frame.clone()).collect();
        info!(map_id = map.id(), images = count, "stitching bed map");

        if let Err(e) = self.cancel.check() {
            self.abort_with(&e.to_string());
            return Err(e);
        }
        let composite = match self.stitcher.stitch(&frames) {
            Ok(composite) => composite,
            Err(failure) => {
                let err = SorterError::collaborator("stitcher", &failure);
                self.abort_with(&failure.to_string());
                return Err(err);
            }
        };

        let Some(map) = self.map.as_mut() else {
            return Err(SorterError::session("finish", SessionState::Idle));
        };
        map.complete(composite)?;
        let summary = MapSummary {
            map_id: map.id().to_string(),
            image_count: map.capture_count(),
            object_count: map.object_count(),
        };
        info!(
            map_id = %summary.map_id,
            images = summary.image_count,
            objects = summary.object_count,
            "bed map completed"
        );
        self.channel.publish(Event::new(
            EVENT_SOURCE,
            EventPayload::BedMapCompleted {
                map_id: summary.map_id.clone(),
                object_count: summary.object_count,
                image_count: summary.image_count,
            },
        ));
        Ok(summary)
    }

    /// Abort the active session.  Captures are kept for diagnostics.
    pub fn abort(&mut self, reason: &str) -> Result<(), SorterError> {
        let state = self.state();
        if !state.is_active() {
            return Err(SorterError::session("abort", state));
        }
        self.abort_with(reason);
        Ok(())
    }

    fn open_map(&mut self, operation: &str) -> Result<&mut BedMap, SorterError> {
        match self.map.as_mut() {
            Some(map) if map.state() == MapState::Open => Ok(map),
            Some(map) => Err(SorterError::session(operation, map.state())),
            None => Err(SorterError::session(operation, SessionState::Idle)),
        }
    }

    fn acquire(
        &mut self,
        gate: &mut MotionGate,
    ) -> Result<(MachinePosition, Frame, Vec<DetectedObject>), SorterError> {
        self.cancel.check()?;
        let position = gate.position()?;
        self.cancel.check()?;
        let frame = self.vision.capture_frame()?;
        self.cancel.check()?;
        let objects = self.vision.detect(&frame)?;
        self.cancel.check()?;
        Ok((position, frame, objects))
    }

    fn abort_with(&mut self, reason: &str) {
        let Some(map) = self.map.as_mut() else {
            return;
        };
        if map.abort(reason).is_err() {
            return;
        }
        let map_id = map.id().to_string();
        warn!(map_id = %map_id, reason, captures = map.capture_count(), "mapping session aborted");
        self.channel.publish(Event::new(
            EVENT_SOURCE,
            EventPayload::BedMapAborted {
                map_id,
                reason: reason.to_string(),
            },
        ));
    }
}
