//! GRBL / FluidNC line protocol: command formatting and reply parsing.
//!
//! | Motion kind | G-code |
//! |---|---|
//! | `Rapid` | `G0 X… Y… Z…` |
//! | `Linear` | `G1 X… Y… Z… F…` |
//! | `Probe` | `G38.2 X… Y… Z… F…` |
//!
//! Status reports look like `<Idle|MPos:10.000,20.000,5.000|FS:0,0>`.
//!
//! `ok` only means the controller buffered a line, not that the axes got
//! there.  [`wait_until_settled`] polls status reports until the machine is
//! `Idle` at the target (or gives up after [`Settle::timeout`]).

use std::time::{Duration, Instant};

use cncsort_types::{MachinePosition, MotionCommand, MotionKind, SorterError};
use thiserror::Error;
use tracing::debug;

/// Real-time status query.
pub const STATUS_QUERY: &str = "?";

#[derive(Debug, Error, PartialEq)]
pub enum GcodeError {
    #[error("status report has no MPos field: {0}")]
    MissingPosition(String),

    #[error("malformed coordinate '{0}' in status report")]
    BadCoordinate(String),

    #[error("controller replied with error:{0}")]
    Rejected(String),

    #[error("controller alarm: {0}")]
    Alarm(String),

    #[error("move to {target} did not settle within {timeout_ms} ms (last report: {last})")]
    NotSettled {
        target: MachinePosition,
        timeout_ms: u128,
        last: String,
    },
}

impl From<GcodeError> for SorterError {
    fn from(e: GcodeError) -> Self {
        SorterError::collaborator("controller", e)
    }
}

/// Render `command` as a single G-code line (no terminator).
pub fn format_command(command: &MotionCommand) -> String {
    let t = &command.target;
    let axes = format!("X{:.3} Y{:.3} Z{:.3}", t.x, t.y, t.z);
    let word = match command.kind {
        MotionKind::Rapid => "G0",
        MotionKind::Linear => "G1",
        MotionKind::Probe => "G38.2",
    };
    match (command.kind, command.feed_rate) {
        (MotionKind::Rapid, _) | (_, None) => format!("{word} {axes}"),
        (_, Some(feed)) => format!("{word} {axes} F{feed:.0}"),
    }
}

/// Parsed `<State|MPos:x,y,z|…>` report.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    /// Machine state, e.g. `"Idle"`, `"Run"`, `"Alarm"`.
    pub state: String,
    pub position: MachinePosition,
}

pub fn parse_status(line: &str) -> Result<StatusReport, GcodeError> {
    let body = line.trim().trim_start_matches('<').trim_end_matches('>');
    let mut fields = body.split('|');
    let state = fields.next().unwrap_or_default().to_string();
    let mpos = fields
        .find_map(|f| f.strip_prefix("MPos:"))
        .ok_or_else(|| GcodeError::MissingPosition(line.trim().to_string()))?;

    let coords = mpos
        .split(',')
        .map(|c| c.trim().parse::<f64>().map_err(|_| GcodeError::BadCoordinate(c.to_string())))
        .collect::<Result<Vec<_>, _>>()?;
    let &[x, y, z] = coords.as_slice() else {
        return Err(GcodeError::BadCoordinate(mpos.to_string()));
    };
    Ok(StatusReport {
        state,
        position: MachinePosition::new(x, y, z),
    })
}

/// Post-`ok` completion wait.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Settle {
    /// Per-axis distance from the target that still counts as arrived.
    pub tolerance_mm: f64,
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl Default for Settle {
    fn default() -> Self {
        Self {
            tolerance_mm: 0.5,
            poll_interval: Duration::from_millis(50),
            timeout: Duration::from_secs(30),
        }
    }
}

impl Settle {
    /// `Idle` and within tolerance of `target`.  Probe moves stop on contact,
    /// so for them `Idle` alone is enough.
    pub fn arrived(&self, report: &StatusReport, command: &MotionCommand) -> bool {
        if !report.state.eq_ignore_ascii_case("idle") {
            return false;
        }
        if command.kind == MotionKind::Probe {
            return true;
        }
        let (p, t) = (&report.position, &command.target);
        (p.x - t.x).abs() <= self.tolerance_mm
            && (p.y - t.y).abs() <= self.tolerance_mm
            && (p.z - t.z).abs() <= self.tolerance_mm
    }
}

/// Poll `status` until the machine has finished `command`.
///
/// An `Alarm` state ends the wait with [`GcodeError::Alarm`]; running past
/// `settle.timeout` ends it with [`GcodeError::NotSettled`].
pub fn wait_until_settled<F>(settle: &Settle, command: &MotionCommand, mut status: F) -> Result<StatusReport, SorterError>
where
    F: FnMut() -> Result<StatusReport, SorterError>,
{
    let deadline = Instant::now() + settle.timeout;
    let mut polls = 0u32;
    loop {
        let report = status()?;
        polls += 1;
        if report.state.to_ascii_lowercase().starts_with("alarm") {
            return Err(GcodeError::Alarm(report.state).into());
        }
        if settle.arrived(&report, command) {
            debug!(polls, position = %report.position, "move settled");
            return Ok(report);
        }
        if Instant::now() >= deadline {
            return Err(GcodeError::NotSettled {
                target: command.target,
                timeout_ms: settle.timeout.as_millis(),
                last: format!("{}|{}", report.state, report.position),
            }
            .into());
        }
        std::thread::sleep(settle.poll_interval);
    }
}

/// Classification of one line received after sending a command.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Ok,
    Error(String),
    Alarm(String),
    Status(String),
    /// Banners, `[MSG:…]` and anything else.
    Other(String),
}

pub fn parse_reply(line: &str) -> Reply {
    let line = line.trim();
    if line.eq_ignore_ascii_case("ok") {
        Reply::Ok
    } else if let Some(code) = line.strip_prefix("error:") {
        Reply::Error(code.trim().to_string())
    } else if let Some(code) = line.strip_prefix("ALARM:") {
        Reply::Alarm(code.trim().to_string())
    } else if line.starts_with('<') {
        Reply::Status(line.to_string())
    } else {
        Reply::Other(line.to_string())
    }
}
