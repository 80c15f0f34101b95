//! `cncsort-hal` – Hardware abstraction
//!
//! Concrete collaborators behind the traits the rest of the workspace
//! programs against.
//!
//! # Modules
//!
//! - [`gcode`] – GRBL/FluidNC line protocol: command formatting, status and
//!   reply parsing, and the post-`ok` settle wait.
//! - [`serial`] – [`SerialController`]: line protocol over a serial link.
//! - [`network`] – [`NetworkController`]: FluidNC HTTP command endpoint.
//! - [`sim`] – [`SimulatedController`]: instant moves, command journal and
//!   fault injection.
//! - [`vision`] – [`VisionSource`] trait and the scripted
//!   [`ScriptedVision`] source.
//! - [`stitch`] – [`Stitcher`] trait and the side-by-side
//!   [`MosaicStitcher`].
//!
//! Exactly one controller is built at startup, chosen by
//! [`ControllerConfig::kind`] through [`build_controller`].

use std::time::Duration;

use cncsort_kernel::MachineController;
use cncsort_types::{MachinePosition, SorterError};
use serde::{Deserialize, Serialize};
use tracing::info;

pub mod gcode;
pub mod network;
pub mod serial;
pub mod sim;
pub mod stitch;
pub mod vision;

pub use gcode::Settle;
pub use network::NetworkController;
pub use serial::{SerialController, SerialLink};
pub use sim::{SimHandle, SimulatedController};
pub use stitch::{MosaicStitcher, StitchFailure, Stitcher};
pub use vision::{ScriptedBlob, ScriptedVision, VisionSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControllerKind {
    Serial,
    Network,
    #[default]
    Simulated,
}

impl ControllerKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "serial" => Some(ControllerKind::Serial),
            "network" | "http" => Some(ControllerKind::Network),
            "simulated" | "sim" | "mock" => Some(ControllerKind::Simulated),
            _ => None,
        }
    }
}

/// The `[controller]` configuration section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub kind: ControllerKind,
    pub serial_port: String,
    pub baud_rate: u32,
    pub http_host: String,
    pub http_port: u16,
    pub timeout_ms: u64,
    /// How close to the target counts as arrived after a move.
    pub settle_tolerance_mm: f64,
    pub settle_poll_ms: u64,
    /// Longest a single move may take before the controller gives up.
    pub move_timeout_ms: u64,
}

impl ControllerConfig {
    pub fn settle(&self) -> Settle {
        Settle {
            tolerance_mm: self.settle_tolerance_mm,
            poll_interval: Duration::from_millis(self.settle_poll_ms),
            timeout: Duration::from_millis(self.move_timeout_ms),
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            kind: ControllerKind::Simulated,
            serial_port: "/dev/ttyUSB0".to_string(),
            baud_rate: 115_200,
            http_host: "192.168.1.100".to_string(),
            http_port: 80,
            timeout_ms: 2_000,
            settle_tolerance_mm: 0.5,
            settle_poll_ms: 50,
            move_timeout_ms: 30_000,
        }
    }
}

/// Build the one controller selected by `config`.  Does not connect.
pub fn build_controller(config: &ControllerConfig) -> Result<Box<dyn MachineController>, SorterError> {
    let timeout = Duration::from_millis(config.timeout_ms);
    let controller: Box<dyn MachineController> = match config.kind {
        ControllerKind::Serial => Box::new(
            SerialController::new(config.serial_port.clone(), config.baud_rate, timeout)
                .with_settle(config.settle()),
        ),
        ControllerKind::Network => Box::new(
            NetworkController::new(&config.http_host, config.http_port, timeout)?
                .with_settle(config.settle()),
        ),
        ControllerKind::Simulated => Box::new(SimulatedController::new(MachinePosition::origin())),
    };
    info!(kind = ?config.kind, controller = controller.name(), "controller selected");
    Ok(controller)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::tests::{ScriptedLink, instant_settle};
    use cncsort_kernel::{MotionGate, MotionValidator, SafetyEnvelope};
    use cncsort_types::{CommandOrigin, KeepOutZone, MotionCommand, ViolationReason, WorkspaceLimits};
    use std::sync::{Arc, Mutex};

    fn validator() -> MotionValidator {
        MotionValidator::new(SafetyEnvelope::new(WorkspaceLimits::new(800.0, 400.0, 100.0)).unwrap())
    }

    fn serial_gate(validator: MotionValidator, replies: &str) -> (MotionGate, Arc<Mutex<Vec<u8>>>) {
        let link = ScriptedLink::new(replies);
        let written = link.written.clone();
        let controller = SerialController::with_link("serial:test", Box::new(link)).with_settle(instant_settle());
        let mut gate = MotionGate::new(validator, Box::new(controller));
        gate.connect().unwrap();
        (gate, written)
    }

    #[test]
    fn builds_selected_variant() {
        let mut config = ControllerConfig::default();
        assert_eq!(build_controller(&config).unwrap().name(), "simulated");

        config.kind = ControllerKind::Serial;
        config.serial_port = "/dev/ttyACM0".into();
        assert_eq!(build_controller(&config).unwrap().name(), "serial:/dev/ttyACM0");

        config.kind = ControllerKind::Network;
        config.http_host = "10.0.0.7".into();
        assert_eq!(build_controller(&config).unwrap().name(), "http:10.0.0.7:80");
    }

    #[test]
    fn settle_comes_from_config() {
        let config = ControllerConfig {
            settle_tolerance_mm: 1.0,
            move_timeout_ms: 45_000,
            ..ControllerConfig::default()
        };
        let settle = config.settle();
        assert_eq!(settle.tolerance_mm, 1.0);
        assert_eq!(settle.timeout, Duration::from_secs(45));
        assert_eq!(settle.poll_interval, Duration::from_millis(50));
    }

    #[test]
    fn parses_kind_aliases() {
        assert_eq!(ControllerKind::parse("HTTP"), Some(ControllerKind::Network));
        assert_eq!(ControllerKind::parse("mock"), Some(ControllerKind::Simulated));
        assert_eq!(ControllerKind::parse("usb"), None);
    }

    #[test]
    fn serial_controller_through_gate() {
        let (mut gate, written) = serial_gate(
            validator(),
            "<Idle|MPos:0.000,0.000,50.000>\r\nok\r\n<Idle|MPos:10.000,20.000,50.000>\r\n",
        );
        let cmd = MotionCommand::rapid(MachinePosition::new(10.0, 20.0, 50.0), CommandOrigin::Operator);
        gate.submit(cmd).unwrap();
        let out = String::from_utf8(written.lock().unwrap().clone()).unwrap();
        assert_eq!(out, "?\nG0 X10.000 Y20.000 Z50.000\n?\n");
    }

    #[test]
    fn next_move_is_validated_from_where_the_machine_stopped() {
        let envelope = SafetyEnvelope::new(WorkspaceLimits::new(800.0, 400.0, 100.0))
            .unwrap()
            .with_zones(vec![KeepOutZone::rect("gantry", (90.0, 50.0), (110.0, 150.0), 45.0, 55.0)])
            .unwrap();
        let (mut gate, written) = serial_gate(
            MotionValidator::new(envelope),
            concat!(
                // rise: still running after the `ok`, then idle at the top
                "<Idle|MPos:0.000,100.000,10.000>\r\n",
                "ok\r\n",
                "<Run|MPos:0.000,100.000,10.000>\r\n",
                "<Run|MPos:0.000,100.000,32.000>\r\n",
                "<Idle|MPos:0.000,100.000,50.000>\r\n",
                // lateral: the status query before validation
                "<Idle|MPos:0.000,100.000,50.000>\r\n",
            ),
        );

        let rise = MotionCommand::rapid(MachinePosition::new(0.0, 100.0, 50.0), CommandOrigin::Planner);
        gate.submit(rise).unwrap();

        let lateral = MotionCommand::rapid(MachinePosition::new(200.0, 100.0, 50.0), CommandOrigin::Planner);
        let err = gate.submit(lateral).unwrap_err();
        assert!(matches!(
            err,
            SorterError::BoundaryViolation(ViolationReason::KeepOutPath { ref zone }) if zone == "gantry"
        ));

        let out = String::from_utf8(written.lock().unwrap().clone()).unwrap();
        assert_eq!(out, "?\nG0 X0.000 Y100.000 Z50.000\n?\n?\n?\n?\n");
        assert!(!out.contains("X200.000"));
    }

    #[test]
    fn serial_rejection_is_not_transmitted() {
        let (mut gate, written) = serial_gate(validator(), "<Idle|MPos:0.000,0.000,50.000>\r\n");
        let cmd = MotionCommand::rapid(MachinePosition::new(850.0, 10.0, 0.0), CommandOrigin::Operator);
        assert!(matches!(gate.submit(cmd), Err(SorterError::BoundaryViolation(_))));
        // Only the status query went out.
        assert_eq!(String::from_utf8(written.lock().unwrap().clone()).unwrap(), "?\n");
    }

    #[test]
    fn serial_error_reply_surfaces() {
        let (mut gate, _) = serial_gate(validator(), "<Idle|MPos:0.000,0.000,50.000>\r\nerror:22\r\n");
        let cmd = MotionCommand::linear(MachinePosition::new(10.0, 10.0, 10.0), 500.0, CommandOrigin::Planner);
        let err = gate.submit(cmd).unwrap_err();
        assert!(err.to_string().contains("error:22"));
    }
}
