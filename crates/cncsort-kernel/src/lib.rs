//! `cncsort-kernel` – Motion safety
//!
//! Nothing moves the machine without passing through here.
//!
//! # Modules
//!
//! - [`controller`] – the [`MachineController`][controller::MachineController]
//!   trait every hardware variant implements, and
//!   [`ValidatedCommand`][controller::ValidatedCommand], the only command type
//!   a controller accepts.  It can only be minted by the validator.
//! - [`validator`] – [`MotionValidator`][validator::MotionValidator]: checks
//!   every [`MotionCommand`][cncsort_types::MotionCommand] against workspace
//!   limits, keep-out zones, feed-rate bounds and any extra
//!   [`MotionRule`][validator::MotionRule]s.
//! - [`motion_gate`] – [`MotionGate`][motion_gate::MotionGate]: owns the
//!   validator and the active controller; the single public path from a
//!   command to hardware.

pub mod controller;
pub mod motion_gate;
pub mod validator;

pub use controller::{MachineController, ValidatedCommand};
pub use motion_gate::MotionGate;
pub use validator::{MotionRule, MotionValidator, SafetyEnvelope, ValidationStats, Verdict};
