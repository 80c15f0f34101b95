//! The hardware seam: [`MachineController`] and [`ValidatedCommand`].

use cncsort_types::{MachinePosition, MotionCommand, MotionKind, SorterError};

/// A [`MotionCommand`] that has passed the [`MotionValidator`].
///
/// There is no public constructor; the only way to obtain one is an
/// `Accepted` verdict, so holding one is proof the command was checked.
///
/// [`MotionValidator`]: crate::validator::MotionValidator
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedCommand {
    command: MotionCommand,
    from: MachinePosition,
}

impl ValidatedCommand {
    pub(crate) fn new(command: MotionCommand, from: MachinePosition) -> Self {
        Self { command, from }
    }

    pub fn command(&self) -> &MotionCommand {
        &self.command
    }

    pub fn target(&self) -> MachinePosition {
        self.command.target
    }

    pub fn feed_rate(&self) -> Option<f64> {
        self.command.feed_rate
    }

    pub fn kind(&self) -> MotionKind {
        self.command.kind
    }

    /// Position the command was validated from.
    pub fn from(&self) -> MachinePosition {
        self.from
    }
}

/// One physical (or simulated) motion controller.
///
/// Exactly one implementation is active per process; the
/// [`MotionGate`](crate::MotionGate) owns it.
pub trait MachineController: Send {
    /// Short identifier used in logs, e.g. `"serial:/dev/ttyUSB0"`.
    fn name(&self) -> &str;

    fn connect(&mut self) -> Result<(), SorterError>;

    fn is_connected(&self) -> bool;

    /// Current machine position as reported by the controller.
    fn position(&mut self) -> Result<MachinePosition, SorterError>;

    /// Execute a validated command.
    fn send(&mut self, command: &ValidatedCommand) -> Result<(), SorterError>;

    fn disconnect(&mut self);
}
