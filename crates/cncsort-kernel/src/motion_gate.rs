//! [`MotionGate`] – the only public path from a [`MotionCommand`] to hardware.
//!
//! The gate owns both the [`MotionValidator`] and the one active
//! [`MachineController`].  [`MotionGate::submit`] reads the controller's
//! position, validates the command from there, forwards it only when
//! accepted, and publishes `PositionUpdated` afterwards.  A rejected command
//! never reaches the controller.

use cncsort_middleware::EventChannel;
use cncsort_types::{CancelToken, Event, EventPayload, MachinePosition, MotionCommand, SorterError};
use tracing::{debug, info};

use crate::controller::MachineController;
use crate::validator::{MotionValidator, ValidationStats, Verdict};

const EVENT_SOURCE: &str = "cncsort-kernel::motion_gate";

pub struct MotionGate {
    validator: MotionValidator,
    controller: Box<dyn MachineController>,
    channel: Option<EventChannel>,
    last_known: Option<MachinePosition>,
}

impl MotionGate {
    pub fn new(validator: MotionValidator, controller: Box<dyn MachineController>) -> Self {
        Self {
            validator,
            controller,
            channel: None,
            last_known: None,
        }
    }

    /// Publish `PositionUpdated` on `channel` after every executed command.
    pub fn with_channel(mut self, channel: EventChannel) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn connect(&mut self) -> Result<(), SorterError> {
        self.controller.connect()?;
        info!(controller = self.controller.name(), "controller connected");
        Ok(())
    }

    pub fn disconnect(&mut self) {
        self.controller.disconnect();
        info!(controller = self.controller.name(), "controller disconnected");
    }

    pub fn is_connected(&self) -> bool {
        self.controller.is_connected()
    }

    /// Query the controller for its current position.
    pub fn position(&mut self) -> Result<MachinePosition, SorterError> {
        let pos = self.controller.position()?;
        self.last_known = Some(pos);
        Ok(pos)
    }

    /// Position after the last successful query or command, without talking
    /// to the controller.
    pub fn last_known_position(&self) -> Option<MachinePosition> {
        self.last_known
    }

    /// Validate `command` from the current position and execute it.
    ///
    /// Returns the new commanded position.
    ///
    /// # Errors
    ///
    /// - [`SorterError::BoundaryViolation`] – rejected by the validator; the
    ///   controller was not called.
    /// - Whatever the controller reports for the position query or the send.
    pub fn submit(&mut self, command: MotionCommand) -> Result<MachinePosition, SorterError> {
        let from = self.position()?;
        let validated = match self.validator.validate(command, &from) {
            Verdict::Accepted(validated) => validated,
            Verdict::Rejected(reason) => return Err(SorterError::BoundaryViolation(reason)),
        };

        self.controller.send(&validated)?;
        let position = validated.target();
        self.last_known = Some(position);
        debug!(controller = self.controller.name(), %from, to = %position, "command executed");

        if let Some(channel) = &self.channel {
            channel.publish(Event::new(
                EVENT_SOURCE,
                EventPayload::PositionUpdated {
                    position,
                    previous: from,
                },
            ));
        }
        Ok(position)
    }

    /// Submit `commands` in order, stopping at the first failure or as soon
    /// as `cancel` is set.  Returns how many commands were executed.
    ///
    /// Nothing is rolled back: the machine stays wherever the last executed
    /// command left it.
    pub fn submit_all<I>(&mut self, commands: I, cancel: &CancelToken) -> Result<usize, SorterError>
    where
        I: IntoIterator<Item = MotionCommand>,
    {
        let mut executed = 0;
        for command in commands {
            cancel.check()?;
            self.submit(command)?;
            executed += 1;
        }
        Ok(executed)
    }

    pub fn validator(&self) -> &MotionValidator {
        &self.validator
    }

    pub fn validation_stats(&self) -> ValidationStats {
        self.validator.validation_stats()
    }

    /// Read-only view of the controller.  Commands must go through
    /// [`MotionGate::submit`].
    pub fn controller(&self) -> &dyn MachineController {
        self.controller.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::ValidatedCommand;
    use crate::validator::SafetyEnvelope;
    use cncsort_types::{CommandOrigin, EventKind, KeepOutZone, WorkspaceLimits};
    use std::sync::{Arc, Mutex};

    /// Records every command it receives.
    struct Recorder {
        position: MachinePosition,
        sent: Arc<Mutex<Vec<MachinePosition>>>,
        fail_sends: bool,
    }

    impl MachineController for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn connect(&mut self) -> Result<(), SorterError> {
            Ok(())
        }

        fn is_connected(&self) -> bool {
            true
        }

        fn position(&mut self) -> Result<MachinePosition, SorterError> {
            Ok(self.position)
        }

        fn send(&mut self, command: &ValidatedCommand) -> Result<(), SorterError> {
            if self.fail_sends {
                return Err(SorterError::collaborator("recorder", "stalled"));
            }
            self.position = command.target();
            self.sent.lock().unwrap().push(command.target());
            Ok(())
        }

        fn disconnect(&mut self) {}
    }

    fn gate(sent: Arc<Mutex<Vec<MachinePosition>>>) -> MotionGate {
        let envelope = SafetyEnvelope::new(WorkspaceLimits::new(800.0, 400.0, 100.0))
            .unwrap()
            .with_zones(vec![KeepOutZone::rect("clamp", (100.0, 100.0), (200.0, 200.0), 0.0, 40.0)])
            .unwrap();
        MotionGate::new(
            MotionValidator::new(envelope),
            Box::new(Recorder {
                position: MachinePosition::new(0.0, 0.0, 50.0),
                sent,
                fail_sends: false,
            }),
        )
    }

    fn rapid(x: f64, y: f64, z: f64) -> MotionCommand {
        MotionCommand::rapid(MachinePosition::new(x, y, z), CommandOrigin::Operator)
    }

    #[test]
    fn accepted_command_reaches_controller() {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let mut gate = gate(sent.clone());
        let pos = gate.submit(rapid(300.0, 300.0, 50.0)).unwrap();
        assert_eq!(pos, MachinePosition::new(300.0, 300.0, 50.0));
        assert_eq!(sent.lock().unwrap().len(), 1);
        assert_eq!(gate.last_known_position(), Some(pos));
    }

    #[test]
    fn rejected_command_never_reaches_controller() {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let mut gate = gate(sent.clone());

        let err = gate.submit(rapid(850.0, 10.0, 0.0)).unwrap_err();
        assert!(matches!(err, SorterError::BoundaryViolation(_)));
        let err = gate.submit(rapid(150.0, 150.0, 10.0)).unwrap_err();
        assert!(matches!(err, SorterError::BoundaryViolation(_)));

        assert!(sent.lock().unwrap().is_empty());
        assert_eq!(gate.validation_stats().violations_detected, 2);
    }

    #[test]
    fn publishes_position_updates() {
        let channel = EventChannel::new();
        let updates = Arc::new(Mutex::new(Vec::new()));
        let u = updates.clone();
        channel.subscribe(EventKind::PositionUpdated, move |e| {
            if let EventPayload::PositionUpdated { position, previous } = &e.payload {
                u.lock().unwrap().push((*previous, *position));
            }
            Ok(())
        });

        let mut gate = gate(Arc::new(Mutex::new(Vec::new()))).with_channel(channel);
        gate.submit(rapid(300.0, 300.0, 50.0)).unwrap();
        gate.submit(rapid(300.0, 300.0, 0.0)).unwrap();

        let updates = updates.lock().unwrap();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[1].0, MachinePosition::new(300.0, 300.0, 50.0));
        assert_eq!(updates[1].1, MachinePosition::new(300.0, 300.0, 0.0));
    }

    #[test]
    fn submit_all_stops_at_first_rejection() {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let mut gate = gate(sent.clone());
        let cmds = vec![rapid(300.0, 300.0, 50.0), rapid(900.0, 0.0, 50.0), rapid(10.0, 10.0, 50.0)];

        let err = gate.submit_all(cmds, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, SorterError::BoundaryViolation(_)));
        assert_eq!(*sent.lock().unwrap(), vec![MachinePosition::new(300.0, 300.0, 50.0)]);
        assert_eq!(gate.position().unwrap(), MachinePosition::new(300.0, 300.0, 50.0));
    }

    #[test]
    fn submit_all_honours_cancellation() {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let mut gate = gate(sent.clone());
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = gate.submit_all(vec![rapid(300.0, 300.0, 50.0)], &cancel).unwrap_err();
        assert_eq!(err, SorterError::Cancelled);
        assert!(sent.lock().unwrap().is_empty());
    }

    #[test]
    fn controller_failure_propagates() {
        let envelope = SafetyEnvelope::new(WorkspaceLimits::default()).unwrap();
        let mut gate = MotionGate::new(
            MotionValidator::new(envelope),
            Box::new(Recorder {
                position: MachinePosition::origin(),
                sent: Arc::new(Mutex::new(Vec::new())),
                fail_sends: true,
            }),
        );
        let err = gate.submit(rapid(10.0, 10.0, 10.0)).unwrap_err();
        assert!(matches!(err, SorterError::Collaborator { .. }));
        assert_eq!(gate.last_known_position(), Some(MachinePosition::origin()));
    }
}
