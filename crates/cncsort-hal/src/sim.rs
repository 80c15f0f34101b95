//! In-process simulated controller for tests and the `simulated` controller
//! mode.
//!
//! Moves complete instantly.  Every executed command is journaled, and the
//! next send can be made to fail on demand.  A [`SimHandle`] keeps access to
//! the journal and fault switch after the controller has been boxed into a
//! [`MotionGate`](cncsort_kernel::MotionGate).
//!
//! # Example
//!
//! ```rust
//! use cncsort_hal::sim::SimulatedController;
//! use cncsort_kernel::{MotionGate, MotionValidator, SafetyEnvelope};
//! use cncsort_types::{CommandOrigin, MachinePosition, MotionCommand, WorkspaceLimits};
//!
//! let sim = SimulatedController::new(MachinePosition::origin());
//! let handle = sim.handle();
//! let validator = MotionValidator::new(SafetyEnvelope::new(WorkspaceLimits::default()).unwrap());
//! let mut gate = MotionGate::new(validator, Box::new(sim));
//! gate.connect().unwrap();
//!
//! gate.submit(MotionCommand::rapid(MachinePosition::new(10.0, 10.0, 50.0), CommandOrigin::Operator))
//!     .unwrap();
//! assert_eq!(handle.sent_count(), 1);
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use cncsort_kernel::{MachineController, ValidatedCommand};
use cncsort_types::{MachinePosition, MotionCommand, SorterError};

#[derive(Debug, Default)]
struct SimState {
    position: MachinePosition,
    journal: Vec<MotionCommand>,
}

pub struct SimulatedController {
    connected: bool,
    state: Arc<Mutex<SimState>>,
    fail_next: Arc<AtomicBool>,
}

impl SimulatedController {
    pub fn new(start: MachinePosition) -> Self {
        Self {
            connected: false,
            state: Arc::new(Mutex::new(SimState {
                position: start,
                journal: Vec::new(),
            })),
            fail_next: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn handle(&self) -> SimHandle {
        SimHandle {
            state: self.state.clone(),
            fail_next: self.fail_next.clone(),
        }
    }

    fn require_connected(&self) -> Result<(), SorterError> {
        if self.connected {
            Ok(())
        } else {
            Err(SorterError::collaborator("simulated", "not connected"))
        }
    }
}

impl MachineController for SimulatedController {
    fn name(&self) -> &str {
        "simulated"
    }

    fn connect(&mut self) -> Result<(), SorterError> {
        self.connected = true;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn position(&mut self) -> Result<MachinePosition, SorterError> {
        self.require_connected()?;
        Ok(self.state.lock().unwrap_or_else(PoisonError::into_inner).position)
    }

    fn send(&mut self, command: &ValidatedCommand) -> Result<(), SorterError> {
        self.require_connected()?;
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(SorterError::collaborator("simulated", "injected send failure"));
        }
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.position = command.target();
        state.journal.push(*command.command());
        Ok(())
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }
}

/// Observer and fault switch for a [`SimulatedController`].
#[derive(Clone)]
pub struct SimHandle {
    state: Arc<Mutex<SimState>>,
    fail_next: Arc<AtomicBool>,
}

impl SimHandle {
    /// Every command executed so far, in order.
    pub fn commands(&self) -> Vec<MotionCommand> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).journal.clone()
    }

    pub fn sent_count(&self) -> usize {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).journal.len()
    }

    pub fn position(&self) -> MachinePosition {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).position
    }

    /// Make the next `send` fail without moving.
    pub fn fail_next_send(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}
