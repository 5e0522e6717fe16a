//! Outbound command bus.
//!
//! Controllers publish actuator commands here; the MQTT side subscribes and
//! forwards them to the field device.

use tokio::sync::broadcast;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    PumpSetState(bool),
    LampSetState(bool),
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Command>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish without blocking. Returns the number of receivers reached.
    pub fn send(&self, command: Command) -> usize {
        match self.sender.send(command) {
            Ok(n) => n,
            Err(_) => {
                trace!(?command, "bus: no receivers");
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Command> {
        self.sender.subscribe()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
