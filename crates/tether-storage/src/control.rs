//! Connection lifecycle messages from hosts to the coordinator.

use tether_ipc::WordBuffer;
use tokio::sync::{mpsc, oneshot};

use crate::coordinator::CoordinatorStats;
use crate::error::StorageError;

pub type WorkerId = u32;

#[derive(Debug)]
pub enum ControlMessage {
    /// Start serving requests published in `protocol` on behalf of `worker`.
    Connect {
        worker: WorkerId,
        protocol: WordBuffer,
    },
    /// Tear down `worker`'s connection and force-close its sessions.
    Disconnect { worker: WorkerId },
    Inspect {
        reply: oneshot::Sender<CoordinatorStats>,
    },
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct ControlSender {
    tx: mpsc::UnboundedSender<ControlMessage>,
}

impl ControlSender {
    pub(crate) fn new(tx: mpsc::UnboundedSender<ControlMessage>) -> Self {
        Self { tx }
    }

    pub fn send(&self, msg: ControlMessage) -> Result<(), StorageError> {
        self.tx.send(msg).map_err(|_| StorageError::Disconnected)
    }

    pub fn connect(&self, worker: WorkerId, protocol: WordBuffer) -> Result<(), StorageError> {
        self.send(ControlMessage::Connect { worker, protocol })
    }

    pub fn disconnect(&self, worker: WorkerId) -> Result<(), StorageError> {
        self.send(ControlMessage::Disconnect { worker })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
