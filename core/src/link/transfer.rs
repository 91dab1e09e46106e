//! Transfer tracker — progress and cancellation for fragmented sends
//!
//! Large payloads go out as paced fragment trains. Each train gets a
//! transfer id; the sender can cancel it mid-flight, and the pacing loop
//! checks the flag between fragments so unsent ones are never queued.
//! Progress is reported per fragment actually handed to the transport.

use rand::Rng;
use std::collections::HashMap;

/// Opaque handle for an in-flight fragmented send.
pub type TransferId = u64;

/// Progress notifications emitted on the engine's event channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferEvent {
    Progress {
        id: TransferId,
        sent: u16,
        total: u16,
    },
    Complete {
        id: TransferId,
    },
    Cancelled {
        id: TransferId,
        sent: u16,
        total: u16,
    },
}

#[derive(Debug)]
struct TransferState {
    sent: u16,
    total: u16,
    cancelled: bool,
}

/// Bookkeeping for outbound fragment trains.
#[derive(Debug, Default)]
pub struct TransferTracker {
    active: HashMap<TransferId, TransferState>,
}

impl TransferTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new train of `total` fragments and mint its id.
    pub fn begin(&mut self, total: u16) -> TransferId {
        let mut rng = rand::thread_rng();
        let mut id: TransferId = rng.gen();
        while self.active.contains_key(&id) {
            id = rng.gen();
        }
        self.active.insert(
            id,
            TransferState {
                sent: 0,
                total,
                cancelled: false,
            },
        );
        id
    }

    /// A fragment was handed to the transport. Returns the event to emit:
    /// `Progress` while fragments remain, `Complete` when this was the last
    /// one (the transfer is then forgotten).
    pub fn record_sent(&mut self, id: TransferId) -> Option<TransferEvent> {
        let state = self.active.get_mut(&id)?;
        state.sent = state.sent.saturating_add(1);
        if state.sent >= state.total {
            self.active.remove(&id);
            Some(TransferEvent::Complete { id })
        } else {
            Some(TransferEvent::Progress {
                id,
                sent: state.sent,
                total: state.total,
            })
        }
    }

    /// Request cancellation. Returns the terminal event if the transfer was
    /// still live; the pacing loop observes [`is_cancelled`](Self::is_cancelled)
    /// and stops before the next fragment.
    pub fn cancel(&mut self, id: TransferId) -> Option<TransferEvent> {
        let state = self.active.get_mut(&id)?;
        if state.cancelled {
            return None;
        }
        state.cancelled = true;
        Some(TransferEvent::Cancelled {
            id,
            sent: state.sent,
            total: state.total,
        })
    }

    /// Checked between fragments by the pacing loop.
    pub fn is_cancelled(&self, id: TransferId) -> bool {
        self.active.get(&id).map(|s| s.cancelled).unwrap_or(true)
    }

    /// Drop a finished or abandoned transfer.
    pub fn finish(&mut self, id: TransferId) {
        self.active.remove(&id);
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}
