//! Director-side view of one worker.

use std::{
    collections::BTreeSet,
    fmt,
    time::{Duration, Instant},
};

use crate::{
    error::Result,
    types::{ItemId, WorkerId},
};

use super::{
    message::{AssignedItem, ExistenceInfo, Message},
    transport::Connection,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Waiting for the worker's `connect`.
    Connecting,
    Connected,
    /// Told the cook is complete; waiting for the acknowledgement.
    FlushingBeforeShutdown,
    Disconnected,
}

/// Outstanding abort: the worker has seen it once it echoes `heartbeat`.
#[derive(Debug)]
pub(crate) struct AbortFence {
    pub(crate) heartbeat: u64,
    pub(crate) sent_at: Instant,
    /// Cancelled items that return to idle once the fence clears.
    pub(crate) cancelled: Vec<ItemId>,
}

pub(crate) struct WorkerHandle {
    id: WorkerId,
    connection: Box<dyn Connection>,
    state: ConnectionState,
    state_since: Instant,
    pub(crate) assigned: BTreeSet<ItemId>,
    outbox: Vec<AssignedItem>,
    existence: Vec<ExistenceInfo>,
    pub(crate) last_heartbeat_sent: u64,
    pub(crate) last_heartbeat_echoed: u64,
    pub(crate) missed_heartbeats: u32,
    pub(crate) fence: Option<AbortFence>,
    pub(crate) protocol_errors: u32,
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("id", &self.id)
            .field("peer", &self.connection.peer())
            .field("state", &self.state)
            .field("assigned", &self.assigned.len())
            .field("staged", &self.outbox.len())
            .field("fenced", &self.fence.is_some())
            .finish()
    }
}

impl WorkerHandle {
    pub(crate) fn new(id: WorkerId, connection: Box<dyn Connection>, now: Instant) -> Self {
        Self {
            id,
            connection,
            state: ConnectionState::Connecting,
            state_since: now,
            assigned: BTreeSet::new(),
            outbox: Vec::new(),
            existence: Vec::new(),
            last_heartbeat_sent: 0,
            last_heartbeat_echoed: 0,
            missed_heartbeats: 0,
            fence: None,
            protocol_errors: 0,
        }
    }

    pub(crate) fn id(&self) -> WorkerId {
        self.id
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: ConnectionState, now: Instant) {
        self.state = state;
        self.state_since = now;
    }

    pub(crate) fn in_state_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.state_since)
    }

    pub(crate) fn connection(&mut self) -> &mut dyn Connection {
        self.connection.as_mut()
    }

    pub(crate) fn peer(&self) -> String {
        self.connection.peer()
    }

    /// Whether new work may be staged here.
    pub(crate) fn accepts_work(&self, queue_depth: usize) -> bool {
        self.state == ConnectionState::Connected
            && self.fence.is_none()
            && self.assigned.len() < queue_depth
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.assigned.is_empty() && self.outbox.is_empty()
    }

    pub(crate) fn stage(&mut self, item: AssignedItem, existence: Vec<ExistenceInfo>) {
        self.assigned.insert(item.id.clone());
        for info in existence {
            if !self.existence.iter().any(|known| known.id == info.id) {
                self.existence.push(info);
            }
        }
        self.outbox.push(item);
    }

    /// Drops a staged assignment that has not been sent yet.
    pub(crate) fn unstage(&mut self, id: &ItemId) -> bool {
        let before = self.outbox.len();
        self.outbox.retain(|item| item.id != *id);
        before != self.outbox.len()
    }

    pub(crate) fn has_staged(&self) -> bool {
        !self.outbox.is_empty()
    }

    /// Takes up to `batch` staged items together with the existence info
    /// gathered since the last batch.
    pub(crate) fn take_batch(&mut self, batch: usize) -> (Vec<AssignedItem>, Vec<ExistenceInfo>) {
        let count = batch.max(1).min(self.outbox.len());
        let items: Vec<AssignedItem> = self.outbox.drain(..count).collect();
        let existence = if self.outbox.is_empty() {
            std::mem::take(&mut self.existence)
        } else {
            self.existence.clone()
        };
        (items, existence)
    }

    pub(crate) fn send(&mut self, message: &Message) -> Result<()> {
        self.connection.send(message)
    }

    /// Records an echoed heartbeat. Returns the fence it cleared, if any.
    pub(crate) fn note_echo(&mut self, number: u64) -> Option<AbortFence> {
        self.last_heartbeat_echoed = self.last_heartbeat_echoed.max(number);
        self.missed_heartbeats = 0;
        match &self.fence {
            Some(fence) if fence.heartbeat <= self.last_heartbeat_echoed => self.fence.take(),
            _ => None,
        }
    }

    /// Ends the connection and hands back everything that was assigned.
    pub(crate) fn disconnect(&mut self, now: Instant) -> (Vec<ItemId>, Option<AbortFence>) {
        self.set_state(ConnectionState::Disconnected, now);
        self.connection.close();
        self.outbox.clear();
        self.existence.clear();
        let assigned = std::mem::take(&mut self.assigned).into_iter().collect();
        (assigned, self.fence.take())
    }
}
