use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::{ItemId, Platform};

use super::{
    item::PlatformResult,
    state::{ItemState, StateChangeReason},
};

/// Notifications published by the scheduler thread.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum CookEvent {
    /// A terminal result was recorded for one (item, platform).
    ItemCompleted {
        id: ItemId,
        platform: Platform,
        result: PlatformResult,
    },
    StateChanged {
        id: ItemId,
        from: ItemState,
        to: ItemState,
        reason: StateChangeReason,
    },
    CollectionFinished {
        full: bool,
        evicted: usize,
    },
    SessionComplete,
}

/// In-process fan-out of cook events. Publishing never blocks and never
/// fails; slow subscribers observe `RecvError::Lagged`.
pub struct CookEventBus {
    sender: broadcast::Sender<CookEvent>,
    capacity: usize,
}

impl fmt::Debug for CookEventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CookEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl CookEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender, capacity }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CookEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: CookEvent) {
        let _ = self.sender.send(event);
    }
}
