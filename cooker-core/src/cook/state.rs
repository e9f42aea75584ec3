use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a work item. Exactly one at a time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ItemState {
    Idle,
    Request,
    AssignedToWorker,
    Load,
    SaveActive,
    /// A save whose remaining platforms were pulled away from this process.
    SaveStalledRetracted,
    /// A local save whose remaining platforms were handed to a worker.
    SaveStalledAssignedToWorker,
}

impl ItemState {
    /// States in which the item owns an in-memory content handle.
    pub fn holds_content(self) -> bool {
        matches!(self, ItemState::Load | ItemState::SaveActive)
    }

    pub fn is_in_progress(self) -> bool {
        self != ItemState::Idle
    }

    pub fn is_save(self) -> bool {
        matches!(
            self,
            ItemState::SaveActive
                | ItemState::SaveStalledRetracted
                | ItemState::SaveStalledAssignedToWorker
        )
    }

    /// Legal edges of the item state machine.
    pub fn can_transition_to(self, next: ItemState) -> bool {
        use ItemState::*;
        match (self, next) {
            // cancellation, shutdown and eviction can always drop back to idle
            (from, Idle) => from != Idle,
            (Idle, Request) => true,
            (Request, Load) | (Request, AssignedToWorker) => true,
            (Load, SaveActive) => true,
            (SaveActive, SaveStalledRetracted) | (SaveActive, SaveStalledAssignedToWorker) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ItemState::Idle => "idle",
            ItemState::Request => "request",
            ItemState::AssignedToWorker => "assigned",
            ItemState::Load => "load",
            ItemState::SaveActive => "save",
            ItemState::SaveStalledRetracted => "save-retracted",
            ItemState::SaveStalledAssignedToWorker => "save-offloaded",
        };
        f.write_str(name)
    }
}

/// Progress marker inside [`ItemState::SaveActive`] for the platform at the
/// front of the item's pending list.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SaveSubState {
    #[default]
    StartSave,
    /// Polling leaf readiness; the save suspends here while it reports pending.
    AwaitReadiness,
    /// Calling the leaf save and committing its artifact.
    Serialize,
    /// Requesting generated sub-items and flushing discoveries for the platform.
    GenerateSubItems,
}

/// Progress marker inside [`ItemState::Load`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadSubState {
    /// Waiting for preload readiness reported by the provider.
    #[default]
    Preload,
    ReadyToLoad,
    /// Content is in memory; waiting for room in the save stage.
    Loaded,
}

/// Why a state change happened; logged with every transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateChangeReason {
    Requested,
    Classified,
    CacheHit,
    Assigned,
    Loaded,
    LoadFailed,
    Saved,
    Retracted,
    Offloaded,
    RemoteResult,
    Cancelled,
    Evicted,
    Retry,
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::ItemState::*;

    #[test]
    fn main_path_is_legal() {
        let path = [Idle, Request, Load, SaveActive, Idle];
        assert!(path.windows(2).all(|w| w[0].can_transition_to(w[1])));
    }

    #[test]
    fn save_cannot_skip_load() {
        assert!(!Request.can_transition_to(SaveActive));
        assert!(!Idle.can_transition_to(Load));
        assert!(!Idle.can_transition_to(Idle));
    }

    #[test]
    fn stalled_states_only_leave_to_idle() {
        for next in [Request, Load, SaveActive, AssignedToWorker] {
            assert!(!SaveStalledRetracted.can_transition_to(next));
            assert!(!SaveStalledAssignedToWorker.can_transition_to(next));
        }
        assert!(SaveStalledRetracted.can_transition_to(Idle));
    }
}
