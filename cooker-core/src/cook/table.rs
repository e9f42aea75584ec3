use std::collections::HashMap;

use tracing::debug;

use crate::{
    error::{CookError, Result},
    types::ItemId,
};

use super::{
    events::{CookEvent, CookEventBus},
    item::{Instigator, Urgency, WorkItem},
    state::{ItemState, StateChangeReason},
};

/// Arena of every work item known to the session, indexed by id.
#[derive(Debug, Default)]
pub struct ItemTable {
    items: HashMap<ItemId, WorkItem>,
    in_progress: usize,
}

impl ItemTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &ItemId) -> Option<&WorkItem> {
        self.items.get(id)
    }

    pub fn get_mut(&mut self, id: &ItemId) -> Option<&mut WorkItem> {
        self.items.get_mut(id)
    }

    pub fn require(&self, id: &ItemId) -> Result<&WorkItem> {
        self.items
            .get(id)
            .ok_or_else(|| CookError::Internal(format!("unknown work item {id}")))
    }

    pub fn require_mut(&mut self, id: &ItemId) -> Result<&mut WorkItem> {
        self.items
            .get_mut(id)
            .ok_or_else(|| CookError::Internal(format!("unknown work item {id}")))
    }

    /// Returns the item, creating it in `Idle` on first reference.
    /// Returns `true` alongside when it was created.
    pub fn get_or_create(
        &mut self,
        id: &ItemId,
        urgency: Urgency,
        instigator: Instigator,
    ) -> (&mut WorkItem, bool) {
        let mut created = false;
        let item = self.items.entry(id.clone()).or_insert_with(|| {
            created = true;
            WorkItem::new(id.clone(), urgency, instigator)
        });
        (item, created)
    }

    /// Drops an idle item from the session. In-progress items stay.
    pub fn remove(&mut self, id: &ItemId) -> Option<WorkItem> {
        match self.items.get(id) {
            Some(item) if item.state() == ItemState::Idle => self.items.remove(id),
            _ => None,
        }
    }

    /// Applies a state transition, keeping the in-progress count and
    /// publishing the change.
    pub fn transition(
        &mut self,
        id: &ItemId,
        next: ItemState,
        reason: StateChangeReason,
        events: &CookEventBus,
    ) -> Result<ItemState> {
        let item = self.require_mut(id)?;
        let from = item.transition(next)?;
        match (from.is_in_progress(), next.is_in_progress()) {
            (false, true) => self.in_progress += 1,
            (true, false) => self.in_progress = self.in_progress.saturating_sub(1),
            _ => {}
        }
        debug!(target: "cook::scheduler", item = %id, %from, to = %next, ?reason, "state change");
        events.publish(CookEvent::StateChanged {
            id: id.clone(),
            from,
            to: next,
            reason,
        });
        Ok(from)
    }

    /// Number of items in any non-idle state.
    pub fn in_progress(&self) -> usize {
        self.in_progress
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkItem> {
        self.items.values()
    }

    pub fn ids_in_state(&self, state: ItemState) -> Vec<ItemId> {
        let mut ids: Vec<ItemId> = self
            .items
            .values()
            .filter(|item| item.state() == state)
            .map(|item| item.id().clone())
            .collect();
        ids.sort();
        ids
    }

    /// The referencer chain from `id` back to its root request, for diagnostics.
    pub fn instigator_chain(&self, id: &ItemId) -> Vec<String> {
        let mut chain = Vec::new();
        let mut seen = std::collections::HashSet::new();
        let mut current = Some(id.clone());
        while let Some(cur) = current.take() {
            if !seen.insert(cur.clone()) {
                chain.push(format!("{cur} (cycle)"));
                break;
            }
            match self.items.get(&cur) {
                Some(item) => {
                    chain.push(format!("{cur} <- {}", item.instigator));
                    current = item.instigator.referencer().cloned();
                }
                None => {
                    chain.push(cur.to_string());
                }
            }
        }
        chain
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_progress_tracks_transitions() {
        let bus = CookEventBus::new(16);
        let mut table = ItemTable::new();
        let id = ItemId::new("a");
        table.get_or_create(&id, Urgency::Normal, Instigator::Root);
        table
            .transition(&id, ItemState::Request, StateChangeReason::Requested, &bus)
            .unwrap();
        assert_eq!(table.in_progress(), 1);
        assert!(table.remove(&id).is_none());
        table
            .transition(&id, ItemState::Idle, StateChangeReason::Cancelled, &bus)
            .unwrap();
        assert_eq!(table.in_progress(), 0);
        assert!(table.remove(&id).is_some());
    }

    #[test]
    fn illegal_transition_is_rejected_without_side_effects() {
        let bus = CookEventBus::new(16);
        let mut rx = bus.subscribe();
        let mut table = ItemTable::new();
        let id = ItemId::new("a");
        table.get_or_create(&id, Urgency::Normal, Instigator::Root);
        let err = table
            .transition(&id, ItemState::SaveActive, StateChangeReason::Loaded, &bus)
            .unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(table.in_progress(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn chain_walks_back_to_root() {
        let mut table = ItemTable::new();
        table.get_or_create(&ItemId::new("root"), Urgency::Normal, Instigator::Root);
        table.get_or_create(
            &ItemId::new("mid"),
            Urgency::Normal,
            Instigator::RuntimeDependency(ItemId::new("root")),
        );
        table.get_or_create(
            &ItemId::new("leaf"),
            Urgency::Normal,
            Instigator::BuildDependency(ItemId::new("mid")),
        );
        let chain = table.instigator_chain(&ItemId::new("leaf"));
        assert_eq!(chain.len(), 3);
        assert!(chain[0].starts_with("leaf <- build dependency of mid"));
        assert_eq!(chain[2], "root <- root");
    }
}
