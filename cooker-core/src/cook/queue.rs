use std::collections::{HashSet, VecDeque};

use crate::types::ItemId;

use super::item::Urgency;

/// Ordered multiset of item references for one pipeline stage.
///
/// FIFO within an urgency band; `Blocking` drains before `High`, which
/// drains before `Normal`. An id is present at most once.
#[derive(Debug, Default)]
pub struct UrgencyQueue {
    blocking: VecDeque<ItemId>,
    high: VecDeque<ItemId>,
    normal: VecDeque<ItemId>,
    members: HashSet<ItemId>,
}

impl UrgencyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn band_mut(&mut self, urgency: Urgency) -> &mut VecDeque<ItemId> {
        match urgency {
            Urgency::Blocking => &mut self.blocking,
            Urgency::High => &mut self.high,
            Urgency::Normal => &mut self.normal,
        }
    }

    /// Appends to the back of the band. Returns `false` if already queued.
    pub fn push(&mut self, id: ItemId, urgency: Urgency) -> bool {
        if !self.members.insert(id.clone()) {
            return false;
        }
        self.band_mut(urgency).push_back(id);
        true
    }

    /// Puts an item back at the head of its band.
    pub fn push_front(&mut self, id: ItemId, urgency: Urgency) -> bool {
        if !self.members.insert(id.clone()) {
            return false;
        }
        self.band_mut(urgency).push_front(id);
        true
    }

    pub fn pop(&mut self) -> Option<ItemId> {
        let id = self
            .blocking
            .pop_front()
            .or_else(|| self.high.pop_front())
            .or_else(|| self.normal.pop_front())?;
        self.members.remove(&id);
        Some(id)
    }

    pub fn pop_batch(&mut self, max: usize) -> Vec<ItemId> {
        let mut out = Vec::with_capacity(max.min(self.len()));
        while out.len() < max {
            match self.pop() {
                Some(id) => out.push(id),
                None => break,
            }
        }
        out
    }

    pub fn remove(&mut self, id: &ItemId) -> bool {
        if !self.members.remove(id) {
            return false;
        }
        for band in [&mut self.blocking, &mut self.high, &mut self.normal] {
            if let Some(pos) = band.iter().position(|queued| queued == id) {
                band.remove(pos);
                break;
            }
        }
        true
    }

    /// Moves a queued item to the back of the band for `urgency`.
    pub fn reposition(&mut self, id: &ItemId, urgency: Urgency) {
        if self.remove(id) {
            self.push(id.clone(), urgency);
        }
    }

    pub fn contains(&self, id: &ItemId) -> bool {
        self.members.contains(id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Current contents in processing order.
    pub fn snapshot(&self) -> Vec<ItemId> {
        self.blocking
            .iter()
            .chain(self.high.iter())
            .chain(self.normal.iter())
            .cloned()
            .collect()
    }

    pub fn clear(&mut self) -> Vec<ItemId> {
        let drained = self.snapshot();
        self.blocking.clear();
        self.high.clear();
        self.normal.clear();
        self.members.clear();
        drained
    }
}
