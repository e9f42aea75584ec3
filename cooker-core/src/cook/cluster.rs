use std::collections::{HashMap, HashSet};

use crate::types::ItemId;

/// Orders a batch so every item comes after the batch members it depends on.
///
/// Post-order over the static dependency edges returned by `dependencies`,
/// restricted to ids inside the batch. Roots are visited in batch order, so
/// unrelated items keep their request order. Cycles are broken at the first
/// revisit.
pub fn leaf_first<F>(batch: &[ItemId], mut dependencies: F) -> Vec<ItemId>
where
    F: FnMut(&ItemId) -> Vec<ItemId>,
{
    let members: HashSet<&ItemId> = batch.iter().collect();
    let mut edges: HashMap<&ItemId, Vec<ItemId>> = HashMap::with_capacity(batch.len());
    for id in batch {
        let deps = dependencies(id)
            .into_iter()
            .filter(|dep| members.contains(dep) && dep != id)
            .collect();
        edges.insert(id, deps);
    }

    let mut visited: HashSet<ItemId> = HashSet::with_capacity(batch.len());
    let mut ordered = Vec::with_capacity(batch.len());
    // (item, index of next dependency to visit)
    let mut stack: Vec<(ItemId, usize)> = Vec::new();

    for root in batch {
        if !visited.insert(root.clone()) {
            continue;
        }
        stack.push((root.clone(), 0));
        while let Some((current, next)) = stack.pop() {
            let deps = edges.get(&current).map(Vec::as_slice).unwrap_or(&[]);
            if let Some(dep) = deps.get(next) {
                stack.push((current.clone(), next + 1));
                if visited.insert(dep.clone()) {
                    stack.push((dep.clone(), 0));
                }
            } else {
                ordered.push(current);
            }
        }
    }
    ordered
}
