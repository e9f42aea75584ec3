//! Dependencies found while an item loads or saves.
//!
//! Discoveries are parked on the discovering item per platform and only
//! turned into requests when that platform completes, so a failed or
//! retracted save never leaks partial edges into the scheduler.

use tracing::debug;

use crate::{
    error::Result,
    types::{ItemId, Platform},
};

use super::{
    cache::BuildCacheEntry,
    item::{DependencyKind, DiscoveredDependency, Instigator, Reachability, Urgency},
    leaf::SaveOutput,
    session::Session,
    state::{ItemState, StateChangeReason},
};

impl Session {
    /// Parks every edge reported by a save on the item.
    pub(crate) fn record_save_discoveries(
        &mut self,
        id: &ItemId,
        platform: &Platform,
        output: &SaveOutput,
    ) -> Result<()> {
        let item = self.table.require_mut(id)?;
        let edges = [
            (DependencyKind::Import, &output.imports),
            (DependencyKind::Soft, &output.soft_refs),
            (DependencyKind::Build, &output.build_deps),
            (DependencyKind::Generated, &output.generated),
        ];
        for (kind, ids) in edges {
            for dep in ids {
                item.add_discovered(platform, DiscoveredDependency::new(dep.clone(), kind));
            }
        }
        for generated in &output.generated {
            if !item.generated.contains(generated) {
                item.generated.push(generated.clone());
            }
        }
        Ok(())
    }

    /// Every edge parked on the item for `platform`, grouped by kind.
    pub(crate) fn parked_edges(&self, id: &ItemId, platform: &Platform) -> Result<SaveOutput> {
        let mut edges = SaveOutput::default();
        for dep in self.table.require(id)?.discovered(platform) {
            let list = match dep.kind {
                DependencyKind::Import => &mut edges.imports,
                DependencyKind::Soft => &mut edges.soft_refs,
                DependencyKind::Build => &mut edges.build_deps,
                DependencyKind::Generated => &mut edges.generated,
            };
            list.push(dep.id.clone());
        }
        Ok(edges)
    }

    /// Replays the edges a cache entry recorded, so downstream items are
    /// still requested when load and save are skipped.
    pub(crate) fn record_cached_discoveries(
        &mut self,
        id: &ItemId,
        platform: &Platform,
        entry: &BuildCacheEntry,
    ) -> Result<()> {
        let output = SaveOutput {
            artifact: Vec::new(),
            imports: entry.imports.clone(),
            soft_refs: entry.soft_refs.clone(),
            build_deps: entry.build_deps.iter().map(|(dep, _)| dep.clone()).collect(),
            generated: entry.generated.clone(),
        };
        self.record_save_discoveries(id, platform, &output)
    }

    /// Turns the parked discoveries of one completed platform into requests.
    /// On a worker they stay parked for the result report.
    pub(crate) fn flush_discoveries(&mut self, id: &ItemId, platform: &Platform) -> Result<usize> {
        if self.is_report_only() {
            return Ok(0);
        }
        let item = self.table.require_mut(id)?;
        let deps = item.discovered(platform).to_vec();
        item.discard_discovered(platform);
        let urgency = item.urgency;

        let mut requested = 0;
        for dep in deps {
            if self.request_dependency(id, platform, &dep, urgency)? {
                requested += 1;
            }
        }
        if requested > 0 {
            debug!(target: "cook::discovery", item = %id, %platform, requested, "discoveries flushed");
        }
        Ok(requested)
    }

    /// Requests one discovered dependency for `platform`. Returns `true` when
    /// it entered the request stage.
    pub(crate) fn request_dependency(
        &mut self,
        by: &ItemId,
        platform: &Platform,
        dep: &DiscoveredDependency,
        discoverer_urgency: Urgency,
    ) -> Result<bool> {
        if dep.id == *by {
            return Ok(false);
        }
        if dep.kind == DependencyKind::Soft && self.config.session.skip_soft_references {
            debug!(target: "cook::discovery", item = %by, dependency = %dep.id, "soft reference skipped");
            return Ok(false);
        }
        if self
            .table
            .get(&dep.id)
            .is_some_and(|existing| existing.result(platform).is_terminal())
        {
            return Ok(false);
        }

        let (instigator, urgency) = match dep.kind {
            DependencyKind::Import => (Instigator::RuntimeDependency(by.clone()), discoverer_urgency),
            DependencyKind::Soft => (Instigator::SoftDependency(by.clone()), Urgency::Normal),
            DependencyKind::Build => (Instigator::BuildDependency(by.clone()), Urgency::Normal),
            DependencyKind::Generated => (Instigator::Generated(by.clone()), discoverer_urgency),
        };
        let runtime = instigator.reachability() == Reachability::Runtime;
        let (item, created) = self.table.get_or_create(&dep.id, urgency, instigator);
        if created && dep.kind == DependencyKind::Generated {
            item.generated_by = Some(by.clone());
        }
        item.add_requested(std::slice::from_ref(platform));
        let upgraded = runtime && item.reachability == Reachability::Build;
        if upgraded {
            item.reachability = Reachability::Runtime;
        }
        let (state, item_urgency) = (item.state(), item.urgency);

        if state != ItemState::Idle {
            if upgraded && self.build_requests.remove(&dep.id) {
                self.requests.push(dep.id.clone(), item_urgency);
            }
            // already in flight; the running cycle re-queues new platforms
            return Ok(false);
        }
        self.enqueue_request(&dep.id, StateChangeReason::Requested)?;
        Ok(true)
    }
}
