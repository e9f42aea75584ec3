use std::time::Instant;

use tracing::{debug, trace};

use crate::{
    error::{CookError, Result},
    types::{ItemId, Platform},
};

use super::{
    item::{DependencyKind, DiscoveredDependency},
    leaf::{LeafError, Readiness},
    session::Session,
    state::{ItemState, LoadSubState, StateChangeReason},
};

impl Session {
    /// Advances queued loads until `deadline`. Returns whether anything moved.
    ///
    /// The deadline is checked between items, never inside one.
    pub(crate) fn pump_load(&mut self, deadline: Instant) -> Result<bool> {
        let mut progressed = false;
        for id in self.loads.snapshot() {
            if Instant::now() >= deadline || self.finish_budget_spent() {
                break;
            }
            progressed |= self.advance_load(&id)?;
        }
        Ok(progressed)
    }

    fn advance_load(&mut self, id: &ItemId) -> Result<bool> {
        let mut progressed = false;
        loop {
            let item = self.table.require(id)?;
            if item.state() != ItemState::Load {
                self.loads.remove(id);
                return Ok(progressed);
            }
            let (sub_state, urgency) = (item.load_sub_state, item.urgency);
            match sub_state {
                LoadSubState::Preload => match self.provider.poll_preload(id) {
                    Readiness::Ready => {
                        self.table.require_mut(id)?.load_sub_state = LoadSubState::ReadyToLoad;
                        progressed = true;
                    }
                    Readiness::Pending => {
                        trace!(target: "cook::scheduler", item = %id, "preload pending");
                        return Ok(progressed);
                    }
                },
                LoadSubState::ReadyToLoad => match self.provider.load(id) {
                    Ok(handle) => {
                        self.summary.loads += 1;
                        let input_hash = self.provider.hash(id).ok();
                        let static_deps = self.provider.dependencies(id);
                        let item = self.table.require_mut(id)?;
                        item.attach_content(handle)?;
                        item.input_hash = input_hash;
                        item.load_sub_state = LoadSubState::Loaded;
                        let platforms: Vec<Platform> = item.pending_platforms.iter().cloned().collect();
                        for platform in &platforms {
                            for dep in &static_deps {
                                item.add_discovered(
                                    platform,
                                    DiscoveredDependency::new(dep.clone(), DependencyKind::Import),
                                );
                            }
                        }
                        debug!(target: "cook::scheduler", item = %id, "loaded");
                        progressed = true;
                    }
                    Err(error) => {
                        self.fail_load(id, &error)?;
                        return Ok(true);
                    }
                },
                LoadSubState::Loaded => {
                    if self.saves.len() >= self.config.queue.desired_save_population {
                        return Ok(progressed);
                    }
                    self.loads.remove(id);
                    self.table
                        .transition(id, ItemState::SaveActive, StateChangeReason::Loaded, &self.events)?;
                    self.saves.push(id.clone(), urgency);
                    return Ok(true);
                }
            }
        }
    }

    /// Load failed: the item leaves the load stage without content. Platforms
    /// with a retry left go back through the request stage; the rest get a
    /// terminal result.
    fn fail_load(&mut self, id: &ItemId, error: &LeafError) -> Result<()> {
        let item = self.table.require(id)?;
        if item.has_content() {
            return Err(CookError::InvariantViolation(format!(
                "{id}: load failed after content was attached"
            )));
        }
        let pending: Vec<Platform> = item.pending_platforms.iter().cloned().collect();
        self.loads.remove(id);
        self.table
            .transition(id, ItemState::Idle, StateChangeReason::LoadFailed, &self.events)?;

        let mut retrying = false;
        for platform in &pending {
            retrying |= self.apply_leaf_failure(id, platform, error, "load")?;
        }
        if retrying {
            let item = self.table.require_mut(id)?;
            item.instigator = std::mem::take(&mut item.instigator).retry();
        }
        self.finish_cycle(id)
    }
}
