//! Scheduler-thread state shared by the pumps, discovery and the director.

use std::{collections::HashMap, fmt, sync::Arc, time::Instant};

use tracing::{debug, error, info, warn};

use crate::{
    distrib::message::{ArtifactPayload, PackageResult, PlatformOutcome},
    error::{CookError, Result},
    types::{ItemId, Platform},
};

use super::{
    cache::BuildCache,
    config::CookerConfig,
    cooker::CookSummary,
    events::{CookEvent, CookEventBus},
    item::{Instigator, PlatformResult, Reachability, Urgency},
    leaf::{ArtifactMetadata, ArtifactSink, ContentProvider, FailureClass, LeafError},
    queue::UrgencyQueue,
    state::{ItemState, StateChangeReason},
    table::ItemTable,
};

/// Where successful save output goes.
pub(crate) enum SessionMode {
    /// Artifacts are persisted here and discoveries become new requests.
    Local { sink: Arc<dyn ArtifactSink> },
    /// Worker side: artifacts and discoveries are buffered per item and
    /// shipped to the director when the item finishes.
    ReportOnly {
        artifacts: HashMap<ItemId, Vec<(Platform, ArtifactPayload)>>,
        reports: Vec<PackageResult>,
    },
}

impl fmt::Debug for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionMode::Local { .. } => f.write_str("Local"),
            SessionMode::ReportOnly { reports, .. } => f
                .debug_struct("ReportOnly")
                .field("pending_reports", &reports.len())
                .finish(),
        }
    }
}

pub(crate) struct Session {
    pub(crate) config: CookerConfig,
    pub(crate) provider: Arc<dyn ContentProvider>,
    pub(crate) mode: SessionMode,
    pub(crate) cache: BuildCache,
    pub(crate) table: ItemTable,
    /// Runtime-reachable requests.
    pub(crate) requests: UrgencyQueue,
    /// Build-only requests, drained after the runtime phase.
    pub(crate) build_requests: UrgencyQueue,
    pub(crate) loads: UrgencyQueue,
    pub(crate) saves: UrgencyQueue,
    pub(crate) events: CookEventBus,
    pub(crate) summary: CookSummary,
    /// Items that finished every platform since the scheduler last looked.
    pub(crate) items_finished: u32,
    /// Pumps return once this many items finished. Set by the scheduler so a
    /// pending collection lands between two completions.
    pub(crate) finish_budget: Option<u32>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("mode", &self.mode)
            .field("items", &self.table.len())
            .field("in_progress", &self.table.in_progress())
            .field("requests", &self.requests.len())
            .field("build_requests", &self.build_requests.len())
            .field("loads", &self.loads.len())
            .field("saves", &self.saves.len())
            .finish()
    }
}

impl Session {
    pub(crate) fn new(
        config: CookerConfig,
        provider: Arc<dyn ContentProvider>,
        mode: SessionMode,
        cache: BuildCache,
    ) -> Self {
        let events = CookEventBus::new(config.session.event_channel_capacity);
        Self {
            config,
            provider,
            mode,
            cache,
            table: ItemTable::new(),
            requests: UrgencyQueue::new(),
            build_requests: UrgencyQueue::new(),
            loads: UrgencyQueue::new(),
            saves: UrgencyQueue::new(),
            events,
            summary: CookSummary::default(),
            items_finished: 0,
            finish_budget: None,
        }
    }

    pub(crate) fn is_report_only(&self) -> bool {
        matches!(self.mode, SessionMode::ReportOnly { .. })
    }

    pub(crate) fn finish_budget_spent(&self) -> bool {
        self.finish_budget
            .is_some_and(|budget| self.items_finished >= budget)
    }

    /// No queued or in-flight local work.
    pub(crate) fn is_drained(&self) -> bool {
        self.table.in_progress() == 0
            && self.requests.is_empty()
            && self.build_requests.is_empty()
            && self.loads.is_empty()
            && self.saves.is_empty()
    }

    fn request_queue_for(&mut self, reachability: Reachability) -> &mut UrgencyQueue {
        match reachability {
            Reachability::Runtime => &mut self.requests,
            Reachability::Build => &mut self.build_requests,
        }
    }

    /// Moves an idle item into the request stage.
    pub(crate) fn enqueue_request(&mut self, id: &ItemId, reason: StateChangeReason) -> Result<()> {
        self.table
            .transition(id, ItemState::Request, reason, &self.events)?;
        let item = self.table.require(id)?;
        let (urgency, reachability) = (item.urgency, item.reachability);
        self.request_queue_for(reachability).push(id.clone(), urgency);
        Ok(())
    }

    /// Handles a request from outside the scheduler or from the director's
    /// assignment. Returns `true` when the item entered the request stage.
    pub(crate) fn request(
        &mut self,
        id: &ItemId,
        platforms: &[Platform],
        urgency: Urgency,
        instigator: Instigator,
    ) -> Result<bool> {
        let runtime = instigator.reachability() == Reachability::Runtime;
        let (item, created) = self.table.get_or_create(id, urgency, instigator);
        if !created {
            item.urgency = item.urgency.elevate(urgency);
        }
        item.add_requested(platforms);
        let upgraded = runtime && item.reachability == Reachability::Build;
        if upgraded {
            item.reachability = Reachability::Runtime;
        }
        let needs_cook = !item.platforms_needing_cook().is_empty();
        let (state, urgency) = (item.state(), item.urgency);

        match state {
            ItemState::Idle if needs_cook => {
                self.enqueue_request(id, StateChangeReason::Requested)?;
                Ok(true)
            }
            ItemState::Request => {
                if upgraded && self.build_requests.remove(id) {
                    self.requests.push(id.clone(), urgency);
                } else if self.requests.contains(id) {
                    self.requests.reposition(id, urgency);
                } else {
                    self.build_requests.reposition(id, urgency);
                }
                Ok(false)
            }
            ItemState::Load => {
                self.loads.reposition(id, urgency);
                Ok(false)
            }
            // in-flight cycles pick up new platforms when they finish
            _ => Ok(false),
        }
    }

    /// Records a terminal result and notifies subscribers.
    pub(crate) fn complete_platform(
        &mut self,
        id: &ItemId,
        platform: &Platform,
        result: PlatformResult,
    ) -> Result<()> {
        self.table.require_mut(id)?.set_result(platform, result)?;
        match result {
            PlatformResult::Succeeded => self.summary.succeeded += 1,
            PlatformResult::Failed => self.summary.failed += 1,
            PlatformResult::Invalid => self.summary.invalid += 1,
            PlatformResult::NotAttempted => {}
        }
        debug!(target: "cook::scheduler", item = %id, %platform, ?result, "platform complete");
        self.events.publish(CookEvent::ItemCompleted {
            id: id.clone(),
            platform: platform.clone(),
            result,
        });
        Ok(())
    }

    /// Called after an item returned to idle at the end of a cycle.
    ///
    /// An item with platforms still needing work goes back to the request
    /// stage; a finished one is counted and, on a worker, reported.
    pub(crate) fn finish_cycle(&mut self, id: &ItemId) -> Result<()> {
        let item = self.table.require_mut(id)?;
        if item.state() != ItemState::Idle {
            return Err(CookError::InvariantViolation(format!(
                "{id}: cycle finished in state {}",
                item.state()
            )));
        }
        if item.cancel_requested {
            item.cancel_requested = false;
            return Ok(());
        }
        if !item.is_complete() {
            return self.enqueue_request(id, StateChangeReason::Retry);
        }
        self.items_finished += 1;
        if self.is_report_only() {
            self.emit_report(id)?;
        }
        Ok(())
    }

    /// Applies a load or save failure to one platform. Returns `true` when the
    /// platform gets another attempt.
    pub(crate) fn apply_leaf_failure(
        &mut self,
        id: &ItemId,
        platform: &Platform,
        error: &LeafError,
        stage: &'static str,
    ) -> Result<bool> {
        let max_retries = self.config.retry.max_transient_retries;
        let item = self.table.require_mut(id)?;
        item.discard_discovered(platform);
        item.logs.push(format!("{stage} failed for {platform}: {error}"));
        match error.class() {
            FailureClass::Transient => {
                if item.note_transient_failure(platform, max_retries) {
                    self.summary.retries += 1;
                    warn!(target: "cook::scheduler", item = %id, %platform, stage, %error, "transient failure, retrying");
                    return Ok(true);
                }
                warn!(target: "cook::scheduler", item = %id, %platform, stage, %error, "transient failure repeated, giving up");
                self.complete_platform(id, platform, PlatformResult::Failed)?;
            }
            FailureClass::Content => {
                let chain = self.table.instigator_chain(id);
                error!(
                    target: "cook::scheduler",
                    item = %id,
                    %platform,
                    stage,
                    %error,
                    instigators = %chain.join(" | "),
                    "content error"
                );
                self.complete_platform(id, platform, PlatformResult::Failed)?;
            }
            FailureClass::Invalid => {
                info!(target: "cook::scheduler", item = %id, %platform, %error, "not cookable for platform");
                self.complete_platform(id, platform, PlatformResult::Invalid)?;
            }
        }
        Ok(false)
    }

    /// Commits one platform's artifact: persisted locally or buffered for the
    /// director.
    pub(crate) fn commit_artifact(
        &mut self,
        id: &ItemId,
        platform: &Platform,
        artifact: Vec<u8>,
        metadata: ArtifactMetadata,
    ) -> std::result::Result<(), LeafError> {
        match &mut self.mode {
            SessionMode::Local { sink } => sink.persist(id, platform, &artifact, &metadata),
            SessionMode::ReportOnly { artifacts, .. } => {
                let buffered = artifacts.entry(id.clone()).or_default();
                buffered.retain(|(p, _)| p != platform);
                buffered.push((
                    platform.clone(),
                    ArtifactPayload {
                        bytes: artifact,
                        metadata,
                    },
                ));
                Ok(())
            }
        }
    }

    fn emit_report(&mut self, id: &ItemId) -> Result<()> {
        let item = self.table.require_mut(id)?;
        let discovered = item.take_discovered().into_iter().collect();
        let logs = std::mem::take(&mut item.logs);
        let input_hash = item.input_hash;
        let results: Vec<(Platform, PlatformResult)> = item
            .results()
            .iter()
            .map(|(p, r)| (p.clone(), *r))
            .collect();
        // a reassigned item starts from scratch
        self.table.remove(id);

        let SessionMode::ReportOnly { artifacts, reports } = &mut self.mode else {
            return Ok(());
        };
        let mut buffered = artifacts.remove(id).unwrap_or_default();
        let platforms = results
            .into_iter()
            .map(|(platform, result)| {
                let artifact = buffered
                    .iter()
                    .position(|(p, _)| *p == platform)
                    .map(|pos| buffered.swap_remove(pos).1);
                PlatformOutcome {
                    platform,
                    result,
                    artifact,
                }
            })
            .collect();
        reports.push(PackageResult {
            id: id.clone(),
            platforms,
            discovered,
            logs,
            input_hash,
        });
        Ok(())
    }

    pub(crate) fn take_reports(&mut self) -> Vec<PackageResult> {
        match &mut self.mode {
            SessionMode::ReportOnly { reports, .. } => std::mem::take(reports),
            SessionMode::Local { .. } => Vec::new(),
        }
    }

    fn drop_buffered(&mut self, id: &ItemId) {
        if let SessionMode::ReportOnly { artifacts, .. } = &mut self.mode {
            artifacts.remove(id);
        }
    }

    /// Returns a locally owned item to idle without recording a result.
    /// Items owned by a worker are left alone; the director handles those.
    pub(crate) fn cancel_local(&mut self, id: &ItemId, reason: StateChangeReason) -> Result<bool> {
        let Some(item) = self.table.get(id) else {
            return Ok(false);
        };
        let state = item.state();
        match state {
            ItemState::Idle
            | ItemState::AssignedToWorker
            | ItemState::SaveStalledAssignedToWorker => return Ok(false),
            ItemState::Request => {
                self.requests.remove(id);
                self.build_requests.remove(id);
            }
            ItemState::Load => {
                self.loads.remove(id);
            }
            ItemState::SaveActive | ItemState::SaveStalledRetracted => {
                self.saves.remove(id);
            }
        }
        let item = self.table.require_mut(id)?;
        let pending: Vec<Platform> = item.pending_platforms.drain(..).collect();
        for platform in &pending {
            item.discard_discovered(platform);
        }
        self.drop_buffered(id);
        self.table.transition(id, ItemState::Idle, reason, &self.events)?;
        debug!(target: "cook::scheduler", item = %id, from = %state, ?reason, "returned to idle");
        Ok(true)
    }

    /// Worker side of a retraction: partial output is thrown away and the
    /// item forgotten so a later assignment starts clean.
    pub(crate) fn retract_local(&mut self, id: &ItemId) -> Result<()> {
        if let Some(item) = self.table.get(id)
            && item.state() == ItemState::SaveActive
        {
            self.saves.remove(id);
            self.table.transition(
                id,
                ItemState::SaveStalledRetracted,
                StateChangeReason::Retracted,
                &self.events,
            )?;
        }
        self.cancel_local(id, StateChangeReason::Retracted)?;
        self.drop_buffered(id);
        self.table.remove(id);
        Ok(())
    }

    /// Every locally owned in-flight item back to idle.
    pub(crate) fn abandon_local_work(&mut self, reason: StateChangeReason) -> Result<usize> {
        let ids: Vec<ItemId> = self
            .table
            .iter()
            .filter(|item| item.state().is_in_progress())
            .map(|item| item.id().clone())
            .collect();
        let mut abandoned = 0;
        for id in ids {
            if self.cancel_local(&id, reason)? {
                abandoned += 1;
            }
        }
        Ok(abandoned)
    }

    /// Evicts items that hold loaded content but have not started saving.
    /// `quota` maps the number of such items to how many to release. Evicted
    /// items lose their content and go back to the front of the request stage.
    pub(crate) fn evict_loaded(&mut self, quota: impl FnOnce(usize) -> usize) -> Result<usize> {
        let mut candidates: Vec<ItemId> = self
            .loads
            .snapshot()
            .into_iter()
            .filter(|id| {
                self.table
                    .get(id)
                    .is_some_and(|item| item.state() == ItemState::Load && item.has_content())
            })
            .collect();
        let quota = quota(candidates.len());
        // most recently queued first
        candidates.reverse();
        candidates.truncate(quota);

        for id in &candidates {
            self.loads.remove(id);
            self.table
                .transition(id, ItemState::Idle, StateChangeReason::Evicted, &self.events)?;
            self.table
                .transition(id, ItemState::Request, StateChangeReason::Evicted, &self.events)?;
            let item = self.table.require(id)?;
            let (urgency, reachability) = (item.urgency, item.reachability);
            self.request_queue_for(reachability)
                .push_front(id.clone(), urgency);
        }
        Ok(candidates.len())
    }

    /// Items holding content the provider is not ready to release.
    pub(crate) fn unreleasable_items(&self) -> Vec<ItemId> {
        self.table
            .iter()
            .filter_map(|item| {
                let content = item.content()?;
                (!self.provider.can_release(item.id(), content)).then(|| item.id().clone())
            })
            .collect()
    }

    /// Saves waiting on leaf readiness since before `cutoff`.
    pub(crate) fn stalled_saves(&self, cutoff: Instant) -> Vec<ItemId> {
        let mut stalled: Vec<ItemId> = self
            .table
            .iter()
            .filter(|item| {
                item.state() == ItemState::SaveActive
                    && item.awaiting_since.is_some_and(|since| since <= cutoff)
            })
            .map(|item| item.id().clone())
            .collect();
        stalled.sort();
        stalled
    }
}
