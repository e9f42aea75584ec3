//! The single-threaded scheduler that drives a cook session.

use std::{
    fmt,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::{
    distrib::{director::Director, transport::Connection, worker_handle::ConnectionState},
    error::{CookError, Result},
    types::{ItemId, Platform, WorkerId},
};

use super::{
    cache::{BuildCache, BuildCacheEntry, BuildCacheStore, CacheLookup, MemoryCacheStore},
    cluster,
    config::CookerConfig,
    events::CookEvent,
    gc::{self, CollectionReport, CollectionRequest, Collector, GcController, MemoryProbe, NoopCollector},
    item::{DiscoveredDependency, Instigator, PlatformResult, Reachability, Urgency},
    leaf::{ArtifactSink, ContentProvider},
    pollable::{PollableKind, Pollables},
    session::{Session, SessionMode},
    state::{ItemState, StateChangeReason},
};

/// Aggregate counters for a session. Result counts are per (item, platform).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CookSummary {
    pub succeeded: u64,
    pub failed: u64,
    pub invalid: u64,
    pub cache_hits: u64,
    pub loads: u64,
    pub saves: u64,
    pub retries: u64,
    pub remote_results: u64,
    pub collections: u64,
    /// Distinct items with at least one failed or invalid platform.
    pub failed_items: u64,
}

impl CookSummary {
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0 && self.invalid == 0
    }

    /// Process exit status for the session.
    pub fn exit_code(&self) -> i32 {
        if self.all_succeeded() { 0 } else { 1 }
    }
}

/// What the scheduler spent a tick on, in decision priority order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CookAction {
    /// No item is in flight and no request is pending.
    Done,
    Intake,
    ProcessRequests,
    PumpLoad,
    PumpSave,
    Distribution,
    Pollables,
    /// Only asynchronous work is outstanding; the tick slept.
    Waiting,
}

/// Requests accepted from other threads.
#[derive(Clone, Debug)]
pub enum CookerCommand {
    Request {
        id: ItemId,
        platforms: Vec<Platform>,
        urgency: Urgency,
        instigator: Instigator,
    },
    Cancel(ItemId),
    ForceRecook(ItemId),
    Shutdown,
}

/// Cloneable entry point into a running cooker.
#[derive(Clone, Debug)]
pub struct CookerHandle {
    commands: mpsc::UnboundedSender<CookerCommand>,
}

impl CookerHandle {
    fn send(&self, command: CookerCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| CookError::Cancelled("cooker has stopped".into()))
    }

    pub fn request_item(
        &self,
        id: impl Into<ItemId>,
        platforms: &[Platform],
        urgency: Urgency,
        instigator: Instigator,
    ) -> Result<()> {
        self.send(CookerCommand::Request {
            id: id.into(),
            platforms: platforms.to_vec(),
            urgency,
            instigator,
        })
    }

    pub fn cancel(&self, id: impl Into<ItemId>) -> Result<()> {
        self.send(CookerCommand::Cancel(id.into()))
    }

    pub fn force_recook(&self, id: impl Into<ItemId>) -> Result<()> {
        self.send(CookerCommand::ForceRecook(id.into()))
    }

    pub fn shutdown(&self) -> Result<()> {
        self.send(CookerCommand::Shutdown)
    }
}

/// A cook session: owns the item table, queues and cache, and runs the tick
/// loop on the calling thread.
pub struct Cooker {
    session: Session,
    director: Option<Director>,
    gc: GcController,
    collector: Box<dyn Collector>,
    pending_collection: Option<CollectionRequest>,
    pollables: Pollables,
    commands_tx: mpsc::UnboundedSender<CookerCommand>,
    commands_rx: mpsc::UnboundedReceiver<CookerCommand>,
    build_phase_announced: bool,
    complete_announced: bool,
    stopped: bool,
    started: Instant,
}

impl fmt::Debug for Cooker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cooker")
            .field("session", &self.session)
            .field("director", &self.director)
            .field("gc", &self.gc)
            .field("pending_collection", &self.pending_collection)
            .field("stopped", &self.stopped)
            .finish_non_exhaustive()
    }
}

impl Cooker {
    pub fn new(
        config: CookerConfig,
        provider: Arc<dyn ContentProvider>,
        sink: Arc<dyn ArtifactSink>,
        cache_store: Box<dyn BuildCacheStore>,
    ) -> Self {
        let cache = BuildCache::new(cache_store, config.cache.version, config.cache.incremental);
        let session = Session::new(config, provider, SessionMode::Local { sink }, cache);
        Self::from_session(session)
    }

    /// Worker-side cooker: caching off, artifacts and discoveries buffered
    /// for the director instead of committed.
    pub(crate) fn report_only(mut config: CookerConfig, provider: Arc<dyn ContentProvider>) -> Self {
        config.cache.incremental = false;
        let cache = BuildCache::new(Box::new(MemoryCacheStore::new()), config.cache.version, false);
        let mode = SessionMode::ReportOnly {
            artifacts: Default::default(),
            reports: Vec::new(),
        };
        Self::from_session(Session::new(config, provider, mode, cache))
    }

    fn from_session(session: Session) -> Self {
        let now = Instant::now();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let gc = GcController::new(session.config.gc, gc::default_probe(), now);
        let mut pollables = Pollables::new();
        pollables.register(PollableKind::GcCheck, session.config.gc.check_interval(), now);
        pollables.register(
            PollableKind::Summary,
            session.config.session.summary_interval(),
            now,
        );
        Self {
            session,
            director: None,
            gc,
            collector: Box::new(NoopCollector),
            pending_collection: None,
            pollables,
            commands_tx,
            commands_rx,
            build_phase_announced: false,
            complete_announced: false,
            stopped: false,
            started: now,
        }
    }

    pub fn with_collector(mut self, collector: Box<dyn Collector>) -> Self {
        self.collector = collector;
        self
    }

    pub fn with_memory_probe(mut self, probe: Box<dyn MemoryProbe>) -> Self {
        self.gc.set_probe(probe);
        self
    }

    /// Turns this cooker into a director delegating to the given workers.
    pub fn with_workers(mut self, connections: Vec<Box<dyn Connection>>) -> Self {
        let now = Instant::now();
        let distribution = self.session.config.distribution.clone();
        let mut director = Director::new(distribution.clone(), now);
        for connection in connections {
            director.add_worker(connection, now);
        }
        self.pollables
            .register(PollableKind::Heartbeat, distribution.heartbeat_interval(), now);
        self.pollables
            .register(PollableKind::Rebalance, distribution.heartbeat_interval(), now);
        if let Some(after) = distribution.offload_stalled_save_after() {
            self.pollables
                .register(PollableKind::OffloadStalledSaves, after.min(distribution.heartbeat_interval()), now);
        }
        self.director = Some(director);
        self
    }

    /// Pumps the director until every worker has connected or `timeout`
    /// passes. Returns the number of connected workers.
    pub fn await_workers(&mut self, timeout: Duration) -> Result<usize> {
        let Some(director) = self.director.as_mut() else {
            return Ok(0);
        };
        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            director.pump(&mut self.session, now)?;
            if director.connecting() == 0 || now >= deadline {
                let connected = director
                    .worker_states()
                    .into_iter()
                    .filter(|(_, state)| *state == ConnectionState::Connected)
                    .count();
                info!(target: "cook::director", connected, "workers ready");
                return Ok(connected);
            }
            thread::sleep(idle_backoff(&self.session.config));
        }
    }

    pub fn worker_states(&self) -> Vec<(WorkerId, ConnectionState)> {
        self.director
            .as_ref()
            .map(Director::worker_states)
            .unwrap_or_default()
    }

    pub fn config(&self) -> &CookerConfig {
        &self.session.config
    }

    pub fn handle(&self) -> CookerHandle {
        CookerHandle {
            commands: self.commands_tx.clone(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CookEvent> {
        self.session.events.subscribe()
    }

    /// Enqueues a root request. Absorbed by the next tick's intake.
    pub fn request_item(
        &self,
        id: impl Into<ItemId>,
        platforms: &[Platform],
        urgency: Urgency,
        instigator: Instigator,
    ) -> Result<()> {
        self.handle().request_item(id, platforms, urgency, instigator)
    }

    pub fn cancel(&self, id: impl Into<ItemId>) -> Result<()> {
        self.handle().cancel(id)
    }

    pub fn force_recook(&self, id: impl Into<ItemId>) -> Result<()> {
        self.handle().force_recook(id)
    }

    pub fn item_state(&self, id: &ItemId) -> Option<ItemState> {
        self.session.table.get(id).map(|item| item.state())
    }

    pub fn item_result(&self, id: &ItemId, platform: &Platform) -> PlatformResult {
        self.session
            .table
            .get(id)
            .map(|item| item.result(platform))
            .unwrap_or_default()
    }

    /// Dependencies parked on an item and not yet requested.
    pub fn discovered(&self, id: &ItemId, platform: &Platform) -> Vec<DiscoveredDependency> {
        self.session
            .table
            .get(id)
            .map(|item| item.discovered(platform).to_vec())
            .unwrap_or_default()
    }

    pub fn assigned_worker(&self, id: &ItemId) -> Option<WorkerId> {
        self.session.table.get(id).and_then(|item| item.assigned_worker)
    }

    pub fn instigator_chain(&self, id: &ItemId) -> Vec<String> {
        self.session.table.instigator_chain(id)
    }

    pub fn summary(&self) -> CookSummary {
        let mut summary = self.session.summary.clone();
        summary.collections = self.gc.collections();
        summary.failed_items = self
            .session
            .table
            .iter()
            .filter(|item| {
                item.results()
                    .values()
                    .any(|r| matches!(r, PlatformResult::Failed | PlatformResult::Invalid))
            })
            .count() as u64;
        summary
    }

    pub(crate) fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    /// Drives ticks until the session completes.
    pub fn run(&mut self) -> Result<CookSummary> {
        info!(target: "cook::scheduler", "cook session started");
        loop {
            match self.tick() {
                Ok(CookAction::Done) => break,
                Ok(_) => {}
                Err(err) => {
                    if err.is_fatal() {
                        error!(target: "cook::scheduler", error = %err, "fatal error, aborting session");
                        if let Err(abort_err) = self.abort() {
                            warn!(target: "cook::scheduler", error = %abort_err, "abort after fatal error failed");
                        }
                    }
                    return Err(err);
                }
            }
        }
        let summary = self.summary();
        info!(
            target: "cook::summary",
            succeeded = summary.succeeded,
            failed = summary.failed,
            invalid = summary.invalid,
            cache_hits = summary.cache_hits,
            loads = summary.loads,
            saves = summary.saves,
            collections = summary.collections,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "cook session finished"
        );
        Ok(summary)
    }

    /// Ends the session early: in-flight work is dropped without results and
    /// workers are told to abort.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.stopped {
            return Ok(());
        }
        self.abort()
    }

    fn abort(&mut self) -> Result<()> {
        self.stopped = true;
        let abandoned = self.session.abandon_local_work(StateChangeReason::Shutdown)?;
        for queue in [
            &mut self.session.requests,
            &mut self.session.build_requests,
            &mut self.session.loads,
            &mut self.session.saves,
        ] {
            queue.clear();
        }
        if let Some(director) = self.director.as_mut() {
            director.shutdown(&mut self.session)?;
        }
        info!(target: "cook::scheduler", abandoned, "cook session shut down");
        Ok(())
    }

    fn is_session_complete(&self) -> bool {
        self.session.is_drained()
            && self.commands_rx.is_empty()
            && self.director.as_ref().is_none_or(Director::is_idle)
    }

    /// Runs one scheduler iteration.
    pub fn tick(&mut self) -> Result<CookAction> {
        let now = Instant::now();
        if self.stopped {
            return Ok(CookAction::Done);
        }

        if self.is_session_complete() {
            let finished = match self.director.as_mut() {
                Some(director) => director.finish(&mut self.session, now)?,
                None => true,
            };
            if finished {
                if !self.complete_announced {
                    self.complete_announced = true;
                    self.session.events.publish(CookEvent::SessionComplete);
                }
                return Ok(CookAction::Done);
            }
            thread::sleep(self.session.config.queue.idle_sleep());
            return Ok(CookAction::Waiting);
        }
        self.complete_announced = false;

        let mut action: Option<CookAction> = None;
        if self.intake()? {
            action.get_or_insert(CookAction::Intake);
        }
        if self.stopped {
            return Ok(CookAction::Done);
        }

        let queue = &self.session.config.queue;
        let (desired_load, desired_save, slice) = (
            queue.desired_load_population,
            queue.desired_save_population,
            queue.pump_slice(),
        );
        if self.session.loads.len() < desired_load && self.process_requests()? {
            action.get_or_insert(CookAction::ProcessRequests);
        }

        self.absorb_finished_items();
        self.session.finish_budget = match self.pending_collection {
            Some(_) => None,
            None => self.gc.items_until_collection(),
        };

        let mut save_pumped = false;
        if self.session.saves.len() >= desired_save {
            save_pumped = true;
            if self.session.pump_save(Instant::now() + slice)? {
                action.get_or_insert(CookAction::PumpSave);
            }
        }
        if !self.session.loads.is_empty()
            && !self.session.finish_budget_spent()
            && self.session.pump_load(Instant::now() + slice)?
        {
            action.get_or_insert(CookAction::PumpLoad);
        }
        if !save_pumped
            && !self.session.saves.is_empty()
            && !self.session.finish_budget_spent()
            && self.session.pump_save(Instant::now() + slice)?
        {
            action.get_or_insert(CookAction::PumpSave);
        }

        if let Some(director) = self.director.as_mut()
            && director.pump(&mut self.session, now)?
        {
            action.get_or_insert(CookAction::Distribution);
        }

        self.absorb_finished_items();
        self.session.finish_budget = None;
        if action.is_some() {
            self.gc.note_progress(now);
        }
        if self.run_pollables(Instant::now())? {
            action.get_or_insert(CookAction::Pollables);
        }

        match action {
            Some(action) => Ok(action),
            None => {
                let sleep = self
                    .pollables
                    .next_due_in(Instant::now())
                    .map_or(self.session.config.queue.idle_sleep(), |due| {
                        due.min(self.session.config.queue.idle_sleep())
                    });
                if !sleep.is_zero() {
                    thread::sleep(sleep);
                }
                Ok(CookAction::Waiting)
            }
        }
    }

    fn absorb_finished_items(&mut self) {
        for _ in 0..std::mem::take(&mut self.session.items_finished) {
            self.gc.note_item_completed();
        }
    }

    fn intake(&mut self) -> Result<bool> {
        let max = self.session.config.queue.max_intake_batch.max(1);
        let mut handled = 0;
        while handled < max {
            let Ok(command) = self.commands_rx.try_recv() else {
                break;
            };
            handled += 1;
            self.apply_command(command)?;
            if self.stopped {
                break;
            }
        }
        Ok(handled > 0)
    }

    fn apply_command(&mut self, command: CookerCommand) -> Result<()> {
        match command {
            CookerCommand::Request {
                id,
                platforms,
                urgency,
                instigator,
            } => {
                if platforms.is_empty() {
                    warn!(target: "cook::scheduler", item = %id, "request without platforms ignored");
                    return Ok(());
                }
                self.session.request(&id, &platforms, urgency, instigator)?;
            }
            CookerCommand::Cancel(id) => self.cancel_item(&id)?,
            CookerCommand::ForceRecook(id) => self.recook_item(&id)?,
            CookerCommand::Shutdown => self.shutdown()?,
        }
        Ok(())
    }

    fn cancel_item(&mut self, id: &ItemId) -> Result<()> {
        match self.item_state(id) {
            None | Some(ItemState::Idle) => {}
            Some(ItemState::AssignedToWorker | ItemState::SaveStalledAssignedToWorker) => {
                if let Some(director) = self.director.as_mut() {
                    director.cancel(&mut self.session, id)?;
                }
            }
            Some(_) => {
                self.session.cancel_local(id, StateChangeReason::Cancelled)?;
                info!(target: "cook::scheduler", item = %id, "cancelled");
            }
        }
        Ok(())
    }

    /// Clears an item's results and cache entries, drops its generated
    /// sub-items and requests it again for the same platforms.
    fn recook_item(&mut self, id: &ItemId) -> Result<()> {
        let Some(item) = self.session.table.get(id) else {
            warn!(target: "cook::scheduler", item = %id, "force re-cook of unknown item ignored");
            return Ok(());
        };
        if matches!(
            item.state(),
            ItemState::AssignedToWorker | ItemState::SaveStalledAssignedToWorker
        ) {
            warn!(target: "cook::scheduler", item = %id, "item is delegated to a worker; re-cook it after it completes");
            return Ok(());
        }
        self.session.cancel_local(id, StateChangeReason::Cancelled)?;

        let item = self.session.table.require_mut(id)?;
        let platforms: Vec<Platform> = item.requested_platforms().iter().cloned().collect();
        let generated = std::mem::take(&mut item.generated);
        let (urgency, instigator) = (item.urgency, item.instigator.clone());
        item.reset_results();

        for child in &generated {
            self.session.cancel_local(child, StateChangeReason::Cancelled)?;
            for platform in &platforms {
                self.session.cache.invalidate(child, platform)?;
            }
            if self.session.table.remove(child).is_none() {
                debug!(target: "cook::scheduler", item = %child, "generated item still delegated; kept");
            }
        }
        for platform in &platforms {
            self.session.cache.invalidate(id, platform)?;
        }
        info!(target: "cook::scheduler", item = %id, dropped_generated = generated.len(), "forced re-cook");
        self.session.request(id, &platforms, urgency, instigator)?;
        Ok(())
    }

    /// True when no runtime-reachable item is queued or in flight.
    fn runtime_phase_drained(&self) -> bool {
        self.session.requests.is_empty()
            && !self.session.table.iter().any(|item| {
                item.reachability == Reachability::Runtime && item.state().is_in_progress()
            })
    }

    fn process_requests(&mut self) -> Result<bool> {
        let max = self.session.config.queue.max_request_batch.max(1);
        let batch = if !self.session.requests.is_empty() {
            self.session.requests.pop_batch(max)
        } else if !self.session.build_requests.is_empty() && self.runtime_phase_drained() {
            if !self.build_phase_announced {
                self.build_phase_announced = true;
                info!(
                    target: "cook::scheduler",
                    pending = self.session.build_requests.len(),
                    "runtime phase complete, cooking build dependencies"
                );
            }
            self.session.build_requests.pop_batch(max)
        } else {
            return Ok(false);
        };

        let provider = Arc::clone(&self.session.provider);
        let ordered = cluster::leaf_first(&batch, |id| provider.dependencies(id));
        for id in &ordered {
            self.classify(id)?;
        }
        Ok(!ordered.is_empty())
    }

    /// Resolves which platforms still need work, applies cache hits, and
    /// routes the rest to a worker or to the local load stage.
    fn classify(&mut self, id: &ItemId) -> Result<()> {
        let item = self.session.table.require(id)?;
        if item.state() != ItemState::Request {
            return Ok(());
        }
        let pending = item.platforms_needing_cook();

        let mut remaining = Vec::with_capacity(pending.len());
        for platform in pending {
            let lookup = self
                .session
                .cache
                .lookup(id, &platform, self.session.provider.as_ref())?;
            match lookup {
                CacheLookup::Hit(entry) => self.apply_cache_hit(id, &platform, &entry)?,
                CacheLookup::Miss(_) => remaining.push(platform),
            }
        }

        if remaining.is_empty() {
            self.session
                .table
                .transition(id, ItemState::Idle, StateChangeReason::CacheHit, &self.session.events)?;
            return self.session.finish_cycle(id);
        }

        let item = self.session.table.require_mut(id)?;
        item.pending_platforms = remaining.into();
        let urgency = item.urgency;

        let worker = match self.director.as_mut() {
            Some(director) => director.try_assign(&self.session, id)?,
            None => None,
        };
        match worker {
            Some(worker) => {
                self.session.table.transition(
                    id,
                    ItemState::AssignedToWorker,
                    StateChangeReason::Assigned,
                    &self.session.events,
                )?;
                self.session.table.require_mut(id)?.assigned_worker = Some(worker);
            }
            None => {
                self.session.table.transition(
                    id,
                    ItemState::Load,
                    StateChangeReason::Classified,
                    &self.session.events,
                )?;
                self.session.loads.push(id.clone(), urgency);
            }
        }
        Ok(())
    }

    fn apply_cache_hit(&mut self, id: &ItemId, platform: &Platform, entry: &BuildCacheEntry) -> Result<()> {
        self.session.summary.cache_hits += 1;
        self.session.record_cached_discoveries(id, platform, entry)?;
        self.session
            .complete_platform(id, platform, PlatformResult::Succeeded)?;
        self.session.flush_discoveries(id, platform)?;
        Ok(())
    }

    fn run_pollables(&mut self, now: Instant) -> Result<bool> {
        if self.pending_collection.is_none() && self.gc.item_threshold_reached() {
            self.pending_collection = self.gc.evaluate(now);
        }
        for kind in self.pollables.take_due(now) {
            match kind {
                PollableKind::GcCheck => {
                    if self.pending_collection.is_none() {
                        self.pending_collection = self.gc.evaluate(now);
                    }
                }
                PollableKind::Heartbeat => {
                    if let Some(director) = self.director.as_mut() {
                        director.heartbeat(&mut self.session, now)?;
                    }
                }
                PollableKind::Rebalance => {
                    if let Some(director) = self.director.as_mut() {
                        director.rebalance(&mut self.session)?;
                    }
                }
                PollableKind::OffloadStalledSaves => {
                    if let Some(director) = self.director.as_mut() {
                        director.offload_stalled(&mut self.session, now)?;
                    }
                }
                PollableKind::Summary => self.log_progress(),
            }
        }
        match self.pending_collection {
            Some(request) => self.collect(request),
            None => Ok(false),
        }
    }

    /// Runs a collection if every loaded item may be released. Pumps never
    /// return in the middle of an item, so this is always a safe point.
    fn collect(&mut self, request: CollectionRequest) -> Result<bool> {
        let blocked = self.session.unreleasable_items();
        if !blocked.is_empty() {
            debug!(target: "cook::gc", blocked = blocked.len(), "collection deferred, content not releasable");
            return Ok(false);
        }
        let start = Instant::now();
        let evicted = if request.evicts() {
            self.session
                .evict_loaded(|candidates| request.eviction_quota(candidates))?
        } else {
            0
        };
        let released = self.collector.collect(&request);
        let report = CollectionReport { evicted, released };
        let finished = Instant::now();
        self.gc
            .finish(&request, &report, finished.duration_since(start), finished);
        self.pending_collection = None;
        self.session.events.publish(CookEvent::CollectionFinished {
            full: request.full,
            evicted,
        });
        Ok(true)
    }

    fn log_progress(&self) {
        let summary = &self.session.summary;
        info!(
            target: "cook::summary",
            items = self.session.table.len(),
            in_progress = self.session.table.in_progress(),
            requests = self.session.requests.len() + self.session.build_requests.len(),
            loads = self.session.loads.len(),
            saves = self.session.saves.len(),
            delegated = self.director.as_ref().map_or(0, Director::assigned_count),
            succeeded = summary.succeeded,
            failed = summary.failed,
            cache_hits = summary.cache_hits,
            "cook progress"
        );
    }
}

/// Sleep used by loops that poll a cooker from outside.
pub(crate) fn idle_backoff(config: &CookerConfig) -> Duration {
    config.queue.idle_sleep().max(Duration::from_millis(1))
}
