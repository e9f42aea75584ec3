//! Director side of a distributed cook.
//!
//! The director owns the authoritative item table. Workers get items in
//! batches, report results back, and are watched with heartbeats. Anything a
//! worker held when it died, was rebalanced away from, or was cancelled on,
//! returns to the director's scheduler and is requested again as needed.
//!
//! Ownership rules:
//! - an item is owned by at most one worker (`owners`);
//! - results are applied only from the current owner, and never for an item
//!   with a cancel in flight;
//! - a cancel completes when the worker echoes the heartbeat sent after the
//!   abort, or when the worker dies.

use std::{
    collections::HashMap,
    fmt, thread,
    time::{Duration, Instant},
};

use tracing::{debug, error, info, warn};

use crate::{
    cook::{
        cache::CacheRecord,
        config::DistributionConfig,
        item::{DependencyKind, PlatformResult},
        leaf::SaveOutput,
        session::Session,
        state::{ItemState, StateChangeReason},
    },
    error::{CookError, Result},
    types::{ItemId, Platform, WorkerId},
};

use super::{
    message::*,
    transport::{Connection, Inbound},
    worker_handle::{AbortFence, ConnectionState, WorkerHandle},
};

/// Poll interval while waiting on workers during shutdown.
const SHUTDOWN_POLL: Duration = Duration::from_millis(5);

/// Director side of a distributed cook: assignment, heartbeats, fences and
/// result application.
pub struct Director {
    config: DistributionConfig,
    workers: Vec<WorkerHandle>,
    owners: HashMap<ItemId, WorkerId>,
    next_heartbeat: u64,
    finishing_since: Option<Instant>,
}

impl fmt::Debug for Director {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Director")
            .field("workers", &self.workers)
            .field("assigned", &self.owners.len())
            .field("finishing", &self.finishing_since.is_some())
            .finish()
    }
}

impl Director {
    pub fn new(config: DistributionConfig, _now: Instant) -> Self {
        Self {
            config,
            workers: Vec::new(),
            owners: HashMap::new(),
            next_heartbeat: 0,
            finishing_since: None,
        }
    }

    /// Registers a worker connection. The worker must `connect` before it
    /// gets any work.
    pub fn add_worker(&mut self, connection: Box<dyn Connection>, now: Instant) -> WorkerId {
        let id = WorkerId(self.workers.len() as u32 + 1);
        info!(target: "cook::director", worker = %id, peer = %connection.peer(), "worker registered");
        self.workers.push(WorkerHandle::new(id, connection, now));
        id
    }

    pub fn worker_states(&self) -> Vec<(WorkerId, ConnectionState)> {
        self.workers
            .iter()
            .map(|worker| (worker.id(), worker.state()))
            .collect()
    }

    /// Workers that have not sent `connect` yet.
    pub fn connecting(&self) -> usize {
        self.workers
            .iter()
            .filter(|worker| worker.state() == ConnectionState::Connecting)
            .count()
    }

    /// No item is owned by any worker.
    pub fn is_idle(&self) -> bool {
        self.owners.is_empty()
    }

    pub fn assigned_count(&self) -> usize {
        self.owners.len()
    }

    fn index_of(&self, id: WorkerId) -> Option<usize> {
        self.workers.iter().position(|worker| worker.id() == id)
    }

    fn next_heartbeat(&mut self) -> u64 {
        self.next_heartbeat += 1;
        self.next_heartbeat
    }

    /// Picks a worker for a classified item and stages the assignment.
    /// Returns `None` when the item should be cooked locally.
    pub(crate) fn try_assign(&mut self, session: &Session, id: &ItemId) -> Result<Option<WorkerId>> {
        if self.finishing_since.is_some() {
            return Ok(None);
        }
        let depth = self.config.worker_queue_depth.max(1);
        let Some(index) = self
            .workers
            .iter()
            .enumerate()
            .filter(|(_, worker)| worker.accepts_work(depth))
            .min_by_key(|(_, worker)| (worker.assigned.len(), worker.id()))
            .map(|(index, _)| index)
        else {
            return Ok(None);
        };
        self.stage_on(session, index, id)?;
        Ok(Some(self.workers[index].id()))
    }

    fn stage_on(&mut self, session: &Session, index: usize, id: &ItemId) -> Result<()> {
        let worker_id = self.workers[index].id();
        if let Some(owner) = self.owners.get(id) {
            return Err(CookError::InvariantViolation(format!(
                "{id}: assigned to {worker_id} while owned by {owner}"
            )));
        }
        let item = session.table.require(id)?;
        let assigned = AssignedItem {
            id: id.clone(),
            platforms: item.pending_platforms.iter().cloned().collect(),
            urgency: item.urgency,
            instigator: item.instigator.clone(),
        };
        // what the director already knows about the item's dependencies,
        // so the worker does not report edges that lead nowhere new
        let existence = session
            .provider
            .dependencies(id)
            .into_iter()
            .filter_map(|dep| {
                let known = session.table.get(&dep)?;
                let results: Vec<(Platform, PlatformResult)> = known
                    .results()
                    .iter()
                    .filter(|(_, result)| result.is_terminal())
                    .map(|(platform, result)| (platform.clone(), *result))
                    .collect();
                (!results.is_empty()).then_some(ExistenceInfo { id: dep, results })
            })
            .collect();
        self.workers[index].stage(assigned, existence);
        self.owners.insert(id.clone(), worker_id);
        debug!(target: "cook::director", item = %id, worker = %worker_id, "assigned");
        Ok(())
    }

    /// Exchanges messages with every worker. Returns whether anything arrived.
    pub(crate) fn pump(&mut self, session: &mut Session, now: Instant) -> Result<bool> {
        let mut progressed = false;
        for index in 0..self.workers.len() {
            while let Some(inbound) = self.workers[index].connection().try_recv() {
                progressed = true;
                self.handle_inbound(session, index, inbound, now)?;
            }

            let worker = &self.workers[index];
            match worker.state() {
                ConnectionState::Connecting
                    if worker.in_state_for(now) >= self.config.connect_timeout() =>
                {
                    self.mark_dead(session, index, "never connected", now)?;
                    continue;
                }
                ConnectionState::FlushingBeforeShutdown
                    if worker.in_state_for(now) >= self.config.abort_ack_timeout() =>
                {
                    warn!(target: "cook::director", worker = %worker.id(), "no acknowledgement of cook completion");
                    self.mark_dead(session, index, "unacknowledged shutdown", now)?;
                    continue;
                }
                _ => {}
            }

            if let Some(fence) = &self.workers[index].fence
                && now.saturating_duration_since(fence.sent_at) >= self.config.abort_ack_timeout()
            {
                warn!(target: "cook::director", worker = %self.workers[index].id(), "abort not acknowledged in time");
                self.mark_dead(session, index, "abort not acknowledged", now)?;
                continue;
            }

            if self.workers[index].state() == ConnectionState::Connected {
                progressed |= self.flush_outbox(session, index, now)?;
            }
        }
        Ok(progressed)
    }

    fn flush_outbox(&mut self, session: &mut Session, index: usize, now: Instant) -> Result<bool> {
        let batch = self.config.max_assignment_batch;
        let mut sent = false;
        while self.workers[index].has_staged() {
            let (items, existence) = self.workers[index].take_batch(batch);
            let count = items.len();
            let message = Message::AssignPackages(AssignPackages { items, existence });
            if let Err(err) = self.workers[index].send(&message) {
                warn!(target: "cook::director", worker = %self.workers[index].id(), error = %err, "assignment send failed");
                self.mark_dead(session, index, "send failed", now)?;
                return Ok(true);
            }
            debug!(target: "cook::director", worker = %self.workers[index].id(), count, "assignment batch sent");
            sent = true;
        }
        Ok(sent)
    }

    fn handle_inbound(
        &mut self,
        session: &mut Session,
        index: usize,
        inbound: Inbound,
        now: Instant,
    ) -> Result<()> {
        match inbound {
            Inbound::Message(message) => self.handle_message(session, index, message, now),
            Inbound::ProtocolError(reason) => self.note_protocol_error(session, index, &reason, now),
            Inbound::Closed => match self.workers[index].state() {
                ConnectionState::Disconnected => Ok(()),
                ConnectionState::FlushingBeforeShutdown => {
                    let (leftover, _) = self.workers[index].disconnect(now);
                    self.return_items(session, leftover, StateChangeReason::Retracted)
                }
                _ => self.mark_dead(session, index, "connection closed", now),
            },
        }
    }

    fn note_protocol_error(
        &mut self,
        session: &mut Session,
        index: usize,
        reason: &str,
        now: Instant,
    ) -> Result<()> {
        let worker = &mut self.workers[index];
        worker.protocol_errors += 1;
        warn!(
            target: "cook::director",
            worker = %worker.id(),
            errors = worker.protocol_errors,
            reason,
            "malformed message dropped"
        );
        if worker.protocol_errors > self.config.max_protocol_errors {
            self.mark_dead(session, index, "too many protocol errors", now)?;
        }
        Ok(())
    }

    fn handle_message(
        &mut self,
        session: &mut Session,
        index: usize,
        message: Message,
        now: Instant,
    ) -> Result<()> {
        let state = self.workers[index].state();
        if state == ConnectionState::Disconnected {
            return Ok(());
        }
        match message {
            Message::Connect(connect) => {
                if state != ConnectionState::Connecting {
                    return self.note_protocol_error(session, index, "duplicate connect", now);
                }
                let worker = &mut self.workers[index];
                if connect.protocol_version != PROTOCOL_VERSION {
                    warn!(
                        target: "cook::director",
                        worker = %worker.id(),
                        theirs = connect.protocol_version,
                        ours = PROTOCOL_VERSION,
                        "protocol version mismatch, rejecting worker"
                    );
                    if let Err(err) = worker.send(&Message::AbortWorker(AbortWorker {
                        kind: AbortKind::Abort,
                    })) {
                        warn!(target: "cook::director", worker = %worker.id(), error = %err, "failed to send abort");
                    }
                    return self.mark_dead(session, index, "protocol version mismatch", now);
                }
                worker.set_state(ConnectionState::Connected, now);
                info!(
                    target: "cook::director",
                    worker = %worker.id(),
                    reported_as = %connect.worker_id,
                    peer = %worker.peer(),
                    "worker connected"
                );
                Ok(())
            }
            _ if state == ConnectionState::Connecting => {
                self.note_protocol_error(session, index, "message before connect", now)
            }
            Message::Heartbeat(heartbeat) => {
                if let Some(fence) = self.workers[index].note_echo(heartbeat.number) {
                    let worker_id = self.workers[index].id();
                    for id in fence.cancelled {
                        self.complete_cancel(session, index, &id)?;
                    }
                    debug!(target: "cook::director", worker = %worker_id, heartbeat = fence.heartbeat, "abort fence cleared");
                }
                Ok(())
            }
            Message::PackageResults(results) => {
                for result in results.results {
                    self.apply_result(session, index, result)?;
                }
                Ok(())
            }
            Message::AbortWorker(AbortWorker {
                kind: AbortKind::AbortAcknowledge,
            }) => {
                info!(target: "cook::director", worker = %self.workers[index].id(), "worker acknowledged shutdown");
                let (leftover, _) = self.workers[index].disconnect(now);
                self.return_items(session, leftover, StateChangeReason::Retracted)
            }
            other => {
                let reason = format!("unexpected {} from worker", other.kind());
                self.note_protocol_error(session, index, &reason, now)
            }
        }
    }

    fn apply_result(&mut self, session: &mut Session, index: usize, result: PackageResult) -> Result<()> {
        let worker_id = self.workers[index].id();
        let id = result.id.clone();
        if self.owners.get(&id) != Some(&worker_id) {
            debug!(target: "cook::director", item = %id, worker = %worker_id, "stale result discarded");
            return Ok(());
        }
        let Some(item) = session.table.get(&id) else {
            return Err(CookError::InvariantViolation(format!(
                "{id}: owned by {worker_id} but not in the table"
            )));
        };
        if item.cancel_requested {
            debug!(target: "cook::director", item = %id, worker = %worker_id, "result for cancelled item discarded");
            return Ok(());
        }
        if !matches!(
            item.state(),
            ItemState::AssignedToWorker | ItemState::SaveStalledAssignedToWorker
        ) {
            return Err(CookError::InvariantViolation(format!(
                "{id}: owned by {worker_id} in state {}",
                item.state()
            )));
        }

        self.owners.remove(&id);
        self.workers[index].assigned.remove(&id);
        for line in &result.logs {
            info!(target: "cook::worker_log", worker = %worker_id, item = %id, "{line}");
        }
        apply_remote_result(session, worker_id, result)
    }

    /// Returns a cancelled item to idle once its worker can no longer
    /// produce results for it.
    fn complete_cancel(&mut self, session: &mut Session, index: usize, id: &ItemId) -> Result<()> {
        let worker_id = self.workers[index].id();
        if self.owners.get(id) != Some(&worker_id) {
            return Ok(());
        }
        self.owners.remove(id);
        self.workers[index].assigned.remove(id);
        let item = session.table.require_mut(id)?;
        item.assigned_worker = None;
        for platform in item.pending_platforms.drain(..).collect::<Vec<_>>() {
            item.discard_discovered(&platform);
        }
        session
            .table
            .transition(id, ItemState::Idle, StateChangeReason::Cancelled, &session.events)?;
        session.finish_cycle(id)?;
        info!(target: "cook::director", item = %id, worker = %worker_id, "cancel acknowledged");
        Ok(())
    }

    /// Treats a worker as gone and takes back everything it held.
    fn mark_dead(&mut self, session: &mut Session, index: usize, reason: &str, now: Instant) -> Result<()> {
        if self.workers[index].state() == ConnectionState::Disconnected {
            return Ok(());
        }
        let worker_id = self.workers[index].id();
        let (assigned, _fence) = self.workers[index].disconnect(now);
        warn!(
            target: "cook::director",
            worker = %worker_id,
            reason,
            retracted = assigned.len(),
            "worker presumed dead"
        );
        self.return_items(session, assigned, StateChangeReason::Retracted)
    }

    /// Moves worker-owned items back to the director's scheduler. Items
    /// with unfinished platforms are requested again; cancelled ones stay
    /// idle.
    fn return_items(
        &mut self,
        session: &mut Session,
        ids: Vec<ItemId>,
        reason: StateChangeReason,
    ) -> Result<()> {
        for id in ids {
            self.owners.remove(&id);
            let Some(item) = session.table.get_mut(&id) else {
                continue;
            };
            if !matches!(
                item.state(),
                ItemState::AssignedToWorker | ItemState::SaveStalledAssignedToWorker
            ) {
                continue;
            }
            item.assigned_worker = None;
            session
                .table
                .transition(&id, ItemState::Idle, reason, &session.events)?;
            session.finish_cycle(&id)?;
        }
        Ok(())
    }

    /// Sends heartbeats and declares silent workers dead.
    pub(crate) fn heartbeat(&mut self, session: &mut Session, now: Instant) -> Result<()> {
        for index in 0..self.workers.len() {
            let worker = &mut self.workers[index];
            if !matches!(
                worker.state(),
                ConnectionState::Connected | ConnectionState::FlushingBeforeShutdown
            ) {
                continue;
            }
            if worker.last_heartbeat_echoed < worker.last_heartbeat_sent {
                worker.missed_heartbeats += 1;
            }
            if worker.missed_heartbeats >= self.config.missed_heartbeats_before_dead {
                self.mark_dead(session, index, "missed heartbeats", now)?;
                continue;
            }
            let number = self.next_heartbeat();
            let worker = &mut self.workers[index];
            worker.last_heartbeat_sent = number;
            if let Err(err) = worker.send(&Message::Heartbeat(Heartbeat { number })) {
                warn!(target: "cook::director", worker = %worker.id(), error = %err, "heartbeat send failed");
                self.mark_dead(session, index, "send failed", now)?;
            }
        }
        Ok(())
    }

    /// Sends an abort for `ids` followed by a heartbeat that fences it.
    fn send_abort(&mut self, index: usize, ids: Vec<ItemId>, cancelled: Vec<ItemId>, now: Instant) -> Result<()> {
        let number = self.next_heartbeat();
        let worker = &mut self.workers[index];
        worker.send(&Message::AbortPackages(AbortPackages { ids }))?;
        worker.send(&Message::Heartbeat(Heartbeat { number }))?;
        worker.last_heartbeat_sent = number;
        let mut pending = worker.fence.take().map(|fence| fence.cancelled).unwrap_or_default();
        pending.extend(cancelled);
        worker.fence = Some(AbortFence {
            heartbeat: number,
            sent_at: now,
            cancelled: pending,
        });
        Ok(())
    }

    /// Moves work from the deepest worker to an idle one when the
    /// imbalance exceeds the configured threshold.
    pub(crate) fn rebalance(&mut self, session: &mut Session) -> Result<()> {
        let threshold = self.config.rebalance_threshold;
        if threshold == 0 || self.finishing_since.is_some() {
            return Ok(());
        }
        let depth = self.config.worker_queue_depth.max(1);
        let candidates: Vec<usize> = (0..self.workers.len())
            .filter(|&index| {
                let worker = &self.workers[index];
                worker.state() == ConnectionState::Connected && worker.fence.is_none()
            })
            .collect();
        let Some(&idle) = candidates
            .iter()
            .find(|&&index| self.workers[index].is_empty() && self.workers[index].accepts_work(depth))
        else {
            return Ok(());
        };
        let Some(&busiest) = candidates
            .iter()
            .max_by_key(|&&index| self.workers[index].assigned.len())
        else {
            return Ok(());
        };
        let (deep, shallow) = (
            self.workers[busiest].assigned.len(),
            self.workers[idle].assigned.len(),
        );
        if busiest == idle || deep <= shallow + threshold {
            return Ok(());
        }

        let count = (deep - shallow) / 2;
        let movable: Vec<ItemId> = self.workers[busiest]
            .assigned
            .iter()
            .rev()
            .filter(|id| {
                session.table.get(id).is_some_and(|item| {
                    item.state() == ItemState::AssignedToWorker && !item.cancel_requested
                })
            })
            .take(count)
            .cloned()
            .collect();
        if movable.is_empty() {
            return Ok(());
        }

        let now = Instant::now();
        let from = self.workers[busiest].id();
        // anything still staged never left the director
        let mut retract = Vec::new();
        for id in &movable {
            if !self.workers[busiest].unstage(id) {
                retract.push(id.clone());
            }
            self.workers[busiest].assigned.remove(id);
        }
        if !retract.is_empty()
            && let Err(err) = self.send_abort(busiest, retract, Vec::new(), now)
        {
            warn!(target: "cook::director", worker = %from, error = %err, "retraction send failed");
            self.return_items(session, movable, StateChangeReason::Retracted)?;
            return self.mark_dead(session, busiest, "send failed", now);
        }
        info!(target: "cook::director", from = %from, moved = movable.len(), "rebalancing");
        self.return_items(session, movable, StateChangeReason::Retracted)
    }

    /// Hands saves stalled on readiness to idle workers.
    pub(crate) fn offload_stalled(&mut self, session: &mut Session, now: Instant) -> Result<()> {
        let Some(after) = self.config.offload_stalled_save_after() else {
            return Ok(());
        };
        if self.finishing_since.is_some() {
            return Ok(());
        }
        let Some(cutoff) = now.checked_sub(after) else {
            return Ok(());
        };
        let depth = self.config.worker_queue_depth.max(1);
        for id in session.stalled_saves(cutoff) {
            let Some(index) = self
                .workers
                .iter()
                .position(|worker| worker.is_empty() && worker.accepts_work(depth))
            else {
                break;
            };
            session.saves.remove(&id);
            let item = session.table.require_mut(&id)?;
            let pending: Vec<Platform> = item.pending_platforms.iter().cloned().collect();
            for platform in &pending {
                item.discard_discovered(platform);
            }
            item.awaiting_since = None;
            session.table.transition(
                &id,
                ItemState::SaveStalledAssignedToWorker,
                StateChangeReason::Offloaded,
                &session.events,
            )?;
            self.stage_on(session, index, &id)?;
            let worker_id = self.workers[index].id();
            session.table.require_mut(&id)?.assigned_worker = Some(worker_id);
            info!(target: "cook::director", item = %id, worker = %worker_id, "stalled save offloaded");
        }
        Ok(())
    }

    /// Starts cancelling a delegated item. It returns to idle once the
    /// worker acknowledges.
    pub(crate) fn cancel(&mut self, session: &mut Session, id: &ItemId) -> Result<()> {
        let Some(&worker_id) = self.owners.get(id) else {
            return Ok(());
        };
        let Some(index) = self.index_of(worker_id) else {
            return Err(CookError::InvariantViolation(format!(
                "{id}: owned by unknown {worker_id}"
            )));
        };
        session.table.require_mut(id)?.cancel_requested = true;
        let now = Instant::now();
        if self.workers[index].unstage(id) {
            // never sent
            return self.complete_cancel(session, index, id);
        }
        if let Err(err) = self.send_abort(index, vec![id.clone()], vec![id.clone()], now) {
            warn!(target: "cook::director", worker = %worker_id, error = %err, "abort send failed");
            return self.mark_dead(session, index, "send failed", now);
        }
        info!(target: "cook::director", item = %id, worker = %worker_id, "cancel sent");
        Ok(())
    }

    /// Tells every worker the cook is complete and waits for them to
    /// acknowledge. Returns `true` once all are gone or the wait timed out.
    pub(crate) fn finish(&mut self, session: &mut Session, now: Instant) -> Result<bool> {
        let since = match self.finishing_since {
            Some(since) => since,
            None => {
                self.finishing_since = Some(now);
                for index in 0..self.workers.len() {
                    match self.workers[index].state() {
                        ConnectionState::Connected => {
                            let worker = &mut self.workers[index];
                            let sent = worker.send(&Message::AbortWorker(AbortWorker {
                                kind: AbortKind::CookComplete,
                            }));
                            match sent {
                                Ok(()) => worker.set_state(ConnectionState::FlushingBeforeShutdown, now),
                                Err(_) => {
                                    worker.disconnect(now);
                                }
                            }
                        }
                        ConnectionState::Connecting => {
                            self.workers[index].disconnect(now);
                        }
                        _ => {}
                    }
                }
                info!(target: "cook::director", workers = self.workers.len(), "cook complete, waiting for workers");
                now
            }
        };

        self.pump(session, now)?;
        if self.all_disconnected() {
            return Ok(true);
        }
        if now.saturating_duration_since(since) >= self.config.shutdown_timeout() {
            error!(target: "cook::director", "workers did not acknowledge completion in time");
            for index in 0..self.workers.len() {
                self.mark_dead(session, index, "shutdown timeout", now)?;
            }
            return Ok(true);
        }
        Ok(false)
    }

    fn all_disconnected(&self) -> bool {
        self.workers
            .iter()
            .all(|worker| worker.state() == ConnectionState::Disconnected)
    }

    /// Aborts every worker. Delegated items return to idle without being
    /// requested again.
    pub(crate) fn shutdown(&mut self, session: &mut Session) -> Result<()> {
        self.finishing_since.get_or_insert_with(Instant::now);
        let now = Instant::now();
        let owned: Vec<ItemId> = self.owners.drain().map(|(id, _)| id).collect();
        for id in owned {
            if let Some(item) = session.table.get_mut(&id) {
                item.assigned_worker = None;
                item.pending_platforms.clear();
                item.cancel_requested = false;
                session
                    .table
                    .transition(&id, ItemState::Idle, StateChangeReason::Shutdown, &session.events)?;
            }
        }
        for worker in &mut self.workers {
            worker.assigned.clear();
            worker.fence = None;
            if matches!(
                worker.state(),
                ConnectionState::Connected | ConnectionState::FlushingBeforeShutdown
            ) && worker
                .send(&Message::AbortWorker(AbortWorker {
                    kind: AbortKind::Abort,
                }))
                .is_ok()
            {
                worker.set_state(ConnectionState::FlushingBeforeShutdown, now);
            } else {
                worker.disconnect(now);
            }
        }

        let deadline = now + self.config.abort_ack_timeout();
        while !self.all_disconnected() && Instant::now() < deadline {
            // results still in flight are stale now; only acks and closes matter
            self.pump(session, Instant::now())?;
            thread::sleep(SHUTDOWN_POLL);
        }
        for worker in &mut self.workers {
            if worker.state() != ConnectionState::Disconnected {
                warn!(target: "cook::director", worker = %worker.id(), "no abort acknowledgement, closing");
                worker.disconnect(Instant::now());
            }
        }
        Ok(())
    }
}

/// Applies a worker's result to the director's authoritative state: commits
/// artifacts, writes cache entries and turns discoveries into requests.
fn apply_remote_result(session: &mut Session, worker: WorkerId, result: PackageResult) -> Result<()> {
    let id = result.id;
    let item = session.table.require_mut(&id)?;
    item.assigned_worker = None;
    if item.input_hash.is_none() {
        item.input_hash = result.input_hash;
    }
    let pending: Vec<Platform> = item.pending_platforms.iter().cloned().collect();
    session
        .table
        .transition(&id, ItemState::Idle, StateChangeReason::RemoteResult, &session.events)?;
    session.summary.remote_results += 1;

    let mut discovered: HashMap<Platform, Vec<_>> = result.discovered.into_iter().collect();
    for outcome in result.platforms {
        let platform = outcome.platform;
        if !pending.contains(&platform) || !outcome.result.is_terminal() {
            continue;
        }
        let mut final_result = outcome.result;
        if final_result == PlatformResult::Succeeded {
            match outcome.artifact {
                Some(payload) => {
                    if let Err(err) = session.commit_artifact(&id, &platform, payload.bytes, payload.metadata) {
                        error!(target: "cook::director", item = %id, %platform, %worker, error = %err, "persisting remote artifact failed");
                        final_result = PlatformResult::Failed;
                    }
                }
                None => {
                    error!(target: "cook::director", item = %id, %platform, %worker, "success reported without an artifact");
                    final_result = PlatformResult::Failed;
                }
            }
        }

        if final_result == PlatformResult::Succeeded {
            let mut edges = SaveOutput::default();
            for dep in discovered.remove(&platform).unwrap_or_default() {
                match dep.kind {
                    DependencyKind::Import => edges.imports.push(dep.id),
                    DependencyKind::Soft => edges.soft_refs.push(dep.id),
                    DependencyKind::Build => edges.build_deps.push(dep.id),
                    DependencyKind::Generated => edges.generated.push(dep.id),
                }
            }
            session.record_save_discoveries(&id, &platform, &edges)?;
            let record = CacheRecord {
                own_hash: result.input_hash,
                build_deps: &edges.build_deps,
                imports: &edges.imports,
                soft_refs: &edges.soft_refs,
                generated: &edges.generated,
            };
            session
                .cache
                .record(&id, &platform, record, session.provider.as_ref())?;
        }
        session.complete_platform(&id, &platform, final_result)?;
        session.flush_discoveries(&id, &platform)?;
    }
    session.finish_cycle(&id)
}
