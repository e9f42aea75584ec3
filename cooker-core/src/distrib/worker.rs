//! Worker side of a distributed cook.
//!
//! A worker runs its own scheduler in report-only mode: it cooks what the
//! director assigns, buffers artifacts and discoveries per item and ships
//! them back as one result when the item finishes. It never requests the
//! dependencies it discovers; that is the director's call.

use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use tracing::{debug, info, warn};

use crate::{
    cook::{
        config::CookerConfig,
        cooker::{CookAction, Cooker, idle_backoff},
        leaf::ContentProvider,
    },
    error::{CookError, Result},
    types::WorkerId,
};

use super::{
    message::*,
    transport::{Connection, Inbound},
};

/// Why a worker loop ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerExit {
    /// The director finished the session.
    CookComplete,
    /// The director aborted the session.
    Aborted,
    /// The director went away without saying goodbye.
    DirectorLost,
}

/// A worker process's loop around a report-only [`Cooker`].
pub struct WorkerClient {
    id: WorkerId,
    cooker: Cooker,
    connection: Box<dyn Connection>,
    protocol_errors: u32,
    last_contact: Instant,
}

impl WorkerClient {
    pub fn new(
        id: WorkerId,
        config: CookerConfig,
        provider: Arc<dyn ContentProvider>,
        connection: Box<dyn Connection>,
    ) -> Self {
        Self {
            id,
            cooker: Cooker::report_only(config, provider),
            connection,
            protocol_errors: 0,
            last_contact: Instant::now(),
        }
    }

    /// How long the director may stay silent before the worker gives up.
    fn director_silence_limit(&self) -> Duration {
        let distribution = &self.cooker.config().distribution;
        let heartbeats = distribution.heartbeat_interval()
            * (distribution.missed_heartbeats_before_dead + 1).max(2);
        heartbeats.max(distribution.connect_timeout())
    }

    pub fn run(mut self) -> Result<WorkerExit> {
        self.connection.send(&Message::Connect(Connect {
            worker_id: self.id,
            protocol_version: PROTOCOL_VERSION,
        }))?;
        info!(target: "cook::worker", worker = %self.id, peer = %self.connection.peer(), "connected to director");

        loop {
            if let Some(exit) = self.process_inbound()? {
                info!(target: "cook::worker", worker = %self.id, ?exit, "worker stopping");
                return Ok(exit);
            }
            let action = self.cooker.tick()?;
            self.send_reports()?;

            if self.last_contact.elapsed() > self.director_silence_limit() {
                warn!(target: "cook::worker", worker = %self.id, "director silent, giving up");
                self.cooker.shutdown()?;
                self.connection.close();
                return Ok(WorkerExit::DirectorLost);
            }
            if action == CookAction::Done {
                thread::sleep(idle_backoff(self.cooker.config()));
            }
        }
    }

    fn process_inbound(&mut self) -> Result<Option<WorkerExit>> {
        while let Some(inbound) = self.connection.try_recv() {
            self.last_contact = Instant::now();
            match inbound {
                Inbound::Message(Message::AssignPackages(assign)) => self.accept(assign)?,
                Inbound::Message(Message::AbortPackages(abort)) => {
                    for id in &abort.ids {
                        self.cooker.session_mut().retract_local(id)?;
                    }
                    info!(target: "cook::worker", worker = %self.id, count = abort.ids.len(), "assignments retracted");
                }
                Inbound::Message(Message::Heartbeat(heartbeat)) => {
                    // results first, so the director sees them before the echo
                    self.send_reports()?;
                    self.connection.send(&Message::Heartbeat(heartbeat))?;
                }
                Inbound::Message(Message::AbortWorker(abort)) => {
                    return self.stop(abort.kind).map(Some);
                }
                Inbound::Message(other) => {
                    self.note_protocol_error(&format!("unexpected {} from director", other.kind()))?;
                }
                Inbound::ProtocolError(reason) => self.note_protocol_error(&reason)?,
                Inbound::Closed => {
                    warn!(target: "cook::worker", worker = %self.id, "director connection closed");
                    self.cooker.shutdown()?;
                    return Ok(Some(WorkerExit::DirectorLost));
                }
            }
        }
        Ok(None)
    }

    fn accept(&mut self, assign: AssignPackages) -> Result<()> {
        let count = assign.items.len();
        let known = assign.existence.len();
        for item in assign.items {
            self.cooker.session_mut().request(
                &item.id,
                &item.platforms,
                item.urgency,
                item.instigator,
            )?;
        }
        debug!(target: "cook::worker", worker = %self.id, count, known, "assignments accepted");
        Ok(())
    }

    fn note_protocol_error(&mut self, reason: &str) -> Result<()> {
        self.protocol_errors += 1;
        warn!(target: "cook::worker", worker = %self.id, errors = self.protocol_errors, reason, "malformed message dropped");
        let limit = self.cooker.config().distribution.max_protocol_errors;
        if self.protocol_errors > limit {
            return Err(CookError::Protocol(format!(
                "{} protocol errors from director",
                self.protocol_errors
            )));
        }
        Ok(())
    }

    fn stop(&mut self, kind: AbortKind) -> Result<WorkerExit> {
        let exit = match kind {
            AbortKind::CookComplete => {
                self.send_reports()?;
                WorkerExit::CookComplete
            }
            AbortKind::Abort | AbortKind::AbortAcknowledge => WorkerExit::Aborted,
        };
        self.cooker.shutdown()?;
        self.connection.send(&Message::AbortWorker(AbortWorker {
            kind: AbortKind::AbortAcknowledge,
        }))?;
        self.connection.close();
        Ok(exit)
    }

    /// Ships finished items with every edge they reported. The director
    /// skips edges it has already resolved, but its cache entries need them
    /// all.
    fn send_reports(&mut self) -> Result<()> {
        let reports = self.cooker.session_mut().take_reports();
        if reports.is_empty() {
            return Ok(());
        }
        debug!(target: "cook::worker", worker = %self.id, count = reports.len(), "sending results");
        self.connection
            .send(&Message::PackageResults(PackageResults { results: reports }))
    }
}
