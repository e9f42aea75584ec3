use std::time::Instant;

use tracing::{debug, trace};

use crate::{
    error::{CookError, Result},
    types::{ContentHash, ItemId, Platform},
};

use super::{
    cache::CacheRecord,
    item::PlatformResult,
    leaf::{ArtifactMetadata, LeafError, Readiness, SaveOutput},
    session::Session,
    state::{ItemState, SaveSubState, StateChangeReason},
};

/// What one step of an item's save did.
enum SaveStep {
    /// Moved to the next sub-state; keep going.
    Advanced,
    /// Waiting on the leaf layer; revisit on a later pump.
    Suspended,
    /// A platform reached its end (result, or a retry scheduled).
    PlatformDone,
    /// The item left the save stage.
    Finished,
}

impl Session {
    /// Advances queued saves until `deadline`. Returns whether anything moved.
    pub(crate) fn pump_save(&mut self, deadline: Instant) -> Result<bool> {
        let mut progressed = false;
        for id in self.saves.snapshot() {
            if Instant::now() >= deadline || self.finish_budget_spent() {
                break;
            }
            progressed |= self.advance_save(&id, deadline)?;
        }
        Ok(progressed)
    }

    /// Runs one item's save state machine until it suspends, finishes, or
    /// the deadline passes between two platforms.
    fn advance_save(&mut self, id: &ItemId, deadline: Instant) -> Result<bool> {
        let mut progressed = false;
        loop {
            match self.save_step(id)? {
                SaveStep::Advanced => progressed = true,
                SaveStep::Suspended => return Ok(progressed),
                SaveStep::Finished => return Ok(true),
                SaveStep::PlatformDone => {
                    progressed = true;
                    if Instant::now() >= deadline {
                        return Ok(progressed);
                    }
                }
            }
        }
    }

    fn save_step(&mut self, id: &ItemId) -> Result<SaveStep> {
        let item = self.table.require(id)?;
        if item.state() != ItemState::SaveActive {
            self.saves.remove(id);
            return Ok(SaveStep::Suspended);
        }
        let Some(platform) = item.pending_platforms.front().cloned() else {
            self.saves.remove(id);
            self.table
                .transition(id, ItemState::Idle, StateChangeReason::Saved, &self.events)?;
            self.finish_cycle(id)?;
            return Ok(SaveStep::Finished);
        };
        let content = item.content().ok_or_else(|| {
            CookError::InvariantViolation(format!("{id}: saving without content"))
        })?;

        match item.save_sub_state {
            SaveSubState::StartSave => {
                let item = self.table.require_mut(id)?;
                item.save_sub_state = SaveSubState::AwaitReadiness;
                item.awaiting_since = Some(Instant::now());
                Ok(SaveStep::Advanced)
            }
            SaveSubState::AwaitReadiness => {
                let since = item.awaiting_since;
                match self.provider.poll_ready(id, &platform, content) {
                    Ok(Readiness::Ready) => {
                        let item = self.table.require_mut(id)?;
                        item.save_sub_state = SaveSubState::Serialize;
                        item.awaiting_since = None;
                        Ok(SaveStep::Advanced)
                    }
                    Ok(Readiness::Pending) => {
                        let timeout = self.config.retry.save_timeout();
                        if since.is_some_and(|since| since.elapsed() >= timeout) {
                            let error = LeafError::Timeout(format!(
                                "not ready after {}ms",
                                timeout.as_millis()
                            ));
                            self.fail_save_platform(id, &platform, &error)?;
                            return Ok(SaveStep::PlatformDone);
                        }
                        trace!(target: "cook::scheduler", item = %id, %platform, "awaiting readiness");
                        Ok(SaveStep::Suspended)
                    }
                    Err(error) => {
                        self.fail_save_platform(id, &platform, &error)?;
                        Ok(SaveStep::PlatformDone)
                    }
                }
            }
            SaveSubState::Serialize => {
                let input_hash = item.input_hash;
                let saved = self.provider.save(id, &platform, content);
                self.summary.saves += 1;
                let committed = match saved {
                    Ok(output) => self.commit_save(id, &platform, output, input_hash)?,
                    Err(error) => Err(error),
                };
                match committed {
                    Ok(()) => {
                        self.table.require_mut(id)?.save_sub_state = SaveSubState::GenerateSubItems;
                        Ok(SaveStep::Advanced)
                    }
                    Err(error) => {
                        self.fail_save_platform(id, &platform, &error)?;
                        Ok(SaveStep::PlatformDone)
                    }
                }
            }
            SaveSubState::GenerateSubItems => {
                self.flush_discoveries(id, &platform)?;
                self.complete_platform(id, &platform, PlatformResult::Succeeded)?;
                self.table.require_mut(id)?.save_sub_state = SaveSubState::StartSave;
                debug!(target: "cook::scheduler", item = %id, %platform, "saved");
                Ok(SaveStep::PlatformDone)
            }
        }
    }

    /// Persists the artifact, parks discoveries and refreshes the cache entry.
    /// Nothing is recorded on the item unless the artifact was committed.
    fn commit_save(
        &mut self,
        id: &ItemId,
        platform: &Platform,
        output: SaveOutput,
        input_hash: Option<ContentHash>,
    ) -> Result<std::result::Result<(), LeafError>> {
        let metadata = ArtifactMetadata {
            input_hash,
            byte_len: output.artifact.len(),
        };
        let edges = SaveOutput {
            artifact: Vec::new(),
            ..output
        };
        if let Err(error) = self.commit_artifact(id, platform, output.artifact, metadata) {
            return Ok(Err(error));
        }

        self.record_save_discoveries(id, platform, &edges)?;
        if !self.is_report_only() {
            // load-time edges are parked next to the save's own
            let parked = self.parked_edges(id, platform)?;
            let record = CacheRecord {
                own_hash: input_hash,
                build_deps: &parked.build_deps,
                imports: &parked.imports,
                soft_refs: &parked.soft_refs,
                generated: &parked.generated,
            };
            self.cache.record(id, platform, record, self.provider.as_ref())?;
        }
        Ok(Ok(()))
    }

    /// Ends the current attempt of one platform after a leaf failure.
    fn fail_save_platform(&mut self, id: &ItemId, platform: &Platform, error: &LeafError) -> Result<()> {
        let retry = self.apply_leaf_failure(id, platform, error, "save")?;
        let item = self.table.require_mut(id)?;
        item.save_sub_state = SaveSubState::StartSave;
        item.awaiting_since = None;
        if retry {
            // retried in place: the platform stays at the front, content stays loaded
            debug!(target: "cook::scheduler", item = %id, %platform, "save retry scheduled");
        }
        Ok(())
    }
}
