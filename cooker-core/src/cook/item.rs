use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    fmt,
    time::Instant,
};

use serde::{Deserialize, Serialize};

use crate::{
    error::{CookError, Result},
    types::{ContentHash, ItemId, Platform, WorkerId},
};

use super::{
    leaf::ContentHandle,
    state::{ItemState, LoadSubState, SaveSubState},
};

/// Terminal outcome of one (item, platform).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlatformResult {
    #[default]
    NotAttempted,
    Succeeded,
    Failed,
    /// The item cannot be cooked for this platform.
    Invalid,
}

impl PlatformResult {
    pub fn is_terminal(self) -> bool {
        self != PlatformResult::NotAttempted
    }
}

/// Queue ordering band. Never changes correctness.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Urgency {
    #[default]
    Normal,
    High,
    Blocking,
}

impl Urgency {
    pub fn elevate(self, target: Urgency) -> Urgency {
        self.max(target)
    }
}

/// Which cook phase an item belongs to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Reachability {
    #[default]
    Runtime,
    /// Only needed to validate another item's output; cooked after the runtime phase.
    Build,
}

/// Why an item was requested.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Instigator {
    #[default]
    Root,
    RuntimeDependency(ItemId),
    SoftDependency(ItemId),
    BuildDependency(ItemId),
    Generated(ItemId),
    Retry(Box<Instigator>),
}

impl Instigator {
    /// The item whose load or save led to this request, if any.
    pub fn referencer(&self) -> Option<&ItemId> {
        match self {
            Instigator::Root => None,
            Instigator::RuntimeDependency(by)
            | Instigator::SoftDependency(by)
            | Instigator::BuildDependency(by)
            | Instigator::Generated(by) => Some(by),
            Instigator::Retry(inner) => inner.referencer(),
        }
    }

    pub fn reachability(&self) -> Reachability {
        match self {
            Instigator::BuildDependency(_) => Reachability::Build,
            Instigator::Retry(inner) => inner.reachability(),
            _ => Reachability::Runtime,
        }
    }

    pub fn retry(self) -> Instigator {
        match self {
            already @ Instigator::Retry(_) => already,
            other => Instigator::Retry(Box::new(other)),
        }
    }
}

impl fmt::Display for Instigator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instigator::Root => write!(f, "root"),
            Instigator::RuntimeDependency(by) => write!(f, "import of {by}"),
            Instigator::SoftDependency(by) => write!(f, "soft reference of {by}"),
            Instigator::BuildDependency(by) => write!(f, "build dependency of {by}"),
            Instigator::Generated(by) => write!(f, "generated by {by}"),
            Instigator::Retry(inner) => write!(f, "retry ({inner})"),
        }
    }
}

/// Kind of edge found while loading or saving an item.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DependencyKind {
    Import,
    Soft,
    Build,
    Generated,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DiscoveredDependency {
    pub id: ItemId,
    pub kind: DependencyKind,
}

impl DiscoveredDependency {
    pub fn new(id: ItemId, kind: DependencyKind) -> Self {
        Self { id, kind }
    }
}

/// Build state of one content item across its requested platforms.
pub struct WorkItem {
    id: ItemId,
    state: ItemState,
    pub urgency: Urgency,
    pub instigator: Instigator,
    pub reachability: Reachability,
    requested: BTreeSet<Platform>,
    results: BTreeMap<Platform, PlatformResult>,
    /// Platforms the current request/load/save cycle is responsible for.
    pub pending_platforms: VecDeque<Platform>,
    discovered: BTreeMap<Platform, Vec<DiscoveredDependency>>,
    pub save_sub_state: SaveSubState,
    pub load_sub_state: LoadSubState,
    content: Option<ContentHandle>,
    transient_failures: BTreeMap<Platform, u16>,
    /// When the current readiness wait started.
    pub awaiting_since: Option<Instant>,
    pub cancel_requested: bool,
    pub generated_by: Option<ItemId>,
    pub generated: Vec<ItemId>,
    /// Diagnostics attached to this item during the current cycle.
    pub logs: Vec<String>,
    pub assigned_worker: Option<WorkerId>,
    /// Hash of the item's own content captured when it was loaded.
    pub input_hash: Option<ContentHash>,
}

impl fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkItem")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("urgency", &self.urgency)
            .field("instigator", &self.instigator)
            .field("requested", &self.requested)
            .field("results", &self.results)
            .field("pending_platforms", &self.pending_platforms)
            .field("save_sub_state", &self.save_sub_state)
            .field("holds_content", &self.content.is_some())
            .finish()
    }
}

impl WorkItem {
    pub fn new(id: ItemId, urgency: Urgency, instigator: Instigator) -> Self {
        let reachability = instigator.reachability();
        Self {
            id,
            state: ItemState::Idle,
            urgency,
            instigator,
            reachability,
            requested: BTreeSet::new(),
            results: BTreeMap::new(),
            pending_platforms: VecDeque::new(),
            discovered: BTreeMap::new(),
            save_sub_state: SaveSubState::default(),
            load_sub_state: LoadSubState::default(),
            content: None,
            transient_failures: BTreeMap::new(),
            awaiting_since: None,
            cancel_requested: false,
            generated_by: None,
            generated: Vec::new(),
            logs: Vec::new(),
            assigned_worker: None,
            input_hash: None,
        }
    }

    pub fn id(&self) -> &ItemId {
        &self.id
    }

    pub fn state(&self) -> ItemState {
        self.state
    }

    pub fn requested_platforms(&self) -> &BTreeSet<Platform> {
        &self.requested
    }

    pub fn results(&self) -> &BTreeMap<Platform, PlatformResult> {
        &self.results
    }

    pub fn result(&self, platform: &Platform) -> PlatformResult {
        self.results.get(platform).copied().unwrap_or_default()
    }

    /// Adds platforms to the requested set. Returns the platforms that were new.
    pub fn add_requested<'a>(&mut self, platforms: impl IntoIterator<Item = &'a Platform>) -> Vec<Platform> {
        platforms
            .into_iter()
            .filter(|p| self.requested.insert((*p).clone()))
            .cloned()
            .collect()
    }

    /// Requested platforms without a terminal result.
    pub fn platforms_needing_cook(&self) -> Vec<Platform> {
        self.requested
            .iter()
            .filter(|p| !self.result(p).is_terminal())
            .cloned()
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.requested.iter().all(|p| self.result(p).is_terminal())
    }

    /// Records a terminal result. A second terminal result for the same
    /// platform is an invariant violation; only [`WorkItem::reset_results`]
    /// may clear one.
    pub fn set_result(&mut self, platform: &Platform, result: PlatformResult) -> Result<()> {
        if !result.is_terminal() {
            return Err(CookError::InvariantViolation(format!(
                "{}: attempted to record a non-terminal result for {platform}",
                self.id
            )));
        }
        let existing = self.result(platform);
        if existing.is_terminal() {
            return Err(CookError::InvariantViolation(format!(
                "{}: result for {platform} already recorded as {existing:?}",
                self.id
            )));
        }
        self.results.insert(platform.clone(), result);
        self.pending_platforms.retain(|p| p != platform);
        Ok(())
    }

    /// Clears every result. Only used by explicit forced re-cooks.
    pub fn reset_results(&mut self) {
        self.results.clear();
        self.transient_failures.clear();
    }

    /// Counts a transient failure and reports whether it may still be retried.
    pub fn note_transient_failure(&mut self, platform: &Platform, max_retries: u16) -> bool {
        let count = self.transient_failures.entry(platform.clone()).or_insert(0);
        *count += 1;
        *count <= max_retries
    }

    pub fn transient_failures(&self, platform: &Platform) -> u16 {
        self.transient_failures.get(platform).copied().unwrap_or(0)
    }

    pub fn content(&self) -> Option<&ContentHandle> {
        self.content.as_ref()
    }

    pub fn has_content(&self) -> bool {
        self.content.is_some()
    }

    /// Installs the handle produced by a successful load.
    pub fn attach_content(&mut self, handle: ContentHandle) -> Result<()> {
        if self.state != ItemState::Load {
            return Err(CookError::InvariantViolation(format!(
                "{}: content attached in state {}",
                self.id, self.state
            )));
        }
        if self.content.is_some() {
            return Err(CookError::InvariantViolation(format!(
                "{}: content handle attached twice",
                self.id
            )));
        }
        self.content = Some(handle);
        Ok(())
    }

    /// Moves the item to `next`, releasing the content handle when the new
    /// state no longer owns it. Returns the previous state.
    pub(crate) fn transition(&mut self, next: ItemState) -> Result<ItemState> {
        let previous = self.state;
        if !previous.can_transition_to(next) {
            return Err(CookError::InvariantViolation(format!(
                "{}: illegal transition {previous} -> {next}",
                self.id
            )));
        }
        if next == ItemState::Load && self.content.is_some() {
            return Err(CookError::InvariantViolation(format!(
                "{}: entering load while still holding content",
                self.id
            )));
        }
        if next == ItemState::SaveActive && self.content.is_none() {
            return Err(CookError::InvariantViolation(format!(
                "{}: entering save without content",
                self.id
            )));
        }
        if !next.holds_content() {
            // dropping the handle is the release
            self.content = None;
        }
        match next {
            ItemState::Idle => {
                self.save_sub_state = SaveSubState::default();
                self.load_sub_state = LoadSubState::default();
                self.awaiting_since = None;
                self.assigned_worker = None;
            }
            ItemState::Load => {
                self.load_sub_state = LoadSubState::default();
            }
            ItemState::SaveActive => {
                self.save_sub_state = SaveSubState::default();
                self.awaiting_since = None;
            }
            _ => {}
        }
        self.state = next;
        Ok(previous)
    }

    pub fn add_discovered(&mut self, platform: &Platform, dependency: DiscoveredDependency) {
        let list = self.discovered.entry(platform.clone()).or_default();
        if !list.contains(&dependency) {
            list.push(dependency);
        }
    }

    pub fn discovered(&self, platform: &Platform) -> &[DiscoveredDependency] {
        self.discovered.get(platform).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn has_discovered(&self) -> bool {
        self.discovered.values().any(|list| !list.is_empty())
    }

    /// Takes every not-yet-requested discovery, grouped by platform.
    pub fn take_discovered(&mut self) -> BTreeMap<Platform, Vec<DiscoveredDependency>> {
        std::mem::take(&mut self.discovered)
    }

    /// Drops discoveries for a platform whose partial progress was discarded.
    pub fn discard_discovered(&mut self, platform: &Platform) {
        self.discovered.remove(platform);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item() -> WorkItem {
        let mut item = WorkItem::new(ItemId::new("a"), Urgency::Normal, Instigator::Root);
        item.add_requested(&[Platform::new("linux"), Platform::new("console")]);
        item
    }

    #[test]
    fn results_are_recorded_once() {
        let mut item = item();
        let linux = Platform::new("linux");
        item.set_result(&linux, PlatformResult::Succeeded).unwrap();
        let err = item.set_result(&linux, PlatformResult::Failed).unwrap_err();
        assert!(matches!(err, CookError::InvariantViolation(_)));
        assert_eq!(item.result(&linux), PlatformResult::Succeeded);
        assert_eq!(item.platforms_needing_cook(), vec![Platform::new("console")]);
    }

    #[test]
    fn leaving_load_releases_content() {
        let mut item = item();
        item.transition(ItemState::Request).unwrap();
        item.transition(ItemState::Load).unwrap();
        item.attach_content(ContentHandle::new(7u32)).unwrap();
        item.transition(ItemState::Idle).unwrap();
        assert!(!item.has_content());
    }

    #[test]
    fn save_requires_content() {
        let mut item = item();
        item.transition(ItemState::Request).unwrap();
        item.transition(ItemState::Load).unwrap();
        assert!(item.transition(ItemState::SaveActive).is_err());
        assert_eq!(item.state(), ItemState::Load);
    }

    #[test]
    fn one_transient_retry_then_terminal() {
        let mut item = item();
        let linux = Platform::new("linux");
        assert!(item.note_transient_failure(&linux, 1));
        assert!(!item.note_transient_failure(&linux, 1));
    }

    #[test]
    fn retry_keeps_the_referencer_chain() {
        let instigator = Instigator::BuildDependency(ItemId::new("root")).retry().retry();
        assert_eq!(instigator.referencer(), Some(&ItemId::new("root")));
        assert_eq!(instigator.reachability(), Reachability::Build);
        assert!(matches!(instigator, Instigator::Retry(ref inner) if !matches!(**inner, Instigator::Retry(_))));
    }
}
