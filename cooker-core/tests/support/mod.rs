//! Shared harness for cooker integration tests: a scripted in-memory leaf
//! layer, a recording sink and an in-process director/worker cluster.
#![allow(dead_code)]

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use cooker_core::{
    cook::{
        ArtifactMetadata, ArtifactSink, ContentHandle, ContentProvider, Cooker, CookerConfig,
        LeafError, Readiness, SaveOutput, cache::BuildCacheStore, gc::NoMemoryPressure,
    },
    distrib::{ChannelConnection, Connection, Inbound, Message, WorkerClient, WorkerExit},
    error::Result,
    types::{ContentHash, ItemId, Platform, WorkerId},
};

pub fn id(raw: &str) -> ItemId {
    ItemId::new(raw)
}

pub fn linux() -> Platform {
    Platform::new("linux")
}

/// Config with every time-based trigger out of the way of a short test.
pub fn test_config() -> CookerConfig {
    let mut config = CookerConfig::default();
    config.gc.items_per_collection = 0;
    config.gc.min_free_physical_mb = 0;
    config.gc.min_free_virtual_mb = 0;
    config.gc.trigger_at_pressure = None;
    config.gc.idle_collect_after_ms = 0;
    config.gc.soft_enabled = false;
    config.queue.idle_sleep_ms = 1;
    config.distribution.heartbeat_interval_ms = 20;
    config.distribution.connect_timeout_ms = 5_000;
    config.distribution.abort_ack_timeout_ms = 2_000;
    config.distribution.shutdown_timeout_ms = 5_000;
    config.distribution.rebalance_threshold = 0;
    config
}

/// Behaviour of one scripted item.
#[derive(Clone, Debug, Default)]
pub struct Script {
    pub version: u32,
    /// Returned by `dependencies`, known before loading.
    pub static_deps: Vec<ItemId>,
    /// Reported by `save`.
    pub imports: Vec<ItemId>,
    pub soft_refs: Vec<ItemId>,
    pub build_deps: Vec<ItemId>,
    pub generated: Vec<ItemId>,
    /// Failures returned by successive `load` calls before it succeeds.
    pub load_failures: VecDeque<LeafError>,
    /// Failures returned by successive `save` calls before it succeeds.
    pub save_failures: VecDeque<LeafError>,
    /// `poll_ready` reports pending this many times per save.
    pub pending_polls: u32,
    /// `poll_ready` never reports ready.
    pub never_ready: bool,
}

impl Script {
    pub fn imports(mut self, ids: &[&str]) -> Self {
        self.imports.extend(ids.iter().map(|raw| id(raw)));
        self
    }

    pub fn soft(mut self, ids: &[&str]) -> Self {
        self.soft_refs.extend(ids.iter().map(|raw| id(raw)));
        self
    }

    pub fn build(mut self, ids: &[&str]) -> Self {
        self.build_deps.extend(ids.iter().map(|raw| id(raw)));
        self
    }

    pub fn generates(mut self, ids: &[&str]) -> Self {
        self.generated.extend(ids.iter().map(|raw| id(raw)));
        self
    }

    pub fn static_deps(mut self, ids: &[&str]) -> Self {
        self.static_deps.extend(ids.iter().map(|raw| id(raw)));
        self
    }

    pub fn failing_save(mut self, error: LeafError) -> Self {
        self.save_failures.push_back(error);
        self
    }

    pub fn failing_load(mut self, error: LeafError) -> Self {
        self.load_failures.push_back(error);
        self
    }

    pub fn pending(mut self, polls: u32) -> Self {
        self.pending_polls = polls;
        self
    }
}

#[derive(Debug, Default)]
struct ProviderState {
    scripts: HashMap<ItemId, Script>,
    loads: Vec<ItemId>,
    saves: Vec<(ItemId, Platform)>,
    polls: HashMap<(ItemId, Platform), u32>,
}

/// In-memory leaf layer. Unknown ids are cookable leaves with no edges.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    state: Mutex<ProviderState>,
}

impl ScriptedProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, raw: &str, script: Script) {
        self.state.lock().unwrap().scripts.insert(id(raw), script);
    }

    /// Changes an item's content, and therefore its hash.
    pub fn touch(&self, raw: &str) {
        let mut state = self.state.lock().unwrap();
        state.scripts.entry(id(raw)).or_default().version += 1;
    }

    pub fn loads(&self) -> Vec<ItemId> {
        self.state.lock().unwrap().loads.clone()
    }

    pub fn saves(&self) -> Vec<(ItemId, Platform)> {
        self.state.lock().unwrap().saves.clone()
    }

    pub fn load_count(&self, raw: &str) -> usize {
        self.loads().iter().filter(|loaded| loaded.as_str() == raw).count()
    }

    pub fn save_count(&self, raw: &str) -> usize {
        self.saves().iter().filter(|(saved, _)| saved.as_str() == raw).count()
    }
}

/// What `load` hands back.
#[derive(Debug)]
pub struct Loaded {
    pub id: ItemId,
    pub version: u32,
}

impl ContentProvider for ScriptedProvider {
    fn load(&self, id: &ItemId) -> std::result::Result<ContentHandle, LeafError> {
        let mut state = self.state.lock().unwrap();
        state.loads.push(id.clone());
        let script = state.scripts.entry(id.clone()).or_default();
        if let Some(error) = script.load_failures.pop_front() {
            return Err(error);
        }
        Ok(ContentHandle::new(Loaded {
            id: id.clone(),
            version: script.version,
        }))
    }

    fn poll_ready(
        &self,
        id: &ItemId,
        platform: &Platform,
        _content: &ContentHandle,
    ) -> std::result::Result<Readiness, LeafError> {
        let mut state = self.state.lock().unwrap();
        let (pending, never) = state
            .scripts
            .get(id)
            .map_or((0, false), |script| (script.pending_polls, script.never_ready));
        if never {
            return Ok(Readiness::Pending);
        }
        let polls = state.polls.entry((id.clone(), platform.clone())).or_default();
        if *polls < pending {
            *polls += 1;
            return Ok(Readiness::Pending);
        }
        *polls = 0;
        Ok(Readiness::Ready)
    }

    fn save(
        &self,
        id: &ItemId,
        platform: &Platform,
        content: &ContentHandle,
    ) -> std::result::Result<SaveOutput, LeafError> {
        let mut state = self.state.lock().unwrap();
        state.saves.push((id.clone(), platform.clone()));
        let script = state.scripts.entry(id.clone()).or_default();
        if let Some(error) = script.save_failures.pop_front() {
            return Err(error);
        }
        let loaded = content
            .downcast_ref::<Loaded>()
            .ok_or_else(|| LeafError::Content("foreign content".into()))?;
        Ok(SaveOutput {
            artifact: format!("{}@{}:{}", loaded.id, loaded.version, platform).into_bytes(),
            imports: script.imports.clone(),
            soft_refs: script.soft_refs.clone(),
            build_deps: script.build_deps.clone(),
            generated: script.generated.clone(),
        })
    }

    fn dependencies(&self, id: &ItemId) -> Vec<ItemId> {
        self.state
            .lock()
            .unwrap()
            .scripts
            .get(id)
            .map(|script| script.static_deps.clone())
            .unwrap_or_default()
    }

    fn hash(&self, id: &ItemId) -> std::result::Result<ContentHash, LeafError> {
        let version = self
            .state
            .lock()
            .unwrap()
            .scripts
            .get(id)
            .map_or(0, |script| script.version);
        Ok(ContentHash::of(format!("{id}#{version}").as_bytes()))
    }
}

/// Records every persisted artifact.
#[derive(Debug, Default)]
pub struct RecordingSink {
    persisted: Mutex<Vec<(ItemId, Platform, Vec<u8>)>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn persisted(&self) -> Vec<(ItemId, Platform, Vec<u8>)> {
        self.persisted.lock().unwrap().clone()
    }

    pub fn count(&self, raw: &str, platform: &Platform) -> usize {
        self.persisted()
            .iter()
            .filter(|(persisted, p, _)| persisted.as_str() == raw && p == platform)
            .count()
    }
}

impl ArtifactSink for RecordingSink {
    fn persist(
        &self,
        id: &ItemId,
        platform: &Platform,
        artifact: &[u8],
        _metadata: &ArtifactMetadata,
    ) -> std::result::Result<(), LeafError> {
        self.persisted
            .lock()
            .unwrap()
            .push((id.clone(), platform.clone(), artifact.to_vec()));
        Ok(())
    }
}

/// Single-process cooker over the scripted leaf layer.
pub fn local_cooker(
    config: CookerConfig,
    provider: &Arc<ScriptedProvider>,
    sink: &Arc<RecordingSink>,
    store: Box<dyn BuildCacheStore>,
) -> Cooker {
    Cooker::new(config, provider.clone(), sink.clone(), store)
        .with_memory_probe(Box::new(NoMemoryPressure))
}

/// Director-side connection the test can cut at will. Once severed it
/// reports `Closed` and drops the channel, so the worker sees the loss too.
pub struct Severable {
    inner: Option<ChannelConnection>,
    cut: Arc<AtomicBool>,
    reported: bool,
}

impl Severable {
    pub fn new(inner: ChannelConnection) -> (Self, Arc<AtomicBool>) {
        let cut = Arc::new(AtomicBool::new(false));
        let conn = Self {
            inner: Some(inner),
            cut: cut.clone(),
            reported: false,
        };
        (conn, cut)
    }

    fn check(&mut self) {
        if self.cut.load(Ordering::SeqCst) {
            self.inner = None;
        }
    }
}

impl Connection for Severable {
    fn send(&mut self, message: &Message) -> Result<()> {
        self.check();
        match self.inner.as_mut() {
            Some(inner) => inner.send(message),
            None => Err(cooker_core::CookError::Protocol("severed".into())),
        }
    }

    fn try_recv(&mut self) -> Option<Inbound> {
        self.check();
        match self.inner.as_mut() {
            Some(inner) => inner.try_recv(),
            None if !self.reported => {
                self.reported = true;
                Some(Inbound::Closed)
            }
            None => None,
        }
    }

    fn close(&mut self) {
        if let Some(inner) = self.inner.as_mut() {
            inner.close();
        }
    }

    fn peer(&self) -> String {
        "severable".into()
    }
}

/// In-process workers on their own threads.
pub struct Cluster {
    pub director: Cooker,
    pub workers: Vec<JoinHandle<Result<WorkerExit>>>,
    pub cuts: Vec<Arc<AtomicBool>>,
}

impl Cluster {
    /// Spawns `count` workers sharing the provider and wires them to a
    /// director. Waits for every worker to connect.
    pub fn start(
        config: CookerConfig,
        provider: &Arc<ScriptedProvider>,
        sink: &Arc<RecordingSink>,
        store: Box<dyn BuildCacheStore>,
        count: u32,
    ) -> Self {
        let mut connections: Vec<Box<dyn Connection>> = Vec::new();
        let mut workers = Vec::new();
        let mut cuts = Vec::new();
        for n in 1..=count {
            let (director_end, worker_end) = ChannelConnection::pair(format!("worker-{n}"));
            let (severable, cut) = Severable::new(director_end);
            connections.push(Box::new(severable));
            cuts.push(cut);
            workers.push(spawn_worker(n, config.clone(), provider.clone(), worker_end));
        }
        let mut director = local_cooker(config, provider, sink, store).with_workers(connections);
        director
            .await_workers(Duration::from_secs(5))
            .expect("workers connect");
        Self {
            director,
            workers,
            cuts,
        }
    }

    pub fn join(self) -> Vec<Result<WorkerExit>> {
        self.workers
            .into_iter()
            .map(|worker| worker.join().expect("worker thread panicked"))
            .collect()
    }
}

pub fn spawn_worker(
    n: u32,
    config: CookerConfig,
    provider: Arc<ScriptedProvider>,
    connection: ChannelConnection,
) -> JoinHandle<Result<WorkerExit>> {
    thread::spawn(move || {
        WorkerClient::new(WorkerId(n), config, provider, Box::new(connection)).run()
    })
}
