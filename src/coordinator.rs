/// Aggregation coordinator.
///
/// Owns the live cubes and the read side of the change feed. Every update
/// goes through one serialized entry point, the *tick*: manual updates,
/// periodic auto-updates, the update preceding each query and cube
/// creation/deletion all take the same lock, so at most one delta is ever
/// in flight per cube.
///
/// Change events reach a tick two ways:
///
/// - **Pull**: the tick reads the feed from the oldest watermark any live
///   cube still needs
/// - **Buffered**: a background task subscribed to the cubes' source
///   namespaces forwards events into a queue; the tick drains it and then
///   catches up from the feed for anything not forwarded yet
///
/// The feed task only ever enqueues. Cube state is mutated only inside a
/// tick.
///
/// # Example
///
/// ```ignore
/// let coordinator = Coordinator::connect(storage, feed, OlapConfig::default()).await?;
/// coordinator.load_cubes().await?;
/// coordinator.restore().await?;
///
/// coordinator.create_cube("byCity", model, None, false).await?;
/// let rows = coordinator.aggregate("byCity", AggregateRequest::new().measure("males")).await?;
///
/// coordinator.shutdown().await;
/// ```
use crate::config::OlapConfig;
use crate::cube::{Cube, DeltaStats};
use crate::error::{OlapError, OlapResult};
use crate::feed::ChangeFeed;
use crate::model::Model;
use crate::query::{AggregateRequest, AggregateRow};
use crate::storage::CubeStorage;
use crate::types::{ChangeRecord, CoordinatorState, CubeMetadata, DocumentId, Watermark};
use futures::StreamExt;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Outcome of one update tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateReport {
    /// Distinct events considered.
    pub events: usize,
    /// Cubes that applied a delta.
    pub applied: BTreeMap<String, DeltaStats>,
    /// Coordinator watermark after the tick.
    pub oldest: Watermark,
}

struct BackgroundTask {
    shutdown: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

impl BackgroundTask {
    fn spawn<F, Fut>(run: F) -> Self
    where
        F: FnOnce(broadcast::Receiver<()>) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let (shutdown, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(run(shutdown_rx));
        Self { shutdown, handle }
    }

    /// Ask the task to stop at its next suspension point.
    fn signal(&self) {
        let _ = self.shutdown.send(());
    }
}

#[derive(Default)]
struct BufferState {
    task: Option<BackgroundTask>,
    queue: Option<mpsc::UnboundedReceiver<ChangeRecord>>,
    /// Newest event drained from the queue.
    forwarded: Watermark,
}

struct Inner {
    storage: Arc<dyn CubeStorage>,
    feed: Arc<dyn ChangeFeed>,
    config: OlapConfig,
    cubes: RwLock<BTreeMap<String, Arc<RwLock<Cube>>>>,
    /// Serializes ticks and cube lifecycle changes.
    tick: Mutex<()>,
    /// Every live cube has folded in everything at or before this.
    oldest: RwLock<Watermark>,
    buffer: Mutex<BufferState>,
    auto: Mutex<Option<BackgroundTask>>,
    buffering: AtomicBool,
    auto_updating: AtomicBool,
    update_interval_ms: AtomicU64,
    closed: AtomicBool,
}

/// The cube coordinator. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    /// Create a coordinator without checking connectivity.
    pub fn new(storage: Arc<dyn CubeStorage>, feed: Arc<dyn ChangeFeed>, config: OlapConfig) -> Self {
        let update_interval_ms = config.coordinator.update_interval_ms;
        Self {
            inner: Arc::new(Inner {
                storage,
                feed,
                config,
                cubes: RwLock::new(BTreeMap::new()),
                tick: Mutex::new(()),
                oldest: RwLock::new(Watermark::ZERO),
                buffer: Mutex::new(BufferState::default()),
                auto: Mutex::new(None),
                buffering: AtomicBool::new(false),
                auto_updating: AtomicBool::new(false),
                update_interval_ms: AtomicU64::new(update_interval_ms),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Create a coordinator once storage and the feed respond.
    ///
    /// Both are required, so this retries indefinitely with exponential
    /// backoff (bounded by the configured maximum) plus jitter.
    pub async fn connect(
        storage: Arc<dyn CubeStorage>,
        feed: Arc<dyn ChangeFeed>,
        config: OlapConfig,
    ) -> OlapResult<Self> {
        let mut delay = config.retry_interval();
        let max_delay = config.max_retry_interval();
        let mut attempt: u32 = 1;

        loop {
            let check = match storage.ping().await {
                Ok(()) => feed.head().await.map(|_| ()),
                Err(e) => Err(e),
            };
            match check {
                Ok(()) => {
                    info!(attempt, "connected to storage and change feed");
                    return Ok(Self::new(storage, feed, config));
                }
                Err(e) if e.is_transient() => {
                    let jitter_ms = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 4);
                    let wait = delay + Duration::from_millis(jitter_ms);
                    warn!(attempt, error = %e, wait_ms = wait.as_millis() as u64, "connection failed, retrying");
                    tokio::time::sleep(wait).await;
                    delay = (delay * 2).min(max_delay);
                    attempt = attempt.saturating_add(1);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn ensure_open(&self) -> OlapResult<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            Err(OlapError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    pub fn config(&self) -> &OlapConfig {
        &self.inner.config
    }

    pub fn is_buffering(&self) -> bool {
        self.inner.buffering.load(Ordering::SeqCst)
    }

    pub fn is_auto_updating(&self) -> bool {
        self.inner.auto_updating.load(Ordering::SeqCst)
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.inner.update_interval_ms.load(Ordering::SeqCst))
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Oldest watermark the coordinator still needs from the feed.
    pub async fn oldest_watermark(&self) -> Watermark {
        *self.inner.oldest.read().await
    }

    /// Names of the live cubes.
    pub async fn cube_names(&self) -> Vec<String> {
        self.inner.cubes.read().await.keys().cloned().collect()
    }

    /// Metadata of every live cube.
    pub async fn list_cubes(&self) -> OlapResult<Vec<CubeMetadata>> {
        self.ensure_open()?;
        let cubes: Vec<_> = self.inner.cubes.read().await.values().cloned().collect();
        let mut out = Vec::with_capacity(cubes.len());
        for cube in cubes {
            out.push(cube.read().await.metadata());
        }
        Ok(out)
    }

    async fn namespaces(&self) -> Vec<String> {
        let cubes: Vec<_> = self.inner.cubes.read().await.values().cloned().collect();
        let mut namespaces = BTreeSet::new();
        for cube in cubes {
            let cube = cube.read().await;
            if cube.is_valid() {
                namespaces.insert(cube.source_namespace().to_string());
            }
        }
        namespaces.into_iter().collect()
    }

    async fn save_state(&self) -> OlapResult<()> {
        let state = CoordinatorState {
            buffering: self.is_buffering(),
            auto_updating: self.is_auto_updating(),
            update_interval_ms: self.inner.update_interval_ms.load(Ordering::SeqCst),
        };
        self.inner.storage.save_state(&state).await
    }

    /// Build and register a new cube.
    pub async fn create_cube(
        &self,
        name: &str,
        model: Model,
        principal_entity: Option<String>,
        skip_build: bool,
    ) -> OlapResult<CubeMetadata> {
        self.ensure_open()?;
        let _tick = self.inner.tick.lock().await;

        let duplicate = || OlapError::DuplicateCube {
            name: name.to_string(),
        };
        if self.inner.cubes.read().await.contains_key(name) {
            return Err(duplicate());
        }
        if let Some(existing) = self.inner.storage.find_metadata(name).await? {
            if existing.valid {
                return Err(duplicate());
            }
            warn!(cube = name, "rebuilding over invalid cube");
        }

        let mut cube = Cube::new(
            name,
            model,
            &self.inner.config.storage.prefix,
            Arc::clone(&self.inner.storage),
        )?
        .with_principal_entity(principal_entity);
        cube.init_new(self.inner.feed.as_ref(), skip_build).await?;
        let metadata = cube.metadata();

        {
            let mut cubes = self.inner.cubes.write().await;
            if cubes.is_empty() {
                *self.inner.oldest.write().await = cube.last_processed();
            }
            cubes.insert(name.to_string(), Arc::new(RwLock::new(cube)));
        }

        info!(cube = name, source = %metadata.model.source, "cube created");
        self.rearm_buffering().await;
        Ok(metadata)
    }

    /// Attach every valid persisted cube not already live.
    ///
    /// Returns the names of the cubes loaded by this call.
    pub async fn load_cubes(&self) -> OlapResult<Vec<String>> {
        self.ensure_open()?;
        let _tick = self.inner.tick.lock().await;

        let mut loaded = Vec::new();
        for metadata in self.inner.storage.list_metadata().await? {
            if !metadata.valid {
                warn!(cube = %metadata.id, "skipping invalid cube");
                continue;
            }
            if self.inner.cubes.read().await.contains_key(&metadata.id) {
                continue;
            }

            let mut cube = match Cube::from_metadata(
                &metadata,
                &self.inner.config.storage.prefix,
                Arc::clone(&self.inner.storage),
            ) {
                Ok(cube) => cube,
                Err(e) => {
                    warn!(cube = %metadata.id, error = %e, "skipping unreadable cube");
                    continue;
                }
            };
            if let Err(e) = cube.load().await {
                warn!(cube = %metadata.id, error = %e, "cube failed to load");
                continue;
            }
            self.inner
                .cubes
                .write()
                .await
                .insert(metadata.id.clone(), Arc::new(RwLock::new(cube)));
            loaded.push(metadata.id);
        }

        let cubes: Vec<_> = self.inner.cubes.read().await.values().cloned().collect();
        let mut oldest: Option<Watermark> = None;
        for cube in cubes {
            let last = cube.read().await.last_processed();
            oldest = Some(oldest.map_or(last, |o| o.min(last)));
        }
        if let Some(oldest) = oldest {
            *self.inner.oldest.write().await = oldest;
        }

        info!(loaded = loaded.len(), "cubes loaded");
        self.rearm_buffering().await;
        Ok(loaded)
    }

    /// Drop a cube permanently. Also removes a persisted cube that failed
    /// to load.
    pub async fn delete_cube(&self, name: &str) -> OlapResult<()> {
        self.ensure_open()?;
        let _tick = self.inner.tick.lock().await;

        let live = self.inner.cubes.write().await.remove(name);
        match live {
            Some(cube) => cube.write().await.delete().await?,
            None => {
                let metadata = self.inner.storage.find_metadata(name).await?.ok_or_else(|| {
                    OlapError::CubeNotFound {
                        name: name.to_string(),
                    }
                })?;
                Cube::from_metadata(
                    &metadata,
                    &self.inner.config.storage.prefix,
                    Arc::clone(&self.inner.storage),
                )?
                .delete()
                .await?;
            }
        }

        self.rearm_buffering().await;
        Ok(())
    }

    /// Rebuild a cube from a full scan, recovering an invalid one.
    pub async fn rebuild_cube(&self, name: &str) -> OlapResult<CubeMetadata> {
        self.ensure_open()?;
        let _tick = self.inner.tick.lock().await;

        let live = self.inner.cubes.read().await.get(name).cloned();
        let metadata = match live {
            Some(cube) => {
                let mut cube = cube.write().await;
                cube.init_new(self.inner.feed.as_ref(), false).await?;
                cube.metadata()
            }
            None => {
                let stored = self.inner.storage.find_metadata(name).await?.ok_or_else(|| {
                    OlapError::CubeNotFound {
                        name: name.to_string(),
                    }
                })?;
                let mut cube = Cube::from_metadata(
                    &stored,
                    &self.inner.config.storage.prefix,
                    Arc::clone(&self.inner.storage),
                )?;
                cube.init_new(self.inner.feed.as_ref(), false).await?;
                let metadata = cube.metadata();
                let mut cubes = self.inner.cubes.write().await;
                if cubes.is_empty() {
                    *self.inner.oldest.write().await = cube.last_processed();
                }
                cubes.insert(name.to_string(), Arc::new(RwLock::new(cube)));
                metadata
            }
        };

        info!(cube = name, "cube rebuilt");
        self.rearm_buffering().await;
        Ok(metadata)
    }

    /// Run one update tick.
    ///
    /// Every affected cube is attempted; the first failure is returned
    /// after the others were processed.
    pub async fn update_aggregates(&self) -> OlapResult<UpdateReport> {
        let (report, mut failures) = self.tick().await?;
        match failures.pop_first() {
            Some((_, e)) => Err(e),
            None => Ok(report),
        }
    }

    async fn tick(&self) -> OlapResult<(UpdateReport, BTreeMap<String, OlapError>)> {
        self.ensure_open()?;
        let _tick = self.inner.tick.lock().await;
        let mut failures = BTreeMap::new();

        let namespaces = self.namespaces().await;
        let oldest = *self.inner.oldest.read().await;
        if namespaces.is_empty() {
            return Ok((
                UpdateReport {
                    oldest,
                    ..UpdateReport::default()
                },
                failures,
            ));
        }

        let mut events = self.collect_events(oldest, &namespaces).await?;
        events.retain(|e| e.watermark > oldest);
        events.sort_by_key(|e| e.watermark);
        events.dedup_by_key(|e| e.watermark);

        let Some(batch_max) = events.last().map(|e| e.watermark) else {
            return Ok((
                UpdateReport {
                    oldest,
                    ..UpdateReport::default()
                },
                failures,
            ));
        };

        let mut by_namespace: BTreeMap<&str, Vec<&ChangeRecord>> = BTreeMap::new();
        for event in &events {
            by_namespace
                .entry(event.namespace.as_str())
                .or_default()
                .push(event);
        }

        let mut applied = BTreeMap::new();
        let mut next_oldest = batch_max;
        let cubes: Vec<_> = self.inner.cubes.read().await.values().cloned().collect();

        // Sequential on purpose: one cube at a time keeps failures attributable.
        for cube in cubes {
            let mut cube = cube.write().await;
            if !cube.is_valid() {
                continue;
            }
            let Some(records) = by_namespace.get(cube.source_namespace()) else {
                continue;
            };
            let pending: Vec<&&ChangeRecord> = records
                .iter()
                .filter(|r| r.watermark > cube.last_processed())
                .collect();
            let Some(watermark) = pending.last().map(|r| r.watermark) else {
                continue;
            };

            let mut ids: Vec<DocumentId> = Vec::with_capacity(pending.len());
            for record in &pending {
                match record.entity_id() {
                    Some(id) => ids.push(id),
                    None => warn!(
                        namespace = %record.namespace,
                        watermark = %record.watermark,
                        "change event without document id ignored"
                    ),
                }
            }

            match cube.apply_delta(&ids, watermark).await {
                Ok(stats) => {
                    applied.insert(cube.name().to_string(), stats);
                }
                Err(e) => {
                    error!(cube = %cube.name(), error = %e, "cube update failed");
                    if cube.is_valid() {
                        next_oldest = next_oldest.min(cube.last_processed());
                    }
                    failures.insert(cube.name().to_string(), e);
                }
            }
        }

        let oldest = oldest.max(next_oldest);
        *self.inner.oldest.write().await = oldest;
        if !failures.is_empty() {
            // Drained events for failed cubes are read back from the feed next time.
            let mut buffer = self.inner.buffer.lock().await;
            buffer.forwarded = buffer.forwarded.min(oldest);
        }
        // Every live cube is past `oldest`; the event at `oldest` itself stays
        // so the feed clock never restarts below it.
        match self.inner.feed.truncate_before(oldest).await {
            Ok(0) => {}
            Ok(dropped) => debug!(dropped, %oldest, "change log trimmed"),
            Err(e) => warn!(error = %e, "cannot trim change log"),
        }

        debug!(events = events.len(), cubes = applied.len(), %oldest, "update tick done");
        Ok((
            UpdateReport {
                events: events.len(),
                applied,
                oldest,
            },
            failures,
        ))
    }

    async fn collect_events(&self, oldest: Watermark, namespaces: &[String]) -> OlapResult<Vec<ChangeRecord>> {
        let feed = &self.inner.feed;
        if !self.is_buffering() {
            let mut buffer = self.inner.buffer.lock().await;
            buffer.queue = None;
            drop(buffer);

            let limit = self.inner.config.feed.pull_limit.map(|l| l.saturating_add(1));
            return feed.read_since(oldest, namespaces, limit).await;
        }

        let mut events = Vec::new();
        let bound = {
            let mut buffer = self.inner.buffer.lock().await;
            let mut forwarded = buffer.forwarded;
            if let Some(queue) = buffer.queue.as_mut() {
                while let Ok(record) = queue.try_recv() {
                    forwarded = forwarded.max(record.watermark);
                    events.push(record);
                }
            }
            buffer.forwarded = forwarded;
            forwarded.max(oldest)
        };

        // Catch up on anything the subscription has not forwarded yet.
        events.extend(feed.read_since(bound, namespaces, None).await?);
        Ok(events)
    }

    /// Update, then query a cube.
    ///
    /// Failures of other cubes during the update do not affect the query.
    pub async fn aggregate(&self, cube: &str, request: AggregateRequest) -> OlapResult<Vec<AggregateRow>> {
        let (_, mut failures) = self.tick().await?;
        if let Some(e) = failures.remove(cube) {
            return Err(e);
        }

        let live = self.inner.cubes.read().await.get(cube).cloned();
        let cube_lock = live.ok_or_else(|| OlapError::CubeNotFound {
            name: cube.to_string(),
        })?;
        let cube = cube_lock.read().await;
        cube.query(&request).await
    }

    /// Start forwarding change events for the live cubes into the queue.
    pub async fn start_buffering(&self) -> OlapResult<()> {
        self.ensure_open()?;
        self.inner.buffering.store(true, Ordering::SeqCst);
        self.save_state().await?;
        self.rearm_buffering().await;
        info!("buffering started");
        Ok(())
    }

    /// Stop forwarding change events. Safe to call at any time.
    pub async fn stop_buffering(&self) -> OlapResult<()> {
        self.ensure_open()?;
        self.inner.buffering.store(false, Ordering::SeqCst);
        self.stop_buffer_task().await;
        self.save_state().await?;
        info!("buffering stopped");
        Ok(())
    }

    async fn stop_buffer_task(&self) {
        let mut buffer = self.inner.buffer.lock().await;
        if let Some(task) = buffer.task.take() {
            task.signal();
            task.handle.abort();
        }
    }

    /// (Re)subscribe to the current set of source namespaces.
    async fn rearm_buffering(&self) {
        if !self.is_buffering() || self.is_closed() {
            return;
        }

        let namespaces = self.namespaces().await;
        let oldest = *self.inner.oldest.read().await;
        let mut buffer = self.inner.buffer.lock().await;
        if let Some(task) = buffer.task.take() {
            task.signal();
            task.handle.abort();
        }

        // Keep undrained events; the new subscription only adds to them.
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(mut old) = buffer.queue.replace(rx) {
            while let Ok(record) = old.try_recv() {
                let _ = tx.send(record);
            }
        }
        if namespaces.is_empty() {
            debug!("buffering armed with no cubes");
            return;
        }

        let since = buffer.forwarded.max(oldest);
        let feed = Arc::clone(&self.inner.feed);
        let initial = self.inner.config.retry_interval();
        let max = self.inner.config.max_retry_interval();
        debug!(?namespaces, %since, "subscribing to change feed");
        buffer.task = Some(BackgroundTask::spawn(move |shutdown| {
            forward_events(feed, namespaces, since, tx, shutdown, initial, max)
        }));
    }

    /// Run a tick every `interval` (or the configured default), measured
    /// from the end of the previous tick.
    pub async fn start_auto_update(&self, interval: Option<Duration>) -> OlapResult<()> {
        self.ensure_open()?;
        let interval = interval.unwrap_or_else(|| self.update_interval());
        self.inner.update_interval_ms.store(
            u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
            Ordering::SeqCst,
        );
        self.inner.auto_updating.store(true, Ordering::SeqCst);
        self.save_state().await?;

        let mut auto = self.inner.auto.lock().await;
        if let Some(task) = auto.take() {
            task.signal();
        }
        let weak = Arc::downgrade(&self.inner);
        *auto = Some(BackgroundTask::spawn(move |shutdown| auto_update(weak, interval, shutdown)));

        info!(interval_ms = interval.as_millis() as u64, "auto update started");
        Ok(())
    }

    /// Stop periodic updates. An in-flight tick runs to completion.
    pub async fn stop_auto_update(&self) -> OlapResult<()> {
        self.ensure_open()?;
        self.inner.auto_updating.store(false, Ordering::SeqCst);
        if let Some(task) = self.inner.auto.lock().await.take() {
            task.signal();
        }
        self.save_state().await?;
        info!("auto update stopped");
        Ok(())
    }

    /// Re-apply the persisted buffering and auto-update intent.
    pub async fn restore(&self) -> OlapResult<CoordinatorState> {
        self.ensure_open()?;
        let state = self.inner.storage.load_state().await?.unwrap_or_default();
        if state.buffering {
            self.start_buffering().await?;
        }
        if state.auto_updating {
            self.start_auto_update(Some(Duration::from_millis(state.update_interval_ms)))
                .await?;
        } else {
            self.inner
                .update_interval_ms
                .store(state.update_interval_ms, Ordering::SeqCst);
        }
        info!(
            buffering = state.buffering,
            auto_updating = state.auto_updating,
            "coordinator state restored"
        );
        Ok(state)
    }

    /// Stop background work, wait for the in-flight tick, then refuse
    /// further requests.
    ///
    /// The persisted buffering/auto-update intent is left untouched so a
    /// restart picks it up again.
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.inner.auto.lock().await.take() {
            task.signal();
        }
        self.stop_buffer_task().await;

        let _tick = self.inner.tick.lock().await;
        info!("coordinator shut down");
    }
}

async fn auto_update(inner: Weak<Inner>, interval: Duration, mut shutdown: broadcast::Receiver<()>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.recv() => break,
        }

        let Some(inner) = inner.upgrade() else {
            break;
        };
        let coordinator = Coordinator { inner };
        match coordinator.update_aggregates().await {
            Ok(report) if report.events > 0 => {
                debug!(events = report.events, "auto update applied changes");
            }
            Ok(_) => {}
            Err(OlapError::ShuttingDown) => break,
            Err(e) => warn!(error = %e, "auto update failed"),
        }
    }
}

async fn forward_events(
    feed: Arc<dyn ChangeFeed>,
    namespaces: Vec<String>,
    mut since: Watermark,
    queue: mpsc::UnboundedSender<ChangeRecord>,
    mut shutdown: broadcast::Receiver<()>,
    initial_delay: Duration,
    max_delay: Duration,
) {
    let mut delay = initial_delay;
    loop {
        let subscription = tokio::select! {
            result = feed.subscribe(since, namespaces.clone()) => result,
            _ = shutdown.recv() => return,
        };

        match subscription {
            Ok(mut events) => {
                delay = initial_delay;
                loop {
                    tokio::select! {
                        next = events.next() => match next {
                            Some(Ok(record)) => {
                                since = record.watermark;
                                if queue.send(record).is_err() {
                                    return;
                                }
                            }
                            Some(Err(e)) => {
                                warn!(error = %e, %since, "change feed subscription broke, resubscribing");
                                break;
                            }
                            None => {
                                warn!(%since, "change feed subscription ended, resubscribing");
                                break;
                            }
                        },
                        _ = shutdown.recv() => return,
                    }
                }
            }
            Err(e) => warn!(error = %e, "cannot subscribe to change feed"),
        }

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.recv() => return,
        }
        delay = (delay * 2).min(max_delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::MemoryChangeLog;
    use crate::model::{Dimension, Measure};
    use crate::storage::MemoryStore;
    use serde_json::json;

    fn create_test_coordinator() -> (Arc<MemoryStore>, Coordinator) {
        let store = Arc::new(MemoryStore::new());
        let feed: Arc<MemoryChangeLog> = store.change_log();
        let coordinator = Coordinator::new(store.clone(), feed, OlapConfig::default());
        (store, coordinator)
    }

    fn city_model() -> Model {
        Model::new("c1")
            .dimension(Dimension::new("c", "city").unwrap())
            .measure(Measure::new("m", "males").unwrap())
    }

    #[tokio::test]
    async fn test_duplicate_cube_rejected() {
        let (_store, coordinator) = create_test_coordinator();
        coordinator.create_cube("main", city_model(), None, false).await.unwrap();
        let err = coordinator
            .create_cube("main", city_model(), None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, OlapError::DuplicateCube { .. }));
    }

    #[tokio::test]
    async fn test_first_cube_sets_oldest() {
        let (store, coordinator) = create_test_coordinator();
        store.insert_document("c1", json!({"c": "a", "m": 1})).await.unwrap();
        let meta = coordinator.create_cube("main", city_model(), None, false).await.unwrap();
        assert_eq!(coordinator.oldest_watermark().await, meta.last_processed);
    }

    #[tokio::test]
    async fn test_update_advances_oldest() {
        let (store, coordinator) = create_test_coordinator();
        coordinator.create_cube("main", city_model(), None, false).await.unwrap();
        store.insert_document("c1", json!({"c": "a", "m": 1})).await.unwrap();
        store.insert_document("other", json!({"x": 1})).await.unwrap();
        let head = store.change_log().head().await.unwrap();

        let report = coordinator.update_aggregates().await.unwrap();
        assert_eq!(report.events, 1);
        assert!(report.applied.contains_key("main"));
        assert!(report.oldest <= head);

        let again = coordinator.update_aggregates().await.unwrap();
        assert_eq!(again.events, 0);
    }

    #[tokio::test]
    async fn test_tick_trims_change_log() {
        let (store, coordinator) = create_test_coordinator();
        coordinator.create_cube("main", city_model(), None, false).await.unwrap();
        for i in 0..5 {
            store.insert_document("c1", json!({"c": "a", "m": i})).await.unwrap();
        }
        store.insert_document("other", json!({"x": 1})).await.unwrap();
        assert_eq!(store.change_log().len().await, 6);

        let report = coordinator.update_aggregates().await.unwrap();
        let records = store.change_log().records().await;
        assert!(records.iter().all(|r| r.watermark >= report.oldest));
        assert!(records.len() < 6);

        store.insert_document("c1", json!({"c": "b", "m": 10})).await.unwrap();
        let rows = coordinator
            .aggregate("main", AggregateRequest::new().measure("males"))
            .await
            .unwrap();
        assert_eq!(rows[0].count, 6);
        assert_eq!(rows[0].m.as_ref().unwrap()["males"], json!(20));
    }

    #[tokio::test]
    async fn test_aggregate_sees_latest_writes() {
        let (store, coordinator) = create_test_coordinator();
        coordinator.create_cube("main", city_model(), None, false).await.unwrap();
        store.insert_document("c1", json!({"c": "a", "m": 3})).await.unwrap();

        let rows = coordinator
            .aggregate("main", AggregateRequest::new().measure("males"))
            .await
            .unwrap();
        assert_eq!(rows[0].count, 1);
        assert_eq!(rows[0].m.as_ref().unwrap()["males"], json!(3));
    }

    #[tokio::test]
    async fn test_unknown_cube() {
        let (_store, coordinator) = create_test_coordinator();
        assert!(matches!(
            coordinator.aggregate("nope", AggregateRequest::new()).await,
            Err(OlapError::CubeNotFound { .. })
        ));
        assert!(matches!(
            coordinator.delete_cube("nope").await,
            Err(OlapError::CubeNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_flags_persisted() {
        let (store, coordinator) = create_test_coordinator();
        coordinator.start_buffering().await.unwrap();
        coordinator
            .start_auto_update(Some(Duration::from_millis(50)))
            .await
            .unwrap();

        let state = store.load_state().await.unwrap().unwrap();
        assert!(state.buffering);
        assert!(state.auto_updating);
        assert_eq!(state.update_interval_ms, 50);

        coordinator.stop_auto_update().await.unwrap();
        coordinator.stop_buffering().await.unwrap();
        let state = store.load_state().await.unwrap().unwrap();
        assert!(!state.buffering);
        assert!(!state.auto_updating);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_work() {
        let (_store, coordinator) = create_test_coordinator();
        coordinator.shutdown().await;
        assert!(coordinator.is_closed());
        assert!(matches!(
            coordinator.update_aggregates().await,
            Err(OlapError::ShuttingDown)
        ));
        assert!(matches!(
            coordinator.create_cube("main", city_model(), None, false).await,
            Err(OlapError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_connect_retries_until_storage_is_back() {
        let store = Arc::new(MemoryStore::new());
        store.set_available(false);
        let config = OlapConfig::default().retry(Duration::from_millis(5), Duration::from_millis(20));

        let revive = store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            revive.set_available(true);
        });

        let feed: Arc<MemoryChangeLog> = store.change_log();
        let coordinator = tokio::time::timeout(
            Duration::from_secs(5),
            Coordinator::connect(store.clone(), feed, config),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(!coordinator.is_closed());
    }

    async fn drain_buffered(coordinator: &Coordinator, seen: &mut std::collections::BTreeSet<String>) {
        let mut buffer = coordinator.inner.buffer.lock().await;
        if let Some(queue) = buffer.queue.as_mut() {
            while let Ok(record) = queue.try_recv() {
                seen.extend(record.entity_id());
            }
        }
    }

    async fn wait_for(mut condition: impl AsyncFnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition().await {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_lagging_subscription_resubscribes() {
        let log = Arc::new(MemoryChangeLog::with_capacity(2));
        let store = Arc::new(MemoryStore::with_change_log(log.clone()));
        let config = OlapConfig::default().retry(Duration::from_millis(5), Duration::from_millis(20));
        let coordinator = Coordinator::new(store.clone(), log.clone(), config);
        coordinator.create_cube("main", city_model(), None, true).await.unwrap();
        coordinator.start_buffering().await.unwrap();
        wait_for(async || log.subscriber_count() == 1).await;

        // Far more events than the channel holds, without yielding to the
        // forwarding task in between.
        for i in 0..10 {
            store
                .insert_document("c1", json!({"_id": format!("d{}", i), "c": "a", "m": 1}))
                .await
                .unwrap();
        }

        let mut seen = std::collections::BTreeSet::new();
        let flooded: std::collections::BTreeSet<String> = (0..10).map(|i| format!("d{}", i)).collect();
        wait_for(async || {
            drain_buffered(&coordinator, &mut seen).await;
            seen.is_superset(&flooded)
        })
        .await;
        wait_for(async || log.subscriber_count() == 1).await;

        store
            .insert_document("c1", json!({"_id": "late", "c": "b", "m": 2}))
            .await
            .unwrap();
        wait_for(async || {
            drain_buffered(&coordinator, &mut seen).await;
            seen.contains("late")
        })
        .await;
        assert!(coordinator.is_buffering());

        let rows = coordinator
            .aggregate("main", AggregateRequest::new().measure("males"))
            .await
            .unwrap();
        assert_eq!(rows[0].count, 11);
        assert_eq!(rows[0].m.as_ref().unwrap()["males"], json!(12));
    }
}
