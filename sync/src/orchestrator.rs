//! The sync orchestrator: one instance coordinates initialization, queue
//! replay and incremental sync for the whole process.
//!
//! # Initialization
//!
//! [`SyncOrchestrator::ensure_initialized`] runs the load sequence exactly
//! once. Concurrent callers share the same in-flight future. A failure or a
//! timeout resets the state so a later call starts over, and is broadcast as
//! [`SyncEvent::InitializationFailed`] with a retry affordance.
//!
//! # Replay
//!
//! Draining takes entries from the queue in id order. Entries for different
//! records are dispatched concurrently; the queue never hands out two entries
//! for the same record at once. Each call is bounded by the request timeout.
//!
//! ```text
//! pending → in-flight → done (removed)
//!                     → retryable, attempts left → pending after backoff
//!                     → retryable, out of attempts → failed
//!                     → permanent (4xx, invalid payload) → failed
//! ```
//!
//! A failed action holds back later actions for its record until it is
//! retried ([`SyncOrchestrator::retry_action`]) or dropped
//! ([`SyncOrchestrator::discard_action`]).

use crate::config::Config;
use crate::connectivity::ConnectivityMonitor;
use crate::error::{RemoteError, Result, SyncError};
use crate::events::{EventBus, RetryAction, SyncEvent};
use crate::gateway::Gateway;
use crate::local_store::LocalStore;
use crate::offline_queue::OfflineQueue;
use crate::remote::{Remote, RemoteRequest};
use crate::storage::Storage;
use futures::future::{BoxFuture, FutureExt, Shared};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tether_engine::{
    ActionId, Clock, ConflictResolver, QueuedAction, ReplayOutcome, Schema, SyncCursor, SyncLog,
    SyncStatistics, Timestamp, SYNC_STATE_KEY,
};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

type InitFuture = Shared<BoxFuture<'static, Result<()>>>;
type Replayed = (QueuedAction, std::result::Result<(), RemoteError>);

enum InitState {
    Idle,
    Running { generation: u64, future: InitFuture },
    Ready,
    ShutDown,
}

/// Everything the orchestrator is built from.
#[derive(Debug, Clone)]
pub struct Components {
    pub config: Config,
    pub schema: Schema,
    pub resolver: ConflictResolver,
    pub storage: Arc<dyn Storage>,
    pub remote: Arc<dyn Remote>,
    pub connectivity: Arc<ConnectivityMonitor>,
    pub clock: Arc<dyn Clock>,
    pub events: EventBus,
}

/// Counts from one incremental sync run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    /// Queued actions replayed successfully
    pub completed: usize,
    /// Queued actions that ended up failed
    pub failed: usize,
    /// Replays scheduled for another attempt
    pub retried: usize,
    /// Remote rows and tombstones received
    pub pulled: usize,
    pub conflicts: usize,
    /// Local records removed by remote tombstones
    pub deleted: usize,
    pub duration_ms: u64,
}

struct Inner {
    config: Config,
    resolver: ConflictResolver,
    storage: Arc<dyn Storage>,
    remote: Arc<dyn Remote>,
    connectivity: Arc<ConnectivityMonitor>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    store: Arc<LocalStore>,
    queue: Arc<OfflineQueue>,
    gateway: Gateway,
    init: Mutex<InitState>,
    generation: AtomicU64,
    init_runs: AtomicUsize,
    sync_lock: Arc<Mutex<()>>,
    cursor: Mutex<SyncCursor>,
    log: Mutex<SyncLog>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        for task in self.background.get_mut().drain(..) {
            task.abort();
        }
    }
}

/// Handle to the process-wide sync coordinator. Cheap to clone.
///
/// Construct one in the composition root and pass it around; tests build
/// isolated instances.
#[derive(Clone)]
pub struct SyncOrchestrator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SyncOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncOrchestrator")
            .field("config", &self.inner.config)
            .field("online", &self.inner.connectivity.is_online())
            .finish_non_exhaustive()
    }
}

impl SyncOrchestrator {
    pub fn new(components: Components) -> Self {
        let Components {
            config,
            schema,
            resolver,
            storage,
            remote,
            connectivity,
            clock,
            events,
        } = components;

        let store = Arc::new(LocalStore::new(schema, storage.clone(), clock.clone()));
        let queue = Arc::new(OfflineQueue::new(
            config.queue_capacity,
            storage.clone(),
            clock.clone(),
            events.clone(),
        ));
        let gateway = Gateway::new(
            store.clone(),
            queue.clone(),
            connectivity.clone(),
            remote.clone(),
            events.clone(),
            config.request_timeout,
        );

        Self {
            inner: Arc::new(Inner {
                config,
                resolver,
                storage,
                remote,
                connectivity,
                clock,
                events,
                store,
                queue,
                gateway,
                init: Mutex::new(InitState::Idle),
                generation: AtomicU64::new(0),
                init_runs: AtomicUsize::new(0),
                sync_lock: Arc::new(Mutex::new(())),
                cursor: Mutex::new(SyncCursor::default()),
                log: Mutex::new(SyncLog::new()),
                background: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.inner.store
    }

    pub fn queue(&self) -> &Arc<OfflineQueue> {
        &self.inner.queue
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn connectivity(&self) -> &Arc<ConnectivityMonitor> {
        &self.inner.connectivity
    }

    /// Write access for the UI, available once initialized.
    pub async fn gateway(&self) -> Result<&Gateway> {
        self.ensure_initialized().await?;
        Ok(&self.inner.gateway)
    }

    /// How many initialization sequences have started.
    pub fn initialization_count(&self) -> usize {
        self.inner.init_runs.load(Ordering::SeqCst)
    }

    /// Initialize once. Concurrent callers await the same attempt.
    pub async fn ensure_initialized(&self) -> Result<()> {
        let future = {
            let mut state = self.inner.init.lock().await;
            match &*state {
                InitState::Ready => return Ok(()),
                InitState::ShutDown => return Err(SyncError::ShutDown),
                InitState::Running { future, .. } => future.clone(),
                InitState::Idle => {
                    let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
                    let future = self.spawn_initialization(generation);
                    *state = InitState::Running {
                        generation,
                        future: future.clone(),
                    };
                    future
                }
            }
        };

        future.await
    }

    fn spawn_initialization(&self, generation: u64) -> InitFuture {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let result = this.initialize().await;
            this.finish_initialization(generation, &result).await;
            result
        });

        let weak = Arc::downgrade(&self.inner);
        async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => {
                    let err = SyncError::Initialization(format!("initialization task failed: {e}"));
                    if let Some(inner) = weak.upgrade() {
                        SyncOrchestrator { inner }
                            .finish_initialization(generation, &Err(err.clone()))
                            .await;
                    }
                    Err(err)
                }
            }
        }
        .boxed()
        .shared()
    }

    async fn initialize(&self) -> Result<()> {
        let inner = &self.inner;
        inner.init_runs.fetch_add(1, Ordering::SeqCst);
        tracing::info!("initializing sync orchestrator");

        let load = async {
            let records = inner.store.load().await?;
            let recovered = inner.queue.load().await?;
            let cursor = match inner.storage.read(SYNC_STATE_KEY).await? {
                Some(json) => SyncCursor::from_json(&json)?,
                None => SyncCursor::default(),
            };
            Ok::<_, SyncError>((records, recovered, cursor))
        };

        let (records, recovered, cursor) =
            match tokio::time::timeout(inner.config.init_timeout, load).await {
                Ok(Ok(loaded)) => loaded,
                Ok(Err(e)) => return Err(SyncError::Initialization(e.to_string())),
                Err(_) => {
                    return Err(SyncError::Initialization(format!(
                        "timed out after {:?}",
                        inner.config.init_timeout
                    )))
                }
            };

        // Held while spawning so a concurrent shutdown either sees the tasks
        // or stops them from starting
        let state = inner.init.lock().await;
        if matches!(*state, InitState::ShutDown) {
            return Err(SyncError::ShutDown);
        }
        *inner.cursor.lock().await = cursor;
        self.spawn_background().await;
        drop(state);

        tracing::info!(records, recovered, "sync orchestrator initialized");
        Ok(())
    }

    async fn finish_initialization(&self, generation: u64, result: &Result<()>) {
        let mut state = self.inner.init.lock().await;
        let current = matches!(
            &*state,
            InitState::Running { generation: g, .. } if *g == generation
        );
        if !current {
            return;
        }

        match result {
            Ok(()) => *state = InitState::Ready,
            Err(e) => {
                *state = InitState::Idle;
                tracing::error!(error = %e, "sync orchestrator initialization failed");
                self.inner.events.publish(SyncEvent::InitializationFailed {
                    error: e.to_string(),
                    retry: RetryAction::Initialize,
                });
            }
        }
    }

    /// Start the connectivity listener and the periodic sync ticker.
    async fn spawn_background(&self) {
        let mut tasks = self.inner.background.lock().await;
        let weak = Arc::downgrade(&self.inner);

        let mut rx = self.inner.connectivity.watch();
        let _ = rx.borrow_and_update();
        let listener_weak = weak.clone();
        tasks.push(tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let online = *rx.borrow_and_update();
                let Some(this) = upgrade(&listener_weak) else {
                    break;
                };
                this.inner
                    .events
                    .publish(SyncEvent::ConnectivityChanged { online });
                if online {
                    tracing::info!("back online, starting sync");
                    this.sync_in_background();
                }
            }
        }));

        if let Some(period) = self.inner.config.sync_interval {
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    let Some(this) = upgrade(&weak) else {
                        break;
                    };
                    if this.inner.connectivity.is_online() {
                        tracing::debug!("periodic sync");
                        this.sync_in_background();
                    }
                }
            }));
        }
    }

    fn sync_in_background(&self) {
        let this = self.clone();
        tokio::spawn(async move {
            match this.sync_if_idle().await {
                Ok(Some(_)) => {}
                Ok(None) => tracing::trace!("sync already running"),
                Err(e) => tracing::debug!(error = %e, "background sync did not complete"),
            }
        });
    }

    /// Drain the queue, then pull remote changes since the last successful
    /// sync. Waits for a sync already in progress to finish first.
    pub async fn start_incremental_sync(&self) -> Result<SyncReport> {
        self.ensure_initialized().await?;
        let guard = self.inner.sync_lock.clone().lock_owned().await;
        self.spawn_run(guard).await
    }

    async fn sync_if_idle(&self) -> Result<Option<SyncReport>> {
        self.ensure_initialized().await?;
        let Ok(guard) = self.inner.sync_lock.clone().try_lock_owned() else {
            return Ok(None);
        };
        self.spawn_run(guard).await.map(Some)
    }

    /// Run on its own task so a cancelled caller cannot strand actions in
    /// flight.
    async fn spawn_run(&self, guard: OwnedMutexGuard<()>) -> Result<SyncReport> {
        let this = self.clone();
        tokio::spawn(async move {
            let _guard = guard;
            this.run_sync().await
        })
        .await
        .unwrap_or_else(|e| Err(SyncError::Task(e.to_string())))
    }

    async fn run_sync(&self) -> Result<SyncReport> {
        let inner = &self.inner;
        if !inner.connectivity.is_online() {
            return Err(SyncError::Offline);
        }

        tracing::info!("incremental sync started");
        inner.events.publish(SyncEvent::SyncStarted);
        let started = Instant::now();

        match self.sync_once().await {
            Ok(mut report) => {
                report.duration_ms = millis(started.elapsed());
                inner.log.lock().await.record_run(
                    inner.clock.now(),
                    report.duration_ms,
                    report.pulled,
                    report.conflicts,
                );

                tracing::info!(
                    completed = report.completed,
                    failed = report.failed,
                    pulled = report.pulled,
                    conflicts = report.conflicts,
                    duration_ms = report.duration_ms,
                    "incremental sync completed"
                );
                inner.events.publish(SyncEvent::SyncCompleted {
                    completed: report.completed,
                    failed: report.failed,
                    pulled: report.pulled,
                    conflicts: report.conflicts,
                    duration_ms: report.duration_ms,
                });
                Ok(report)
            }
            Err(e) => {
                tracing::warn!(error = %e, "incremental sync failed");
                inner.events.publish(SyncEvent::SyncFailed {
                    error: e.to_string(),
                    retry: RetryAction::Sync,
                });
                Err(e)
            }
        }
    }

    async fn sync_once(&self) -> Result<SyncReport> {
        let inner = &self.inner;
        let mut report = SyncReport::default();

        self.drain(&mut report).await?;
        if !inner.connectivity.is_online() {
            return Err(SyncError::Offline);
        }

        let since = inner.cursor.lock().await.cursor;
        let changes = match tokio::time::timeout(
            inner.config.request_timeout,
            inner.remote.fetch_changes(since),
        )
        .await
        {
            Ok(changes) => changes?,
            Err(_) => return Err(RemoteError::Timeout(inner.config.request_timeout).into()),
        };

        let applied = inner.store.apply_remote(&changes, &inner.resolver).await?;
        for case in &applied.conflicts {
            tracing::info!(
                module = %case.local.module,
                record_id = %case.local.id,
                outcome = case.outcome.as_str(),
                "conflict resolved"
            );
            inner.events.publish(SyncEvent::ConflictResolved {
                module: case.local.module,
                record_id: case.local.id.clone(),
                outcome: case.outcome,
            });
        }
        report.pulled = changes.len();
        report.conflicts = applied.conflicts.len();
        report.deleted = applied.deleted;

        if let Some(next) = changes.cursor {
            let mut cursor = inner.cursor.lock().await;
            let mut advanced = cursor.clone();
            advanced.advance(next, inner.clock.now());
            inner
                .storage
                .write(SYNC_STATE_KEY, advanced.to_json()?)
                .await?;
            *cursor = advanced;
        }

        Ok(report)
    }

    /// Replay queued actions until none is dispatchable or waiting on a
    /// backoff, or until connectivity drops. One failing entry never stops
    /// the others.
    async fn drain(&self, report: &mut SyncReport) -> Result<()> {
        let inner = &self.inner;
        let mut in_flight = FuturesUnordered::new();
        let mut storage_error: Option<SyncError> = None;

        loop {
            while storage_error.is_none()
                && in_flight.len() < inner.config.max_concurrent_replays
                && inner.connectivity.is_online()
            {
                match inner.queue.dequeue_next().await {
                    Ok(Some(action)) => in_flight.push(self.replay(action)),
                    Ok(None) => break,
                    Err(e) => {
                        tracing::error!(error = %e, "cannot dispatch queued action");
                        storage_error = Some(e);
                    }
                }
            }

            let next_retry = if storage_error.is_none() && inner.connectivity.is_online() {
                inner.queue.next_retry_at().await
            } else {
                None
            };

            if in_flight.is_empty() {
                match next_retry {
                    Some(at) => {
                        tokio::time::sleep(self.until(at)).await;
                        continue;
                    }
                    None => break,
                }
            }

            let wake = next_retry.map(|at| self.until(at));
            tokio::select! {
                Some((action, result)) = in_flight.next() => {
                    if let Err(e) = self.settle(action, result, report).await {
                        tracing::error!(error = %e, "cannot record replay outcome");
                        storage_error.get_or_insert(e);
                    }
                }
                _ = sleep_or_pending(wake) => {}
            }
        }

        match storage_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn replay(&self, action: QueuedAction) -> Replayed {
        let inner = &self.inner;
        let timeout = inner.config.request_timeout;

        let result = match RemoteRequest::for_mutation(inner.store.schema(), &action.mutation) {
            Ok(request) => match tokio::time::timeout(timeout, inner.remote.send(&request)).await {
                Ok(result) => result,
                Err(_) => Err(RemoteError::Timeout(timeout)),
            },
            Err(e) => Err(e),
        };
        (action, result)
    }

    async fn settle(
        &self,
        action: QueuedAction,
        result: std::result::Result<(), RemoteError>,
        report: &mut SyncReport,
    ) -> Result<()> {
        let inner = &self.inner;
        let policy = inner.config.retry;
        let now = inner.clock.now();
        let key = action.key();

        match result {
            Ok(()) => {
                inner.queue.mark_done(action.id).await?;
                inner
                    .log
                    .lock()
                    .await
                    .record_replay(now, ReplayOutcome::Completed);
                report.completed += 1;
                tracing::debug!(
                    action_id = action.id,
                    module = %key.module,
                    record_id = %key.id,
                    attempt = action.attempts,
                    "action replayed"
                );
            }
            Err(e) if e.is_retryable() && policy.can_retry(action.attempts) => {
                let delay = policy.delay_for(action.attempts);
                let delay_ms = millis(delay);
                inner
                    .queue
                    .schedule_retry(action.id, e.to_string(), now.saturating_add(delay_ms))
                    .await?;
                report.retried += 1;

                tracing::warn!(
                    action_id = action.id,
                    module = %key.module,
                    record_id = %key.id,
                    attempt = action.attempts,
                    delay_ms,
                    error = %e,
                    "replay failed, retry scheduled"
                );
                inner.events.publish(SyncEvent::ActionRetrying {
                    action_id: action.id,
                    attempt: action.attempts,
                    delay_ms,
                    error: e.to_string(),
                });
            }
            Err(e) => {
                let permanent = !e.is_retryable();
                inner.queue.mark_failed(action.id, e.to_string()).await?;
                inner
                    .log
                    .lock()
                    .await
                    .record_replay(now, ReplayOutcome::Failed);
                report.failed += 1;

                tracing::error!(
                    action_id = action.id,
                    module = %key.module,
                    record_id = %key.id,
                    attempt = action.attempts,
                    permanent,
                    error = %e,
                    "replay failed"
                );
                inner.events.publish(SyncEvent::ActionFailed {
                    action_id: action.id,
                    module: key.module,
                    record_id: key.id,
                    error: e.to_string(),
                    permanent,
                    retry: RetryAction::Action(action.id),
                });
            }
        }
        Ok(())
    }

    /// Derived statistics. Never triggers a sync.
    pub async fn get_sync_statistics(&self) -> SyncStatistics {
        let pending = self.inner.queue.outstanding_count().await;
        self.inner
            .log
            .lock()
            .await
            .statistics(pending, self.inner.clock.now())
    }

    /// Carry out the retry affordance attached to an event.
    pub async fn retry(&self, action: RetryAction) -> Result<()> {
        match action {
            RetryAction::Initialize => self.ensure_initialized().await,
            RetryAction::Sync => self.start_incremental_sync().await.map(|_| ()),
            RetryAction::Action(id) => self.retry_action(id).await,
        }
    }

    /// Give a failed action a fresh attempt budget and, if online, replay it
    /// in the background.
    pub async fn retry_action(&self, id: ActionId) -> Result<()> {
        self.ensure_initialized().await?;
        self.inner.queue.retry_failed(id).await?;
        if self.inner.connectivity.is_online() {
            self.sync_in_background();
        }
        Ok(())
    }

    /// Drop a failed action for good. Writes queued behind it for the same
    /// record become dispatchable again.
    pub async fn discard_action(&self, id: ActionId) -> Result<()> {
        self.ensure_initialized().await?;
        self.inner.queue.discard_failed(id).await?;
        if self.inner.connectivity.is_online() {
            self.sync_in_background();
        }
        Ok(())
    }

    /// Stop background tasks. Later calls fail with [`SyncError::ShutDown`].
    pub async fn shutdown(&self) {
        *self.inner.init.lock().await = InitState::ShutDown;
        for task in self.inner.background.lock().await.drain(..) {
            task.abort();
        }
        tracing::info!("sync orchestrator shut down");
    }

    fn until(&self, at: Timestamp) -> Duration {
        Duration::from_millis(at.saturating_sub(self.inner.clock.now()))
    }
}

fn upgrade(weak: &Weak<Inner>) -> Option<SyncOrchestrator> {
    weak.upgrade().map(|inner| SyncOrchestrator { inner })
}

async fn sleep_or_pending(wake: Option<Duration>) {
    match wake {
        Some(delay) => tokio::time::sleep(delay).await,
        None => std::future::pending().await,
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
