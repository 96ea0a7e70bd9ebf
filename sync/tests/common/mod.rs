//! Shared fixtures for the sync integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tether_engine::{ConflictResolver, Fields, HttpMethod, Schema, Timestamp};
use tether_sync::{
    ChangeSet, Components, Config, ConnectivityMonitor, EventBus, MemoryStorage, Remote,
    RemoteError, RemoteRequest, RuntimeClock, SyncEvent, SyncOrchestrator,
};
use tokio::sync::broadcast;
use tokio::time::Instant;

/// Wall time the test clocks start at (2024-02-01T00:00:00Z).
pub const EPOCH: Timestamp = 1_706_745_600_000;

pub fn fields(value: Value) -> Fields {
    value.as_object().cloned().unwrap_or_default()
}

/// What the stub does with one `send`.
#[derive(Debug, Clone)]
pub enum Reply {
    Accept,
    Fail(RemoteError),
    /// Applied, but the response is lost in transit
    AcceptLost,
    /// Never answers within any sane timeout
    Hang,
}

impl Reply {
    pub fn status(code: u16) -> Self {
        if (400..500).contains(&code) {
            Reply::Fail(RemoteError::Permanent {
                status: Some(code),
                message: format!("{code}"),
            })
        } else {
            Reply::Fail(RemoteError::Transient(format!("{code}")))
        }
    }
}

/// One request the stub received.
#[derive(Debug, Clone)]
pub struct Call {
    pub at: Instant,
    pub request: RemoteRequest,
}

#[derive(Debug, Default)]
struct State {
    replies: VecDeque<Reply>,
    calls: Vec<Call>,
    /// Accepted rows by endpoint of the record (`/tasks/42`)
    rows: BTreeMap<String, Value>,
    /// Idempotency keys already applied
    applied: HashSet<String>,
    duplicates: usize,
    changes: VecDeque<Result<ChangeSet, RemoteError>>,
    fetches: Vec<Option<Timestamp>>,
}

/// In-memory remote with scripted replies.
///
/// Replies are consumed in call order; once the script runs out every call
/// is accepted. Accepted requests are applied to an in-memory table unless
/// their idempotency key was seen before.
#[derive(Debug, Clone, Default)]
pub struct ScriptedRemote {
    state: Arc<Mutex<State>>,
}

impl ScriptedRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, replies: impl IntoIterator<Item = Reply>) {
        self.lock().replies.extend(replies);
    }

    pub fn push_changes(&self, changes: Result<ChangeSet, RemoteError>) {
        self.lock().changes.push_back(changes);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.lock().calls.len()
    }

    pub fn endpoints(&self) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .map(|c| format!("{} {}", c.request.method.as_str(), c.request.endpoint))
            .collect()
    }

    pub fn row(&self, endpoint: &str) -> Option<Value> {
        self.lock().rows.get(endpoint).cloned()
    }

    pub fn duplicates(&self) -> usize {
        self.lock().duplicates
    }

    pub fn fetches(&self) -> Vec<Option<Timestamp>> {
        self.lock().fetches.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    fn apply(state: &mut State, request: &RemoteRequest) {
        if let Some(key) = request.idempotency_key() {
            if !state.applied.insert(key.to_string()) {
                state.duplicates += 1;
                return;
            }
        }

        match (request.method, &request.body) {
            (HttpMethod::Post, Some(record)) => {
                let id = record["id"].as_str().unwrap_or_default();
                state
                    .rows
                    .insert(format!("{}/{id}", request.endpoint), record["fields"].clone());
            }
            (HttpMethod::Put, Some(Value::Object(patch))) => {
                let row = state
                    .rows
                    .entry(request.endpoint.clone())
                    .or_insert_with(|| Value::Object(Default::default()));
                if let Value::Object(row) = row {
                    for (k, v) in patch {
                        row.insert(k.clone(), v.clone());
                    }
                }
            }
            (HttpMethod::Delete, _) => {
                state.rows.remove(&request.endpoint);
            }
            _ => {}
        }
    }
}

#[async_trait]
impl Remote for ScriptedRemote {
    async fn send(&self, request: &RemoteRequest) -> Result<(), RemoteError> {
        let reply = {
            let mut state = self.lock();
            state.calls.push(Call {
                at: Instant::now(),
                request: request.clone(),
            });
            state.replies.pop_front().unwrap_or(Reply::Accept)
        };

        match reply {
            Reply::Accept => {
                Self::apply(&mut self.lock(), request);
                Ok(())
            }
            Reply::Fail(e) => Err(e),
            Reply::AcceptLost => {
                Self::apply(&mut self.lock(), request);
                Err(RemoteError::Transient("connection reset".into()))
            }
            Reply::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(RemoteError::Transient("hung request finished".into()))
            }
        }
    }

    async fn fetch_changes(&self, since: Option<Timestamp>) -> Result<ChangeSet, RemoteError> {
        let mut state = self.lock();
        state.fetches.push(since);
        state.changes.pop_front().unwrap_or_else(|| Ok(ChangeSet::default()))
    }

    async fn ping(&self) -> Result<(), RemoteError> {
        Ok(())
    }
}

/// Config with short timings and background syncs off.
pub fn test_config() -> Config {
    Config {
        stability_window: Duration::from_millis(100),
        sync_interval: None,
        ..Config::default()
    }
}

pub struct Harness {
    pub sync: SyncOrchestrator,
    pub remote: ScriptedRemote,
    pub storage: Arc<MemoryStorage>,
    pub connectivity: Arc<ConnectivityMonitor>,
    pub events: broadcast::Receiver<SyncEvent>,
}

impl Harness {
    pub fn new(online: bool) -> Self {
        Self::with(test_config(), online, Arc::new(MemoryStorage::new()))
    }

    pub fn with(config: Config, online: bool, storage: Arc<MemoryStorage>) -> Self {
        let remote = ScriptedRemote::new();
        let connectivity = ConnectivityMonitor::spawn(online, config.stability_window);
        let bus = EventBus::default();
        let events = bus.subscribe();

        let sync = SyncOrchestrator::new(Components {
            config,
            schema: Schema::dashboard(),
            resolver: ConflictResolver::default(),
            storage: storage.clone(),
            remote: Arc::new(remote.clone()),
            connectivity: connectivity.clone(),
            clock: Arc::new(RuntimeClock::starting_at(EPOCH)),
            events: bus,
        });

        Self {
            sync,
            remote,
            storage,
            connectivity,
            events,
        }
    }

    /// Flip connectivity and wait out the stability window.
    pub async fn set_online(&self, online: bool) {
        self.connectivity.report(online);
        let mut rx = self.connectivity.watch();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|v| *v == online))
            .await
            .expect("connectivity did not settle")
            .expect("monitor dropped");
    }

    /// Events published so far, without waiting.
    pub fn drain_events(&mut self) -> Vec<SyncEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }
}
