//! Integration tests for the HTTP remote against a local axum stub.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tether_engine::{Module, Mutation, Record, Schema};
use tether_sync::{HttpRemote, Remote, RemoteError, RemoteRequest, IDEMPOTENCY_HEADER};

/// Rows by `module/id`, plus the idempotency keys already applied.
#[derive(Clone, Default)]
struct Stub {
    rows: Arc<DashMap<String, Value>>,
    seen: Arc<DashMap<String, ()>>,
    duplicates: Arc<AtomicUsize>,
}

impl Stub {
    fn first_time(&self, headers: &HeaderMap) -> bool {
        let Some(key) = headers.get(IDEMPOTENCY_HEADER).and_then(|v| v.to_str().ok()) else {
            return true;
        };
        if self.seen.insert(key.to_string(), ()).is_some() {
            self.duplicates.fetch_add(1, Ordering::SeqCst);
            return false;
        }
        true
    }
}

async fn create(
    State(stub): State<Stub>,
    Path(module): Path<String>,
    headers: HeaderMap,
    Json(record): Json<Value>,
) -> StatusCode {
    if stub.first_time(&headers) {
        let id = record["id"].as_str().unwrap_or_default().to_string();
        stub.rows.insert(format!("{module}/{id}"), record["fields"].clone());
    }
    StatusCode::CREATED
}

async fn update(
    State(stub): State<Stub>,
    Path((module, id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(patch): Json<Value>,
) -> StatusCode {
    let key = format!("{module}/{id}");
    if !stub.rows.contains_key(&key) {
        return StatusCode::NOT_FOUND;
    }
    if stub.first_time(&headers) {
        if let (Some(mut row), Value::Object(patch)) = (stub.rows.get_mut(&key), patch) {
            if let Value::Object(row) = row.value_mut() {
                row.extend(patch);
            }
        }
    }
    StatusCode::OK
}

async fn delete(
    State(stub): State<Stub>,
    Path((module, id)): Path<(String, String)>,
) -> StatusCode {
    stub.rows.remove(&format!("{module}/{id}"));
    StatusCode::NO_CONTENT
}

#[derive(Deserialize)]
struct Since {
    since: Option<u64>,
}

async fn changes(Query(query): Query<Since>) -> (StatusCode, Json<Value>) {
    match query.since {
        Some(since) if since > 1_000 => (StatusCode::OK, Json(json!({ "cursor": since }))),
        _ => (
            StatusCode::OK,
            Json(json!({
                "records": [{
                    "id": "7",
                    "type": "tasks",
                    "fields": { "title": "from server" },
                    "createdAt": 500,
                    "updatedAt": 900
                }],
                "deleted": [{ "module": "tasks", "id": "3", "deletedAt": 950 }],
                "cursor": 1_000
            })),
        ),
    }
}

async fn unavailable() -> StatusCode {
    StatusCode::SERVICE_UNAVAILABLE
}

async fn not_modified() -> StatusCode {
    StatusCode::NOT_MODIFIED
}

async fn slow() -> StatusCode {
    tokio::time::sleep(Duration::from_secs(5)).await;
    StatusCode::OK
}

/// Serve the stub on an ephemeral port and return its base URL.
async fn spawn_stub(stub: Stub) -> String {
    let app = Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/sync/changes", get(changes))
        .route("/flaky", post(unavailable))
        .route("/cached", post(not_modified))
        .route("/slow", put(slow))
        .route("/{module}", post(create))
        .route("/{module}/{id}", put(update).delete(delete))
        .with_state(stub);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn task(id: &str, title: &str) -> Record {
    let fields = json!({ "title": title }).as_object().cloned().unwrap_or_default();
    Record::new(id, Module::Tasks, fields, 1_706_745_600_000)
}

fn request(mutation: &Mutation) -> RemoteRequest {
    RemoteRequest::for_mutation(&Schema::dashboard(), mutation).unwrap()
}

#[cfg(test)]
mod http_remote_tests {
    use super::*;

    #[tokio::test]
    async fn test_replay_create_update_delete() {
        let stub = Stub::default();
        let remote = HttpRemote::new(spawn_stub(stub.clone()).await, Duration::from_secs(5)).unwrap();

        let record = task("42", "Plan");
        remote
            .send(&request(&Mutation::create(&record).unwrap()))
            .await
            .unwrap();
        assert_eq!(
            stub.rows.get("tasks/42").map(|r| r.value().clone()),
            Some(json!({ "title": "Plan" }))
        );

        let patch = json!({ "status": "doing" }).as_object().cloned().unwrap_or_default();
        remote
            .send(&request(&Mutation::update(Module::Tasks, "42", &patch).unwrap()))
            .await
            .unwrap();
        assert_eq!(
            stub.rows.get("tasks/42").map(|r| r.value().clone()),
            Some(json!({ "title": "Plan", "status": "doing" }))
        );

        remote
            .send(&request(&Mutation::delete(Module::Tasks, "42")))
            .await
            .unwrap();
        assert!(stub.rows.get("tasks/42").is_none());
    }

    #[tokio::test]
    async fn test_idempotency_key_is_sent() {
        let stub = Stub::default();
        let remote = HttpRemote::new(spawn_stub(stub.clone()).await, Duration::from_secs(5)).unwrap();

        let create = request(&Mutation::create(&task("1", "Once")).unwrap());
        remote.send(&create).await.unwrap();
        remote.send(&create).await.unwrap();

        assert_eq!(stub.duplicates.load(Ordering::SeqCst), 1);
        assert_eq!(stub.rows.len(), 1);
    }

    #[tokio::test]
    async fn test_client_errors_are_permanent() {
        let stub = Stub::default();
        let remote = HttpRemote::new(spawn_stub(stub).await, Duration::from_secs(5)).unwrap();

        let patch = json!({ "title": "x" }).as_object().cloned().unwrap_or_default();
        let err = remote
            .send(&request(&Mutation::update(Module::Tasks, "missing", &patch).unwrap()))
            .await
            .unwrap_err();

        assert!(!err.is_retryable());
        assert_eq!(err.status(), Some(404));
    }

    #[tokio::test]
    async fn test_server_errors_are_transient() {
        let stub = Stub::default();
        let remote = HttpRemote::new(spawn_stub(stub).await, Duration::from_secs(5)).unwrap();

        let mut flaky = request(&Mutation::delete(Module::Tasks, "1"));
        flaky.method = tether_engine::HttpMethod::Post;
        flaky.endpoint = "/flaky".into();

        let err = remote.send(&flaky).await.unwrap_err();
        assert!(matches!(err, RemoteError::Transient(_)));
    }

    #[tokio::test]
    async fn test_other_unsuccessful_statuses_are_permanent() {
        let stub = Stub::default();
        let remote = HttpRemote::new(spawn_stub(stub).await, Duration::from_secs(5)).unwrap();

        let mut cached = request(&Mutation::delete(Module::Tasks, "1"));
        cached.method = tether_engine::HttpMethod::Post;
        cached.endpoint = "/cached".into();

        let err = remote.send(&cached).await.unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(err.status(), Some(304));
    }

    #[tokio::test]
    async fn test_slow_responses_time_out() {
        let stub = Stub::default();
        let remote = HttpRemote::new(spawn_stub(stub).await, Duration::from_millis(200)).unwrap();

        let mut slow = request(&Mutation::delete(Module::Tasks, "1"));
        slow.method = tether_engine::HttpMethod::Put;
        slow.endpoint = "/slow".into();

        let err = remote.send(&slow).await.unwrap_err();
        assert_eq!(err, RemoteError::Timeout(Duration::from_millis(200)));
    }

    #[tokio::test]
    async fn test_unreachable_remote_is_transient() {
        // Bind then drop to get a port nobody listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let remote = HttpRemote::new(format!("http://{addr}"), Duration::from_secs(1)).unwrap();
        let err = remote.ping().await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_fetch_changes_decodes_rows_and_tombstones() {
        let stub = Stub::default();
        let remote = HttpRemote::new(spawn_stub(stub).await, Duration::from_secs(5)).unwrap();

        remote.ping().await.unwrap();

        let changes = remote.fetch_changes(None).await.unwrap();
        assert_eq!(changes.records.len(), 1);
        assert_eq!(changes.records[0].id, "7");
        assert_eq!(changes.records[0].updated_at, 900);
        assert_eq!(changes.deleted[0].id, "3");
        assert_eq!(changes.cursor, Some(1_000));

        let next = remote.fetch_changes(changes.cursor.map(|c| c + 1)).await.unwrap();
        assert!(next.is_empty());
        assert_eq!(next.cursor, Some(1_001));
    }
}
