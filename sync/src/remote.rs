//! Transport to the remote REST endpoint.
//!
//! A replayed [`Mutation`] becomes a [`RemoteRequest`]: the opaque payload is
//! decoded and validated against the module schema only here, at the point
//! of replay. 2xx is success, 5xx and network errors are transient, and any
//! other status is a permanent failure.

use crate::error::RemoteError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::time::Duration;
use tether_engine::{
    ActionKind, HttpMethod, Module, Mutation, Record, RecordId, Schema, Timestamp,
};

/// Header carrying the mutation's op id, so the remote can drop duplicates.
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// A REST call ready to send.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRequest {
    pub method: HttpMethod,
    pub endpoint: String,
    pub body: Option<serde_json::Value>,
    pub headers: BTreeMap<String, String>,
}

impl RemoteRequest {
    /// Decode and validate a queued mutation.
    ///
    /// Any failure here is permanent: retrying a structurally invalid request
    /// cannot succeed.
    pub fn for_mutation(schema: &Schema, mutation: &Mutation) -> Result<Self, RemoteError> {
        let invalid = |message: String| RemoteError::permanent(message);
        let body = mutation.payload().map_err(|e| invalid(e.to_string()))?;

        match (mutation.kind, &body) {
            (ActionKind::Create, Some(value)) => {
                let record: Record = serde_json::from_value(value.clone())
                    .map_err(|e| invalid(format!("create payload is not a record: {e}")))?;
                if record.module != mutation.module || record.id != mutation.record_id {
                    return Err(invalid(format!(
                        "create payload is for {}, not {}",
                        record.key(),
                        mutation.key()
                    )));
                }
                schema
                    .validate_fields(record.module, &record.fields)
                    .map_err(|e| invalid(e.to_string()))?;
            }
            (ActionKind::Update, Some(serde_json::Value::Object(patch))) => {
                schema
                    .validate_patch(mutation.module, patch)
                    .map_err(|e| invalid(e.to_string()))?;
            }
            (ActionKind::Create | ActionKind::Update, _) => {
                return Err(invalid(format!(
                    "{:?} of {} has no usable payload",
                    mutation.kind,
                    mutation.key()
                )));
            }
            (ActionKind::Delete, _) => {}
        }

        let mut headers = mutation.headers.clone();
        headers.insert(IDEMPOTENCY_HEADER.to_string(), mutation.op_id.clone());

        Ok(Self {
            method: mutation.method,
            endpoint: mutation.endpoint.clone(),
            body,
            headers,
        })
    }

    pub fn idempotency_key(&self) -> Option<&str> {
        self.headers.get(IDEMPOTENCY_HEADER).map(String::as_str)
    }
}

/// A remote deletion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tombstone {
    pub module: Module,
    pub id: RecordId,
    pub deleted_at: Timestamp,
}

/// Remote changes since a cursor.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSet {
    #[serde(default)]
    pub records: Vec<Record>,
    #[serde(default)]
    pub deleted: Vec<Tombstone>,
    /// Cursor to pass on the next fetch
    #[serde(default)]
    pub cursor: Option<Timestamp>,
}

impl ChangeSet {
    pub fn len(&self) -> usize {
        self.records.len() + self.deleted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.deleted.is_empty()
    }
}

/// The remote source of truth.
#[async_trait]
pub trait Remote: Debug + Send + Sync {
    /// Replay one mutation.
    async fn send(&self, request: &RemoteRequest) -> Result<(), RemoteError>;

    /// Changes since `since`, or everything when `None`.
    async fn fetch_changes(&self, since: Option<Timestamp>) -> Result<ChangeSet, RemoteError>;

    /// Cheap reachability check.
    async fn ping(&self) -> Result<(), RemoteError>;
}

/// [`Remote`] over HTTP with reqwest.
#[derive(Debug, Clone)]
pub struct HttpRemote {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpRemote {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::permanent(format!("cannot build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, endpoint: &str) -> String {
        if endpoint.starts_with('/') {
            format!("{}{endpoint}", self.base_url)
        } else {
            format!("{}/{endpoint}", self.base_url)
        }
    }

    fn transport_error(&self, err: reqwest::Error) -> RemoteError {
        if err.is_timeout() {
            RemoteError::Timeout(self.timeout)
        } else {
            RemoteError::Transient(err.to_string())
        }
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, RemoteError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = if body.is_empty() {
            status.to_string()
        } else {
            format!("{status}: {body}")
        };

        // 5xx is transient; 4xx and anything unexpected, such as an
        // unfollowed redirect, is permanent
        if status.is_server_error() {
            Err(RemoteError::Transient(message))
        } else {
            Err(RemoteError::Permanent {
                status: Some(status.as_u16()),
                message,
            })
        }
    }
}

fn method(method: HttpMethod) -> reqwest::Method {
    match method {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Put => reqwest::Method::PUT,
        HttpMethod::Delete => reqwest::Method::DELETE,
    }
}

#[async_trait]
impl Remote for HttpRemote {
    async fn send(&self, request: &RemoteRequest) -> Result<(), RemoteError> {
        let mut builder = self
            .client
            .request(method(request.method), self.url(&request.endpoint));
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| self.transport_error(e))?;
        Self::check_status(response).await?;
        Ok(())
    }

    async fn fetch_changes(&self, since: Option<Timestamp>) -> Result<ChangeSet, RemoteError> {
        let mut builder = self.client.get(self.url("/sync/changes"));
        if let Some(since) = since {
            builder = builder.query(&[("since", since)]);
        }

        let response = builder.send().await.map_err(|e| self.transport_error(e))?;
        let response = Self::check_status(response).await?;
        response
            .json::<ChangeSet>()
            .await
            .map_err(|e| RemoteError::permanent(format!("malformed change set: {e}")))
    }

    async fn ping(&self) -> Result<(), RemoteError> {
        let response = self
            .client
            .get(self.url("/health"))
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        Self::check_status(response).await?;
        Ok(())
    }
}
