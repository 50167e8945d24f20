//! Event store collaborator: PostgREST-style HTTP client plus an in-memory double.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use evr_core::{parse_event_date, EventRecord};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "evr-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Send a request, retrying transient failures per `backoff`.
///
/// `build` is called once per attempt since a `RequestBuilder` is consumed by `send`.
/// Non-success responses that are not retryable are returned as-is for the caller to inspect.
pub async fn send_with_backoff<F>(
    backoff: &BackoffPolicy,
    build: F,
) -> Result<Response, reqwest::Error>
where
    F: Fn() -> RequestBuilder,
{
    let mut attempt = 0;
    loop {
        match build().send().await {
            Ok(resp) => {
                let status = resp.status();
                if !status.is_success()
                    && classify_status(status) == RetryDisposition::Retryable
                    && attempt < backoff.max_retries
                {
                    warn!(%status, attempt, "transient http status; retrying");
                    tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                    attempt += 1;
                    continue;
                }
                return Ok(resp);
            }
            Err(err) => {
                if classify_reqwest_error(&err) == RetryDisposition::Retryable
                    && attempt < backoff.max_retries
                {
                    warn!(error = %err, attempt, "transient request error; retrying");
                    tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                    attempt += 1;
                    continue;
                }
                return Err(err);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
}

impl FilterOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOp::Eq => "eq",
            FilterOp::Neq => "neq",
            FilterOp::Lt => "lt",
            FilterOp::Lte => "lte",
            FilterOp::Gt => "gt",
            FilterOp::Gte => "gte",
        }
    }

    fn accepts(&self, ordering: Ordering) -> bool {
        match self {
            FilterOp::Eq => ordering == Ordering::Equal,
            FilterOp::Neq => ordering != Ordering::Equal,
            FilterOp::Lt => ordering == Ordering::Less,
            FilterOp::Lte => ordering != Ordering::Greater,
            FilterOp::Gt => ordering == Ordering::Greater,
            FilterOp::Gte => ordering != Ordering::Less,
        }
    }
}

/// Single column predicate, rendered as `column=op.value` on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    pub column: String,
    pub op: FilterOp,
    pub value: String,
}

impl Filter {
    pub fn new(column: impl Into<String>, op: FilterOp, value: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(column, FilterOp::Eq, value)
    }

    pub fn lt(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(column, FilterOp::Lt, value)
    }

    pub fn gte(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(column, FilterOp::Gte, value)
    }

    pub fn query_pair(&self) -> (String, String) {
        (
            self.column.clone(),
            format!("{}.{}", self.op.as_str(), self.value),
        )
    }

    /// Evaluate against a stored row. Date-like values compare as calendar dates.
    pub fn matches(&self, row: &JsonValue) -> bool {
        let Some(cell) = row.get(&self.column) else {
            return false;
        };
        let cell = match cell {
            JsonValue::String(s) => s.clone(),
            JsonValue::Null => return false,
            other => other.to_string(),
        };
        let ordering = match (parse_event_date(&cell), parse_event_date(&self.value)) {
            (Some(a), Some(b)) => a.cmp(&b),
            _ => cell.as_str().cmp(self.value.as_str()),
        };
        self.op.accepts(ordering)
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}.{}", self.column, self.op.as_str(), self.value)
    }
}

/// How the store resolves a write that collides with an existing natural key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// Plain insert; a collision is an error.
    Insert,
    /// Overwrite the row sharing these key columns.
    MergeOnKey(Vec<String>),
}

impl ConflictPolicy {
    pub fn natural_key() -> Self {
        ConflictPolicy::MergeOnKey(vec!["name".to_string(), "start_date".to_string()])
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("store returned http {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("decoding store response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl StoreError {
    pub fn status(&self) -> Option<u16> {
        match self {
            StoreError::Rejected { status, .. } => Some(*status),
            StoreError::Request(err) => err.status().map(|s| s.as_u16()),
            StoreError::Decode(_) => None,
        }
    }
}

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Delete every row matching all `filters`; returns the store's status code.
    async fn delete(&self, filters: &[Filter]) -> Result<u16, StoreError>;

    /// Rows matching all `filters`, projected to `fields`, in store order.
    async fn select(&self, filters: &[Filter], fields: &[&str]) -> Result<Vec<JsonValue>, StoreError>;

    async fn upsert(&self, record: &EventRecord, policy: &ConflictPolicy) -> Result<u16, StoreError>;
}

/// Connection settings for the REST store. Passed in explicitly; never read from the environment here.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub base_url: String,
    pub service_key: String,
    pub table: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl StoreConfig {
    pub fn new(base_url: impl Into<String>, service_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            service_key: service_key.into(),
            table: "events".to_string(),
            timeout: Duration::from_secs(30),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug)]
pub struct RestStore {
    client: reqwest::Client,
    endpoint: String,
    service_key: String,
    backoff: BackoffPolicy,
}

impl RestStore {
    pub fn new(config: StoreConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let endpoint = format!(
            "{}/rest/v1/{}",
            config.base_url.trim_end_matches('/'),
            config.table
        );

        Ok(Self {
            client,
            endpoint,
            service_key: config.service_key,
            backoff: config.backoff,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("apikey", &self.service_key)
            .bearer_auth(&self.service_key)
    }

    async fn reject(resp: Response) -> StoreError {
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        StoreError::Rejected { status, body }
    }
}

fn filter_pairs(filters: &[Filter]) -> Vec<(String, String)> {
    filters.iter().map(Filter::query_pair).collect()
}

#[async_trait]
impl EventStore for RestStore {
    async fn delete(&self, filters: &[Filter]) -> Result<u16, StoreError> {
        let query = filter_pairs(filters);
        let span = info_span!("store_delete", endpoint = %self.endpoint);
        async {
            let resp = send_with_backoff(&self.backoff, || {
                self.authorized(self.client.delete(&self.endpoint)).query(&query)
            })
            .await?;
            if !resp.status().is_success() {
                return Err(Self::reject(resp).await);
            }
            Ok::<u16, StoreError>(resp.status().as_u16())
        }
        .instrument(span)
        .await
    }

    async fn select(&self, filters: &[Filter], fields: &[&str]) -> Result<Vec<JsonValue>, StoreError> {
        let mut query = vec![("select".to_string(), fields.join(","))];
        query.extend(filter_pairs(filters));
        let span = info_span!("store_select", endpoint = %self.endpoint);
        async {
            let resp = send_with_backoff(&self.backoff, || {
                self.authorized(self.client.get(&self.endpoint)).query(&query)
            })
            .await?;
            if !resp.status().is_success() {
                return Err(Self::reject(resp).await);
            }
            let bytes = resp.bytes().await?;
            let rows: Vec<JsonValue> = serde_json::from_slice(&bytes)?;
            debug!(rows = rows.len(), "store select returned");
            Ok::<Vec<JsonValue>, StoreError>(rows)
        }
        .instrument(span)
        .await
    }

    async fn upsert(&self, record: &EventRecord, policy: &ConflictPolicy) -> Result<u16, StoreError> {
        let span = info_span!("store_upsert", endpoint = %self.endpoint, name = %record.name);
        async {
            let resp = send_with_backoff(&self.backoff, || {
                let builder = self.authorized(self.client.post(&self.endpoint)).json(record);
                match policy {
                    ConflictPolicy::Insert => builder,
                    ConflictPolicy::MergeOnKey(columns) => builder
                        .query(&[("on_conflict", columns.join(","))])
                        .header("Prefer", "resolution=merge-duplicates"),
                }
            })
            .await?;
            if !resp.status().is_success() {
                return Err(Self::reject(resp).await);
            }
            Ok::<u16, StoreError>(resp.status().as_u16())
        }
        .instrument(span)
        .await
    }
}

/// In-process store with the same filter and conflict semantics as [`RestStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: Mutex<Vec<JsonValue>>,
    rejected_names: Vec<String>,
    fail_select: bool,
    upsert_calls: Mutex<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(rows: Vec<JsonValue>) -> Self {
        Self {
            rows: Mutex::new(rows),
            ..Self::default()
        }
    }

    /// Upserts of records with this name answer with a 400.
    pub fn rejecting(mut self, name: impl Into<String>) -> Self {
        self.rejected_names.push(name.into());
        self
    }

    /// Every select answers with a 503, as an unreachable store would.
    pub fn failing_select(mut self) -> Self {
        self.fail_select = true;
        self
    }

    pub fn rows(&self) -> Vec<JsonValue> {
        self.rows.lock().map(|rows| rows.clone()).unwrap_or_default()
    }

    pub fn upsert_calls(&self) -> usize {
        self.upsert_calls.lock().map(|n| *n).unwrap_or_default()
    }

    fn lock_rows(&self) -> std::sync::MutexGuard<'_, Vec<JsonValue>> {
        self.rows.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn delete(&self, filters: &[Filter]) -> Result<u16, StoreError> {
        let mut rows = self.lock_rows();
        rows.retain(|row| !filters.iter().all(|f| f.matches(row)));
        Ok(204)
    }

    async fn select(&self, filters: &[Filter], fields: &[&str]) -> Result<Vec<JsonValue>, StoreError> {
        if self.fail_select {
            return Err(StoreError::Rejected {
                status: 503,
                body: "store unavailable".to_string(),
            });
        }
        let rows = self.lock_rows();
        Ok(rows
            .iter()
            .filter(|row| filters.iter().all(|f| f.matches(row)))
            .map(|row| {
                let projected = fields
                    .iter()
                    .filter_map(|field| row.get(*field).map(|v| (field.to_string(), v.clone())))
                    .collect::<serde_json::Map<_, _>>();
                JsonValue::Object(projected)
            })
            .collect())
    }

    async fn upsert(&self, record: &EventRecord, policy: &ConflictPolicy) -> Result<u16, StoreError> {
        *self
            .upsert_calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) += 1;

        if self.rejected_names.iter().any(|n| n == &record.name) {
            return Err(StoreError::Rejected {
                status: 400,
                body: format!(r#"{{"message":"rejected {}"}}"#, record.name),
            });
        }

        let value = serde_json::to_value(record)?;
        let mut rows = self.lock_rows();
        let existing = match policy {
            ConflictPolicy::Insert => rows.iter().position(|row| {
                row.get("id") == value.get("id")
                    || (row.get("name") == value.get("name")
                        && row.get("start_date") == value.get("start_date"))
            }),
            ConflictPolicy::MergeOnKey(columns) => rows
                .iter()
                .position(|row| columns.iter().all(|c| row.get(c) == value.get(c))),
        };

        match (existing, policy) {
            (Some(_), ConflictPolicy::Insert) => Err(StoreError::Rejected {
                status: 409,
                body: r#"{"code":"23505","message":"duplicate key value"}"#.to_string(),
            }),
            (Some(idx), ConflictPolicy::MergeOnKey(_)) => {
                rows[idx] = value;
                Ok(200)
            }
            (None, _) => {
                rows.push(value);
                Ok(201)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evr_core::Category;
    use serde_json::json;
    use uuid::Uuid;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn store_for(server: &MockServer) -> RestStore {
        let mut config = StoreConfig::new(server.uri(), "service-key");
        config.backoff = BackoffPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        };
        RestStore::new(config).expect("store")
    }

    fn record(name: &str, start_date: &str) -> EventRecord {
        EventRecord {
            id: Uuid::new_v4(),
            name: name.to_string(),
            location: "Kyoto, Japan".to_string(),
            start_date: start_date.to_string(),
            end_date: start_date.to_string(),
            category: Category::Nature,
            description: "Blossoms along the river.".to_string(),
            image_url: "https://example.com/blossom.jpg".to_string(),
        }
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn filters_render_and_compare_dates() {
        let filter = Filter::lt("end_date", "2026-10-18");
        assert_eq!(filter.to_string(), "end_date=lt.2026-10-18");
        assert!(filter.matches(&json!({"end_date": "2026-10-17"})));
        assert!(filter.matches(&json!({"end_date": "October 1, 2026"})));
        assert!(!filter.matches(&json!({"end_date": "2026-10-18"})));
        assert!(!filter.matches(&json!({"name": "no end date"})));

        let live = Filter::gte("end_date", "2026-10-18");
        assert_eq!(live.to_string(), "end_date=gte.2026-10-18");
        assert!(live.matches(&json!({"end_date": "2026-10-18"})));
        assert!(!live.matches(&json!({"end_date": "2026-10-17"})));
    }

    #[tokio::test]
    async fn delete_sends_filter_and_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/rest/v1/events"))
            .and(query_param("end_date", "lt.2026-10-18"))
            .and(header("apikey", "service-key"))
            .and(header("authorization", "Bearer service-key"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let status = store_for(&server)
            .delete(&[Filter::lt("end_date", "2026-10-18")])
            .await
            .expect("delete");
        assert_eq!(status, 204);
    }

    #[tokio::test]
    async fn select_projects_fields() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/events"))
            .and(query_param("select", "name,start_date"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"name": "Cherry Blossom Festival", "start_date": "2026-04-01"},
                {"name": "Gion Matsuri", "start_date": "2026-07-01"}
            ])))
            .mount(&server)
            .await;

        let rows = store_for(&server)
            .select(&[], &["name", "start_date"])
            .await
            .expect("select");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1]["name"], json!("Gion Matsuri"));
    }

    #[tokio::test]
    async fn upsert_requests_merge_on_natural_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/events"))
            .and(query_param("on_conflict", "name,start_date"))
            .and(header("prefer", "resolution=merge-duplicates"))
            .and(body_partial_json(json!({"name": "Cherry Blossom Festival", "category": "Nature"})))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let status = store_for(&server)
            .upsert(&record("Cherry Blossom Festival", "2026-04-01"), &ConflictPolicy::natural_key())
            .await
            .expect("upsert");
        assert_eq!(status, 201);
    }

    #[tokio::test]
    async fn upsert_client_error_is_not_retried_and_keeps_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/events"))
            .respond_with(
                ResponseTemplate::new(400)
                    .set_body_string(r#"{"message":"invalid input syntax for type date"}"#),
            )
            .expect(1)
            .mount(&server)
            .await;

        let err = store_for(&server)
            .upsert(&record("Gion Matsuri", "July-ish"), &ConflictPolicy::natural_key())
            .await
            .expect_err("should be rejected");
        assert_eq!(err.status(), Some(400));
        match err {
            StoreError::Rejected { body, .. } => assert!(body.contains("invalid input syntax")),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn transient_server_error_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/events"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/events"))
            .respond_with(ResponseTemplate::new(201))
            .mount(&server)
            .await;

        let status = store_for(&server)
            .upsert(&record("Holi", "2026-03-04"), &ConflictPolicy::natural_key())
            .await
            .expect("retried upsert");
        assert_eq!(status, 201);
    }

    #[tokio::test]
    async fn memory_store_merges_on_key_and_purges_by_date() {
        let store = MemoryStore::new();
        let first = record("Holi", "2026-03-04");
        let mut second = record("Holi", "2026-03-04");
        second.description = "Festival of colours.".to_string();

        assert_eq!(store.upsert(&first, &ConflictPolicy::natural_key()).await.unwrap(), 201);
        assert_eq!(store.upsert(&second, &ConflictPolicy::natural_key()).await.unwrap(), 200);
        assert_eq!(store.rows().len(), 1);
        assert_eq!(store.rows()[0]["description"], json!("Festival of colours."));

        store.upsert(&record("Old Fair", "2025-01-01"), &ConflictPolicy::Insert).await.unwrap();
        store.delete(&[Filter::lt("end_date", "2026-01-01")]).await.unwrap();
        let names: Vec<_> = store.rows().iter().map(|r| r["name"].clone()).collect();
        assert_eq!(names, vec![json!("Holi")]);
        assert_eq!(store.upsert_calls(), 3);
    }
}
