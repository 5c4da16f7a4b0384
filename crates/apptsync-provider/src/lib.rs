//! Scheduling-provider clients: the Acuity HTTP client and a fixture-backed client.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use apptsync_core::{provider_id_of, parse_provider_timestamp, ProviderAppointment};
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info_span, warn, Instrument};

pub const CRATE_NAME: &str = "apptsync-provider";

pub const DEFAULT_ACUITY_BASE_URL: &str = "https://acuityscheduling.com/api/v1";

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("provider returned http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("provider response could not be decoded: {0}")]
    Decode(String),
}

impl ProviderError {
    /// Whether the same call may succeed if repeated later.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Request(err) => classify_reqwest_error(err) == RetryDisposition::Retryable,
            ProviderError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(|status| classify_status(status) == RetryDisposition::Retryable)
                .unwrap_or(false),
            ProviderError::Decode(_) => false,
        }
    }
}

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
    if err.is_timeout() || err.is_connect() {
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
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32
            .checked_shl(u32::try_from(attempt_index).unwrap_or(u32::MAX))
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Source of provider appointment state.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Current state of one appointment.
    async fn fetch_appointment(&self, provider_id: i64) -> Result<ProviderAppointment, ProviderError>;

    /// Raw listing records, limited to `day` when given. Records are returned verbatim so that
    /// callers can persist them and decide what to do with malformed entries.
    async fn fetch_listing(
        &self,
        day: Option<NaiveDate>,
        limit: usize,
    ) -> Result<Vec<JsonValue>, ProviderError>;
}

#[derive(Debug, Clone)]
pub struct AcuityConfig {
    pub base_url: String,
    pub user_id: String,
    pub api_key: String,
    pub calendar_id: Option<i64>,
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for AcuityConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_ACUITY_BASE_URL.to_string(),
            user_id: String::new(),
            api_key: String::new(),
            calendar_id: None,
            timeout: Duration::from_secs(20),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Acuity Scheduling REST client using HTTP basic auth.
#[derive(Debug, Clone)]
pub struct AcuityClient {
    client: reqwest::Client,
    config: AcuityConfig,
}

impl AcuityClient {
    pub fn new(config: AcuityConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()
            .context("building reqwest client")?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &AcuityConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// GET with retries on retryable statuses and transport errors; returns the decoded JSON body.
    async fn get_json(&self, url: &str, query: &[(&str, String)]) -> Result<JsonValue, ProviderError> {
        let backoff = self.config.backoff;
        let mut attempt = 0;
        loop {
            let resp_result = self
                .client
                .get(url)
                .basic_auth(&self.config.user_id, Some(&self.config.api_key))
                .query(query)
                .send()
                .await;

            let disposition = match &resp_result {
                Ok(resp) if resp.status().is_success() => RetryDisposition::NonRetryable,
                Ok(resp) => classify_status(resp.status()),
                Err(err) => classify_reqwest_error(err),
            };
            let retry = disposition == RetryDisposition::Retryable && attempt < backoff.max_retries;

            match resp_result {
                Ok(resp) if resp.status().is_success() => {
                    return resp
                        .json::<JsonValue>()
                        .await
                        .map_err(|err| ProviderError::Decode(err.to_string()));
                }
                Ok(resp) if !retry => {
                    return Err(ProviderError::HttpStatus {
                        status: resp.status().as_u16(),
                        url: resp.url().to_string(),
                    });
                }
                Err(err) if !retry => return Err(ProviderError::Request(err)),
                Ok(resp) => warn!(attempt, status = resp.status().as_u16(), url, "retrying provider request"),
                Err(err) => warn!(attempt, error = %err, url, "retrying provider request"),
            }

            tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
            attempt += 1;
        }
    }
}

#[async_trait]
impl ProviderClient for AcuityClient {
    async fn fetch_appointment(&self, provider_id: i64) -> Result<ProviderAppointment, ProviderError> {
        let url = self.url(&format!("appointments/{provider_id}"));
        let span = info_span!("acuity_fetch_appointment", provider_id);
        let body = self.get_json(&url, &[]).instrument(span).await?;
        ProviderAppointment::from_json(&body).map_err(|err| ProviderError::Decode(err.to_string()))
    }

    async fn fetch_listing(
        &self,
        day: Option<NaiveDate>,
        limit: usize,
    ) -> Result<Vec<JsonValue>, ProviderError> {
        let url = self.url("appointments");
        let mut query = Vec::new();
        if let Some(calendar_id) = self.config.calendar_id {
            query.push(("calendarID", calendar_id.to_string()));
        }
        if let Some(day) = day {
            let day = day.format("%Y-%m-%d").to_string();
            query.push(("minDate", day.clone()));
            query.push(("maxDate", day));
        }
        if limit > 0 {
            query.push(("max", limit.to_string()));
        }

        let span = info_span!("acuity_fetch_listing", ?day, limit);
        match self.get_json(&url, &query).instrument(span).await? {
            JsonValue::Array(records) => Ok(records),
            other => Err(ProviderError::Decode(format!(
                "expected an array of appointments, got {}",
                json_kind(&other)
            ))),
        }
    }
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}

#[derive(Debug, Default)]
struct FixtureState {
    records: BTreeMap<i64, JsonValue>,
    extra_listing: Vec<JsonValue>,
    fail_status: Option<u16>,
}

/// In-process provider backed by Acuity-shaped JSON records.
#[derive(Debug, Default)]
pub struct FixtureProvider {
    state: Mutex<FixtureState>,
}

impl FixtureProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a JSON array of Acuity appointment records.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let records: Vec<JsonValue> =
            serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
        let provider = Self::new();
        for record in records {
            provider.insert_raw(record);
        }
        Ok(provider)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FixtureState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert or replace a record, keyed by its `id`. Records without a readable id are
    /// kept in the listing only.
    pub fn insert_raw(&self, record: JsonValue) {
        let mut state = self.lock();
        match provider_id_of(&record) {
            Some(id) => {
                state.records.insert(id, record);
            }
            None => state.extra_listing.push(record),
        }
    }

    pub fn upsert(&self, record: JsonValue) {
        self.insert_raw(record);
    }

    pub fn remove(&self, provider_id: i64) -> Option<JsonValue> {
        self.lock().records.remove(&provider_id)
    }

    /// Make every call fail with `status` until cleared with `None`.
    pub fn fail_with_status(&self, status: Option<u16>) {
        self.lock().fail_status = status;
    }

    fn check_failure(&self, url: &str) -> Result<(), ProviderError> {
        match self.lock().fail_status {
            Some(status) => Err(ProviderError::HttpStatus {
                status,
                url: url.to_string(),
            }),
            None => Ok(()),
        }
    }
}

/// Provider-local calendar date of a record, when its start time is readable.
fn record_day(record: &JsonValue) -> Option<NaiveDate> {
    let raw = record.get("datetime")?.as_str()?;
    parse_provider_timestamp(raw).ok().map(|ts| ts.date_naive())
}

#[async_trait]
impl ProviderClient for FixtureProvider {
    async fn fetch_appointment(&self, provider_id: i64) -> Result<ProviderAppointment, ProviderError> {
        let url = format!("fixture://appointments/{provider_id}");
        self.check_failure(&url)?;
        let record = self
            .lock()
            .records
            .get(&provider_id)
            .cloned()
            .ok_or(ProviderError::HttpStatus { status: 404, url })?;
        ProviderAppointment::from_json(&record).map_err(|err| ProviderError::Decode(err.to_string()))
    }

    async fn fetch_listing(
        &self,
        day: Option<NaiveDate>,
        limit: usize,
    ) -> Result<Vec<JsonValue>, ProviderError> {
        self.check_failure("fixture://appointments")?;
        let state = self.lock();
        let listing = state
            .records
            .values()
            .chain(state.extra_listing.iter())
            .filter(|record| match (day, record_day(record)) {
                (Some(day), Some(found)) => found == day,
                _ => true,
            })
            .take(if limit == 0 { usize::MAX } else { limit })
            .cloned()
            .collect();
        Ok(listing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sample_record(id: i64, datetime: &str) -> JsonValue {
        json!({
            "id": id,
            "firstName": "Meredith",
            "lastName": "Gray",
            "datetime": datetime,
            "datetimeCreated": "2025-04-20T10:00:00-0600",
            "duration": "60",
            "calendarID": 1574840,
            "canceled": false
        })
    }

    fn client_for(server: &MockServer) -> AcuityClient {
        AcuityClient::new(AcuityConfig {
            base_url: server.uri(),
            user_id: "12345".to_string(),
            api_key: "secret".to_string(),
            calendar_id: Some(1574840),
            timeout: Duration::from_secs(5),
            backoff: BackoffPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
        })
        .unwrap()
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
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
    }

    #[test]
    fn status_classification() {
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
        assert!(ProviderError::HttpStatus {
            status: 503,
            url: String::new()
        }
        .is_retryable());
        assert!(!ProviderError::Decode("bad".into()).is_retryable());
    }

    #[tokio::test]
    async fn fetch_appointment_uses_basic_auth_and_parses_record() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/appointments/1451596598"))
            .and(header("authorization", "Basic MTIzNDU6c2VjcmV0"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(sample_record(1451596598, "2025-04-24T17:00:00-0600")),
            )
            .expect(1)
            .mount(&server)
            .await;

        let appt = client_for(&server)
            .fetch_appointment(1451596598)
            .await
            .unwrap();
        assert_eq!(appt.provider_id, 1451596598);
        assert_eq!(appt.first_name, "Meredith");
        assert_eq!(appt.duration_minutes, 60);
    }

    #[tokio::test]
    async fn fetch_listing_sends_day_and_calendar_filters() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/appointments"))
            .and(query_param("calendarID", "1574840"))
            .and(query_param("minDate", "2025-04-24"))
            .and(query_param("maxDate", "2025-04-24"))
            .and(query_param("max", "100"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                sample_record(1, "2025-04-24T16:00:00-0600"),
                {"id": 2, "firstName": "Broken"}
            ])))
            .mount(&server)
            .await;

        let day = NaiveDate::from_ymd_opt(2025, 4, 24).unwrap();
        let listing = client_for(&server).fetch_listing(Some(day), 100).await.unwrap();
        assert_eq!(listing.len(), 2);
        assert_eq!(provider_id_of(&listing[1]), Some(2));
    }

    #[tokio::test]
    async fn retryable_status_is_retried_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/appointments/7"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/appointments/7"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(sample_record(7, "2025-04-24T17:00:00-0600")),
            )
            .mount(&server)
            .await;

        let appt = client_for(&server).fetch_appointment(7).await.unwrap();
        assert_eq!(appt.provider_id, 7);
    }

    #[tokio::test]
    async fn not_found_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/appointments/8"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let err = client_for(&server).fetch_appointment(8).await.unwrap_err();
        assert!(matches!(err, ProviderError::HttpStatus { status: 404, .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn persistent_server_error_surfaces_as_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/appointments/9"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let err = client_for(&server).fetch_appointment(9).await.unwrap_err();
        assert!(matches!(err, ProviderError::HttpStatus { status: 500, .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn non_array_listing_is_a_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/appointments"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"error": "nope"})))
            .mount(&server)
            .await;

        let err = client_for(&server).fetch_listing(None, 0).await.unwrap_err();
        assert!(matches!(err, ProviderError::Decode(_)));
    }

    #[tokio::test]
    async fn fixture_provider_filters_by_day_and_reports_missing_ids() {
        let provider = FixtureProvider::new();
        provider.upsert(sample_record(1, "2025-04-24T16:00:00-0600"));
        provider.upsert(sample_record(2, "2025-04-25T16:00:00-0600"));
        provider.insert_raw(json!({"firstName": "NoId"}));

        let day = NaiveDate::from_ymd_opt(2025, 4, 24).unwrap();
        let listing = provider.fetch_listing(Some(day), 0).await.unwrap();
        let ids: Vec<_> = listing.iter().map(provider_id_of).collect();
        assert_eq!(ids, vec![Some(1), None]);

        let err = provider.fetch_appointment(3).await.unwrap_err();
        assert!(matches!(err, ProviderError::HttpStatus { status: 404, .. }));

        provider.fail_with_status(Some(502));
        assert!(provider.fetch_appointment(1).await.unwrap_err().is_retryable());
    }

    #[test]
    fn fixture_provider_loads_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("appointments.json");
        fs::write(
            &file,
            serde_json::to_string(&json!([sample_record(5, "2025-04-24T18:00:00-0600")])).unwrap(),
        )
        .unwrap();
        let provider = FixtureProvider::from_path(&file).unwrap();
        assert!(provider.remove(5).is_some());
        assert!(FixtureProvider::from_path(dir.path().join("missing.json")).is_err());
    }
}
