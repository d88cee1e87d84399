use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::adapter::{AdapterError, FetchBatch, SourceAdapter};
use crate::circuit_breaker::CircuitBreaker;
use crate::clock::{Clock, SystemClock};
use crate::cursor::Cursor;
use crate::domain::{Entity, RawRecord, Timestamp};
use crate::http_client::{HttpClient, HttpRequest, HttpResponse};
use crate::source_policy::SourcePolicy;
use crate::throttling::Throttle;

/// Fetches records from a JSON endpoint described by a URL template.
///
/// Template placeholders: `{code}`, `{exchange}`, `{entity_id}`,
/// `{entity_type}`, `{size}`, `{start}` / `{end}` (`YYYY-MM-DD`) and
/// `{start_ts}` / `{end_ts}` (`YYYY-MM-DDTHH:MM:SS`). Missing bounds render
/// as empty strings. Every value is URL-encoded.
///
/// The body must be a JSON array of objects, or an object holding one under
/// [`HttpJsonAdapter::with_array_field`] (dotted paths allowed).
pub struct HttpJsonAdapter {
    url_template: String,
    http_client: Arc<dyn HttpClient>,
    policy: SourcePolicy,
    circuit_breaker: Arc<CircuitBreaker>,
    throttle: Throttle,
    renames: BTreeMap<String, String>,
    array_field: Option<String>,
    headers: BTreeMap<String, String>,
    clock: Arc<dyn Clock>,
}

impl HttpJsonAdapter {
    pub fn new(
        url_template: impl Into<String>,
        http_client: Arc<dyn HttpClient>,
        policy: SourcePolicy,
    ) -> Self {
        Self {
            url_template: url_template.into(),
            http_client,
            circuit_breaker: Arc::new(CircuitBreaker::new(policy.breaker)),
            throttle: Throttle::from_policy(&policy),
            policy,
            renames: BTreeMap::new(),
            array_field: None,
            headers: BTreeMap::new(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Rename a provider field, e.g. `day` to `timestamp`.
    #[must_use]
    pub fn rename(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.renames.insert(from.into(), to.into());
        self
    }

    #[must_use]
    pub fn with_array_field(mut self, path: impl Into<String>) -> Self {
        self.array_field = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Clock the retry backoff sleeps on.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_circuit_breaker(mut self, circuit_breaker: Arc<CircuitBreaker>) -> Self {
        self.circuit_breaker = circuit_breaker;
        self
    }

    fn render_url(&self, entity: &Entity, cursor: &Cursor, size: usize) -> String {
        let day = |ts: Option<Timestamp>| ts.map(Timestamp::format_day).unwrap_or_default();
        let precise = |ts: Option<Timestamp>| ts.map(Timestamp::format_precise).unwrap_or_default();
        let values = [
            ("{entity_id}", entity.id.clone()),
            ("{entity_type}", entity.entity_type.as_str().to_string()),
            ("{exchange}", entity.exchange.clone()),
            ("{code}", entity.code.clone()),
            ("{size}", size.to_string()),
            ("{start_ts}", precise(cursor.start)),
            ("{end_ts}", precise(cursor.end)),
            ("{start}", day(cursor.start)),
            ("{end}", day(cursor.end)),
        ];

        values
            .iter()
            .fold(self.url_template.clone(), |url, (placeholder, value)| {
                url.replace(placeholder, &urlencoding::encode(value))
            })
    }

    async fn request(&self, url: &str) -> Result<HttpResponse, AdapterError> {
        let name = &self.policy.name;
        let mut attempt = 0_u32;
        loop {
            if let Err(remaining) = self.circuit_breaker.check() {
                return Err(AdapterError::unavailable(format!(
                    "{name} circuit breaker is open; retry in {:.1}s",
                    remaining.as_secs_f64()
                )));
            }
            self.throttle.ready().await;

            let mut request = HttpRequest::get(url).with_timeout(self.policy.request_timeout);
            for (header, value) in &self.headers {
                request = request.with_header(header.as_str(), value.as_str());
            }

            let failure = match self.http_client.execute(request).await {
                Ok(response) if response.is_success() => {
                    self.circuit_breaker.record_success();
                    return Ok(response);
                }
                Ok(response) => {
                    self.circuit_breaker.record_failure();
                    if !self.policy.retry.retries_status(response.status) {
                        return Err(status_error(name, response.status));
                    }
                    status_error(name, response.status)
                }
                Err(error) => {
                    self.circuit_breaker.record_failure();
                    let mapped = if error.timed_out() {
                        AdapterError::timeout(self.policy.request_timeout)
                    } else {
                        AdapterError::unavailable(format!("{name} request failed: {error}"))
                    };
                    if !self.policy.retry.retry_on_transport {
                        return Err(mapped);
                    }
                    mapped
                }
            };

            let Some(delay) = self.policy.retry.next_delay(attempt) else {
                return Err(failure);
            };
            debug!(source = %name, attempt, delay_ms = delay.as_millis() as u64, error = %failure, "retrying request");
            self.clock.sleep(delay).await;
            attempt += 1;
        }
    }

    fn parse(&self, body: &str) -> Result<Vec<RawRecord>, AdapterError> {
        let name = &self.policy.name;
        let payload: Value = serde_json::from_str(body)
            .map_err(|error| AdapterError::malformed_response(format!("{name} returned invalid JSON: {error}")))?;

        let items = match &self.array_field {
            Some(path) => path
                .split('.')
                .try_fold(&payload, |value, key| value.get(key))
                .unwrap_or(&Value::Null),
            None => &payload,
        };

        let items = match items {
            Value::Array(items) => items,
            // Sources answer "no data" with a null payload.
            Value::Null => return Ok(Vec::new()),
            other => {
                return Err(AdapterError::malformed_response(format!(
                    "{name} payload is not an array: {}",
                    truncate(&other.to_string())
                )))
            }
        };

        items
            .iter()
            .map(|item| match item {
                Value::Object(fields) => Ok(self.apply_renames(fields.clone())),
                other => Err(AdapterError::malformed_response(format!(
                    "{name} record is not an object: {}",
                    truncate(&other.to_string())
                ))),
            })
            .collect()
    }

    fn apply_renames(&self, fields: RawRecord) -> RawRecord {
        if self.renames.is_empty() {
            return fields;
        }
        fields
            .into_iter()
            .map(|(key, value)| match self.renames.get(&key) {
                Some(renamed) => (renamed.clone(), value),
                None => (key, value),
            })
            .collect()
    }
}

fn status_error(source: &str, status: u16) -> AdapterError {
    match status {
        429 => AdapterError::rate_limited(format!("{source} returned status 429")),
        408 | 500..=599 => AdapterError::unavailable(format!("{source} returned status {status}")),
        _ => AdapterError::invalid_request(format!("{source} returned status {status}")),
    }
}

fn truncate(text: &str) -> String {
    text.chars().take(120).collect()
}

impl SourceAdapter for HttpJsonAdapter {
    fn name(&self) -> &str {
        &self.policy.name
    }

    fn fetch<'a>(
        &'a self,
        entity: &'a Entity,
        cursor: &'a Cursor,
    ) -> Pin<Box<dyn Future<Output = Result<FetchBatch, AdapterError>> + Send + 'a>> {
        Box::pin(async move {
            let size = cursor.size.min(self.policy.max_size);
            if size < cursor.size {
                warn!(
                    source = %self.policy.name,
                    entity_id = %entity.id,
                    requested = cursor.size,
                    capped = size,
                    "request size capped"
                );
            }

            let url = self.render_url(entity, cursor, size);
            let response = self.request(&url).await?;
            let records = self.parse(&response.body)?;
            Ok(FetchBatch::sized(records, size))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::AdapterErrorKind;
    use crate::clock::ManualClock;
    use crate::http_client::{HttpError, ScriptedHttpClient};
    use crate::retry::RetryPolicy;
    use std::time::Duration;
    use time::macros::datetime;

    fn policy() -> SourcePolicy {
        SourcePolicy::new("kline").with_retry(RetryPolicy::fixed(Duration::from_millis(1), 2))
    }

    fn stock() -> Entity {
        Entity::parse_id("stock_sz_000338").expect("entity")
    }

    #[tokio::test]
    async fn renders_placeholders_and_renames_fields() {
        let client = Arc::new(
            ScriptedHttpClient::new()
                .respond(Ok(HttpResponse::ok_json(r#"{"data":{"klines":[{"day":"2020-01-02","close":1.5}]}}"#))),
        );
        let adapter = HttpJsonAdapter::new(
            "https://data.test/kline?secid={exchange}.{code}&beg={start}&lmt={size}",
            client.clone(),
            policy(),
        )
        .with_array_field("data.klines")
        .rename("day", "timestamp");

        let cursor = Cursor::window(Some(Timestamp::new(datetime!(2020-01-01 00:00))), 5);
        let batch = adapter.fetch(&stock(), &cursor).await.expect("batch");

        assert_eq!(
            client.requests()[0].url,
            "https://data.test/kline?secid=sz.000338&beg=2020-01-01&lmt=5"
        );
        assert_eq!(batch.records.len(), 1);
        assert!(batch.records[0].contains_key("timestamp"));
        assert!(batch.exhausted);
    }

    #[tokio::test]
    async fn caps_size_at_policy_maximum() {
        let client = Arc::new(ScriptedHttpClient::new());
        let adapter = HttpJsonAdapter::new("https://data.test/k?n={size}", client.clone(), policy().with_max_size(8000));

        adapter
            .fetch(&stock(), &Cursor::window(None, 20_000))
            .await
            .expect("batch");
        assert_eq!(client.requests()[0].url, "https://data.test/k?n=8000");
    }

    #[tokio::test]
    async fn retries_server_errors_then_succeeds() {
        let client = Arc::new(
            ScriptedHttpClient::new()
                .respond(Ok(HttpResponse::with_status(503, "busy")))
                .respond(Err(HttpError::new("connection reset")))
                .respond(Ok(HttpResponse::ok_json("[]"))),
        );
        let adapter = HttpJsonAdapter::new("https://data.test/k", client.clone(), policy());

        let batch = adapter.fetch(&stock(), &Cursor::window(None, 10)).await.expect("batch");
        assert!(batch.is_empty());
        assert_eq!(client.requests().len(), 3);
    }

    #[tokio::test]
    async fn backoff_sleeps_on_the_injected_clock() {
        let client = Arc::new(
            ScriptedHttpClient::new()
                .respond(Ok(HttpResponse::with_status(503, "busy")))
                .respond(Ok(HttpResponse::ok_json("[]"))),
        );
        let clock = Arc::new(ManualClock::new(datetime!(2020-01-02 00:00 UTC)));
        let policy = SourcePolicy::new("kline").with_retry(RetryPolicy::fixed(Duration::from_secs(2), 2));
        let adapter = HttpJsonAdapter::new("https://data.test/k", client, policy).with_clock(clock.clone());

        adapter.fetch(&stock(), &Cursor::window(None, 10)).await.expect("batch");
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(2)]);
    }

    #[tokio::test]
    async fn client_errors_are_permanent_and_not_retried() {
        let client = Arc::new(ScriptedHttpClient::new().respond(Ok(HttpResponse::with_status(404, "missing"))));
        let adapter = HttpJsonAdapter::new("https://data.test/k", client.clone(), policy());

        let error = adapter
            .fetch(&stock(), &Cursor::window(None, 10))
            .await
            .expect_err("404");
        assert_eq!(error.kind(), AdapterErrorKind::InvalidRequest);
        assert!(!error.is_transient());
        assert_eq!(client.requests().len(), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_as_transient() {
        let client = Arc::new(
            ScriptedHttpClient::new()
                .respond(Ok(HttpResponse::with_status(429, "")))
                .respond(Ok(HttpResponse::with_status(429, "")))
                .respond(Ok(HttpResponse::with_status(429, ""))),
        );
        let adapter = HttpJsonAdapter::new("https://data.test/k", client, policy());

        let error = adapter
            .fetch(&stock(), &Cursor::window(None, 10))
            .await
            .expect_err("rate limited");
        assert_eq!(error.kind(), AdapterErrorKind::RateLimited);
        assert!(error.is_transient());
    }

    #[tokio::test]
    async fn non_array_payload_is_malformed() {
        let client = Arc::new(ScriptedHttpClient::new().respond(Ok(HttpResponse::ok_json(r#"{"rc":0}"#))));
        let adapter = HttpJsonAdapter::new("https://data.test/k", client, policy());

        let error = adapter
            .fetch(&stock(), &Cursor::window(None, 10))
            .await
            .expect_err("malformed");
        assert_eq!(error.kind(), AdapterErrorKind::MalformedResponse);
    }
}
