//! Enrichment client for the external organization/person lookup API.
//!
//! The client authenticates once when it is constructed
//! ([`EnrichmentClient::connect`]) and refuses to exist if the service does
//! not acknowledge the key. After that, lookups never fail the caller:
//! each key is retried per the [`RetryPolicy`] and, if it still cannot be
//! resolved, simply left out of the batch result.
//!
//! # Endpoints
//!
//! | Operation | Request |
//! |-----------|---------|
//! | auth probe | `GET {base}/` → `{"Authenticated": true}` |
//! | organization by domain | `POST {base}/org` `{"domain": ...}` |
//! | person by profile URL | `POST {base}/person` `{"linkedin_url": ...}` |
//!
//! # Retry Strategy
//!
//! - Network errors, HTTP 429, and 5xx → retry
//! - Any other non-success status → give up on that key immediately
//! - Delay before retry *n* is `n × base_delay` (linear)

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::config::Config;

/// Raw enrichment payload for one entity.
pub type EnrichmentRecord = serde_json::Map<String, serde_json::Value>;

/// Errors from the enrichment service.
#[derive(Debug, thiserror::Error)]
pub enum EnrichError {
    /// The auth probe did not return an explicit acknowledgment.
    #[error("enrichment API authentication failed: {0}")]
    Unauthenticated(String),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("enrichment API returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid enrichment response: {0}")]
    Decode(String),
}

impl EnrichError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            EnrichError::Http(_) => true,
            EnrichError::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// Bounded retry with linearly increasing delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}

/// What is being looked up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupKind {
    Organization,
    Person,
}

impl LookupKind {
    fn endpoint(&self) -> &'static str {
        match self {
            LookupKind::Organization => "org",
            LookupKind::Person => "person",
        }
    }

    fn payload_field(&self) -> &'static str {
        match self {
            LookupKind::Organization => "domain",
            LookupKind::Person => "linkedin_url",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            LookupKind::Organization => "organization",
            LookupKind::Person => "person",
        }
    }
}

/// Authenticated client for the enrichment API.
#[derive(Debug, Clone)]
pub struct EnrichmentClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    retry: RetryPolicy,
    max_workers: usize,
}

impl EnrichmentClient {
    /// Build a client from configuration and run the auth probe.
    ///
    /// # Errors
    ///
    /// [`EnrichError::Unauthenticated`] when the probe fails for any reason;
    /// the pipeline treats this as "run without enrichment".
    pub async fn connect(config: &Config) -> Result<Self, EnrichError> {
        let client = reqwest::Client::builder()
            .timeout(config.api.timeout())
            .build()?;

        let this = Self {
            client,
            base_url: config.api.base_url.trim_end_matches('/').to_string(),
            api_key: config.api.key.clone(),
            retry: RetryPolicy::new(config.api.max_retries, config.api.retry_delay()),
            max_workers: config.pipeline.max_workers.max(1),
        };

        this.verify_auth().await?;
        info!(base_url = %this.base_url, "enrichment API authentication successful");
        Ok(this)
    }

    async fn verify_auth(&self) -> Result<(), EnrichError> {
        let resp = self
            .client
            .get(format!("{}/", self.base_url))
            .header("api_key", &self.api_key)
            .send()
            .await
            .map_err(|e| EnrichError::Unauthenticated(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(EnrichError::Unauthenticated(format!("{}: {}", status, body)));
        }

        let json: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| EnrichError::Unauthenticated(format!("unreadable probe response: {}", e)))?;

        match json.get("Authenticated").and_then(|v| v.as_bool()) {
            Some(true) => Ok(()),
            _ => Err(EnrichError::Unauthenticated(format!(
                "probe did not acknowledge the key: {}",
                json
            ))),
        }
    }

    /// One request, no retry. `Ok(None)` means the service has no record.
    async fn request_once(
        &self,
        kind: LookupKind,
        key: &str,
    ) -> Result<Option<EnrichmentRecord>, EnrichError> {
        let mut body = serde_json::Map::new();
        body.insert(
            kind.payload_field().to_string(),
            serde_json::Value::String(key.to_string()),
        );
        let resp = self
            .client
            .post(format!("{}/{}", self.base_url, kind.endpoint()))
            .header("api_key", &self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if status.as_u16() == 404 {
            return Ok(None);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(EnrichError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let json: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| EnrichError::Decode(e.to_string()))?;
        match json {
            serde_json::Value::Object(map) if !map.is_empty() => Ok(Some(map)),
            serde_json::Value::Object(_) | serde_json::Value::Null => Ok(None),
            other => Err(EnrichError::Decode(format!(
                "expected a JSON object, got {}",
                other
            ))),
        }
    }

    async fn request_with_retry(
        &self,
        kind: LookupKind,
        key: &str,
    ) -> Result<Option<EnrichmentRecord>, EnrichError> {
        let mut attempt = 0u32;
        loop {
            match self.request_once(kind, key).await {
                Ok(record) => return Ok(record),
                Err(e) if e.is_transient() && attempt < self.retry.max_retries => {
                    attempt += 1;
                    warn!(
                        kind = kind.label(),
                        key,
                        attempt,
                        max_retries = self.retry.max_retries,
                        error = %e,
                        "enrichment request failed, retrying"
                    );
                    tokio::time::sleep(self.retry.delay_for(attempt)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Look up a single key. Every failure is logged and collapses to `None`.
    pub async fn lookup(&self, kind: LookupKind, key: &str) -> Option<EnrichmentRecord> {
        if key.trim().is_empty() {
            warn!(kind = kind.label(), "empty key, skipping lookup");
            return None;
        }
        match self.request_with_retry(kind, key).await {
            Ok(record) => record,
            Err(e) => {
                error!(kind = kind.label(), key, error = %e, "enrichment lookup failed");
                None
            }
        }
    }

    /// Look up many keys concurrently, at most `max_workers` in flight.
    ///
    /// The result holds only the keys that resolved; duplicate and blank
    /// keys are ignored.
    pub async fn fetch_batch(
        &self,
        keys: &[String],
        kind: LookupKind,
    ) -> HashMap<String, EnrichmentRecord> {
        let unique: HashSet<&str> = keys
            .iter()
            .map(|k| k.trim())
            .filter(|k| !k.is_empty())
            .collect();

        let semaphore = Arc::new(Semaphore::new(self.max_workers));
        let mut handles = Vec::with_capacity(unique.len());

        for key in unique {
            let client = self.clone();
            let sem = semaphore.clone();
            let key = key.to_string();
            handles.push(tokio::spawn(async move {
                let _permit = sem.acquire_owned().await.ok()?;
                let record = client.lookup(kind, &key).await?;
                Some((key, record))
            }));
        }

        let mut results = HashMap::new();
        for handle in handles {
            match handle.await {
                Ok(Some((key, record))) => {
                    results.insert(key, record);
                }
                Ok(None) => {}
                Err(e) => error!(kind = kind.label(), error = %e, "lookup task panicked"),
            }
        }

        debug!(kind = kind.label(), resolved = results.len(), "batch complete");
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_for(server: &MockServer) -> Config {
        let mut cfg = Config::default();
        cfg.api.base_url = server.uri();
        cfg.api.key = "secret".to_string();
        cfg.api.retry_delay_ms = 1;
        cfg.api.max_retries = 3;
        cfg.pipeline.max_workers = 2;
        cfg
    }

    async fn mount_auth_ok(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/"))
            .and(header("api_key", "secret"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "Authenticated": true })),
            )
            .mount(server)
            .await;
    }

    #[test]
    fn retry_delay_grows_linearly() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(300));
    }

    #[test]
    fn transient_classification() {
        let rate_limited = EnrichError::Status {
            status: 429,
            body: String::new(),
        };
        let server_error = EnrichError::Status {
            status: 503,
            body: String::new(),
        };
        let bad_request = EnrichError::Status {
            status: 400,
            body: String::new(),
        };
        assert!(rate_limited.is_transient());
        assert!(server_error.is_transient());
        assert!(!bad_request.is_transient());
        assert!(!EnrichError::Decode("x".into()).is_transient());
    }

    #[tokio::test]
    async fn connect_succeeds_when_authenticated() {
        let server = MockServer::start().await;
        mount_auth_ok(&server).await;
        let client = EnrichmentClient::connect(&config_for(&server)).await;
        assert!(client.is_ok());
    }

    #[tokio::test]
    async fn connect_fails_without_acknowledgment() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "Authenticated": false })),
            )
            .mount(&server)
            .await;
        let err = EnrichmentClient::connect(&config_for(&server))
            .await
            .unwrap_err();
        assert!(matches!(err, EnrichError::Unauthenticated(_)));
    }

    #[tokio::test]
    async fn connect_fails_on_unauthorized_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
            .mount(&server)
            .await;
        let err = EnrichmentClient::connect(&config_for(&server))
            .await
            .unwrap_err();
        assert!(matches!(err, EnrichError::Unauthenticated(_)));
    }

    #[tokio::test]
    async fn batch_omits_unresolved_keys() {
        let server = MockServer::start().await;
        mount_auth_ok(&server).await;
        Mock::given(method("POST"))
            .and(path("/org"))
            .and(body_json(serde_json::json!({ "domain": "acme.com" })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "name": "Acme Corp", "total_funding": 500 })),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/org"))
            .and(body_json(serde_json::json!({ "domain": "ghost.io" })))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = EnrichmentClient::connect(&config_for(&server)).await.unwrap();
        let keys = vec![
            "acme.com".to_string(),
            "ghost.io".to_string(),
            "acme.com".to_string(),
            "  ".to_string(),
        ];
        let results = client.fetch_batch(&keys, LookupKind::Organization).await;

        assert_eq!(results.len(), 1);
        assert_eq!(results["acme.com"]["name"], "Acme Corp");
    }

    #[tokio::test]
    async fn transient_failure_is_retried() {
        let server = MockServer::start().await;
        mount_auth_ok(&server).await;
        Mock::given(method("POST"))
            .and(path("/person"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/person"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "name": "Ada" })),
            )
            .mount(&server)
            .await;

        let client = EnrichmentClient::connect(&config_for(&server)).await.unwrap();
        let record = client
            .lookup(LookupKind::Person, "https://linkedin.com/in/ada")
            .await;
        assert_eq!(record.unwrap()["name"], "Ada");
    }

    #[tokio::test]
    async fn exhausted_retries_omit_the_key() {
        let server = MockServer::start().await;
        mount_auth_ok(&server).await;
        Mock::given(method("POST"))
            .and(path("/org"))
            .respond_with(ResponseTemplate::new(503))
            .expect(4)
            .mount(&server)
            .await;

        let client = EnrichmentClient::connect(&config_for(&server)).await.unwrap();
        let results = client
            .fetch_batch(&["flaky.com".to_string()], LookupKind::Organization)
            .await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let server = MockServer::start().await;
        mount_auth_ok(&server).await;
        Mock::given(method("POST"))
            .and(path("/org"))
            .respond_with(ResponseTemplate::new(400))
            .expect(1)
            .mount(&server)
            .await;

        let client = EnrichmentClient::connect(&config_for(&server)).await.unwrap();
        assert!(client
            .lookup(LookupKind::Organization, "bad.com")
            .await
            .is_none());
    }
}
