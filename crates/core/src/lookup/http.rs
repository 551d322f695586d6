//! reqwest-backed lookup clients.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::debug;

use super::{Enricher, Enrichment, LitigatorScreen, LitigatorVerdict};
use crate::record::Record;
use crate::resilience::DependencyError;

/// Endpoint settings for an HTTP lookup service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpLookupConfig {
    /// Endpoint URL the record is POSTed to.
    pub url: String,
    /// Bearer token, if the service needs one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Client-level timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    30
}

impl HttpLookupConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key: None,
            timeout_secs: default_timeout_secs(),
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }
}

/// Map a non-success HTTP status to a dependency error.
///
/// 408, 429 and 5xx are transient; every other status is a permanent
/// rejection of the request.
pub fn classify_status(status: u16, message: String) -> DependencyError {
    match status {
        429 => DependencyError::RateLimited(message),
        408 => DependencyError::Transient(format!("request timeout: {}", message)),
        500..=599 => DependencyError::Server { status, message },
        _ => DependencyError::Rejected { status, message },
    }
}

fn map_reqwest_error(e: reqwest::Error, timeout: Duration) -> DependencyError {
    if e.is_timeout() {
        DependencyError::Timeout(timeout)
    } else if e.is_connect() {
        DependencyError::Connection(e.to_string())
    } else if e.is_decode() || e.is_builder() {
        DependencyError::Invalid(e.to_string())
    } else {
        DependencyError::Transient(e.to_string())
    }
}

/// Shared POST-JSON plumbing for both clients.
#[derive(Debug, Clone)]
struct JsonEndpoint {
    client: Client,
    config: HttpLookupConfig,
}

impl JsonEndpoint {
    fn new(config: HttpLookupConfig) -> Result<Self, DependencyError> {
        if config.url.is_empty() {
            return Err(DependencyError::Invalid("lookup URL is required".to_string()));
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| DependencyError::Invalid(e.to_string()))?;
        Ok(Self { client, config })
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_secs)
    }

    async fn post(&self, body: &Value) -> Result<Value, DependencyError> {
        let mut request = self.client.post(&self.config.url).json(body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, self.timeout()))?;
        let response = check_status(response).await?;

        response
            .json::<Value>()
            .await
            .map_err(|e| DependencyError::Invalid(format!("failed to decode response: {}", e)))
    }
}

async fn check_status(response: Response) -> Result<Response, DependencyError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(classify_status(status.as_u16(), body))
}

/// Enrichment over HTTP: POSTs the record's fields and merges the returned
/// JSON object.
#[derive(Debug, Clone)]
pub struct HttpEnricher {
    name: String,
    endpoint: JsonEndpoint,
}

impl HttpEnricher {
    pub fn new(name: impl Into<String>, config: HttpLookupConfig) -> Result<Self, DependencyError> {
        Ok(Self {
            name: name.into(),
            endpoint: JsonEndpoint::new(config)?,
        })
    }
}

#[async_trait]
impl Enricher for HttpEnricher {
    fn name(&self) -> &str {
        &self.name
    }

    async fn enrich(&self, record: &Record) -> Result<Enrichment, DependencyError> {
        debug!(row = record.row_index, dependency = %self.name, "Enrichment lookup");
        let body = Value::Object(record.fields.clone());
        let response = self.endpoint.post(&body).await?;
        parse_enrichment(response)
    }
}

/// Litigator screening over HTTP: POSTs the record's normalized phones and
/// expects `{ "is_litigator": bool }`.
#[derive(Debug, Clone)]
pub struct HttpLitigatorScreen {
    name: String,
    endpoint: JsonEndpoint,
}

impl HttpLitigatorScreen {
    pub fn new(name: impl Into<String>, config: HttpLookupConfig) -> Result<Self, DependencyError> {
        Ok(Self {
            name: name.into(),
            endpoint: JsonEndpoint::new(config)?,
        })
    }
}

#[async_trait]
impl LitigatorScreen for HttpLitigatorScreen {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self, record: &Record) -> Result<LitigatorVerdict, DependencyError> {
        let phones: Vec<String> = record.phones().into_iter().map(|(_, p)| p).collect();
        debug!(row = record.row_index, phones = phones.len(), "Litigator screen");
        let response = self.endpoint.post(&json!({ "phones": phones })).await?;
        parse_verdict(response)
    }
}

fn parse_enrichment(response: Value) -> Result<Enrichment, DependencyError> {
    match response {
        Value::Object(fields) => Ok(Enrichment::new(fields)),
        Value::Null => Ok(Enrichment::default()),
        other => Err(DependencyError::Invalid(format!(
            "expected JSON object from enrichment service, got {}",
            other
        ))),
    }
}

fn parse_verdict(response: Value) -> Result<LitigatorVerdict, DependencyError> {
    let Value::Object(mut fields) = response else {
        return Err(DependencyError::Invalid(
            "expected JSON object from litigator service".to_string(),
        ));
    };
    let is_litigator = match fields.remove("is_litigator") {
        Some(Value::Bool(flag)) => flag,
        _ => {
            return Err(DependencyError::Invalid(
                "missing boolean 'is_litigator' in litigator response".to_string(),
            ))
        }
    };
    let details: Map<String, Value> = fields;
    Ok(LitigatorVerdict {
        is_litigator,
        details,
    })
}
