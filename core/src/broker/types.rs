use std::{borrow::Cow, collections::BTreeSet, fmt, time::Duration};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use validator::{Validate, ValidationError};

use crate::broker::error::{BrokerError, invalid_request};

pub type CredentialId = String;
pub type ModelId = String;
pub type RequestId = String;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    #[serde(rename = "openai")]
    OpenAi,
    Anthropic,
}

impl Provider {
    pub const ALL: [Provider; 2] = [Provider::OpenAi, Provider::Anthropic];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::OpenAi => "openai",
            Provider::Anthropic => "anthropic",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DisableReason {
    Admin,
    QuotaExhausted,
    AuthRejected,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum CredentialStatus {
    #[default]
    Enabled,
    Disabled(DisableReason),
}

impl CredentialStatus {
    pub fn is_enabled(&self) -> bool {
        matches!(self, CredentialStatus::Enabled)
    }
}

/// One upstream key/host binding. Shared as `Arc<Credential>` and never mutated in place.
#[derive(Clone, Serialize, Deserialize, Validate)]
pub struct Credential {
    #[validate(length(min = 1, message = "credential id must not be empty"))]
    pub id: CredentialId,
    pub provider: Provider,
    #[validate(length(min = 1, message = "credential key must not be empty"))]
    pub key: String,
    #[validate(custom(function = "validate_host"))]
    pub host: String,
    #[validate(custom(function = "validate_models"))]
    pub models: BTreeSet<ModelId>,
    #[serde(default)]
    pub status: CredentialStatus,
    #[serde(default)]
    pub remarks: Option<String>,
}

impl Credential {
    pub fn new(
        id: impl Into<String>,
        provider: Provider,
        key: impl Into<String>,
        host: impl Into<String>,
        models: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            id: id.into(),
            provider,
            key: key.into(),
            host: host.into(),
            models: models.into_iter().map(Into::into).collect(),
            status: CredentialStatus::Enabled,
            remarks: None,
        }
    }

    pub fn with_status(mut self, status: CredentialStatus) -> Self {
        self.status = status;
        self
    }

    pub fn check(&self) -> Result<(), BrokerError> {
        self.validate().map_err(|errors| {
            invalid_request(format!("credential '{}' is invalid: {}", self.id, errors))
        })
    }

    pub fn serves(&self, model: &str) -> bool {
        self.models.contains(model)
    }

    /// Short stable digest of the key, safe to log.
    pub fn fingerprint(&self) -> String {
        key_fingerprint(&self.key)
    }

    pub fn usage_check_task(&self) -> UsageCheckTask {
        UsageCheckTask {
            credential_id: self.id.clone(),
            provider: self.provider,
            key: self.key.clone(),
            host: self.host.clone(),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("provider", &self.provider)
            .field("key", &format_args!("<redacted:{}>", self.fingerprint()))
            .field("host", &self.host)
            .field("models", &self.models)
            .field("status", &self.status)
            .field("remarks", &self.remarks)
            .finish()
    }
}

pub fn key_fingerprint(key: &str) -> String {
    Sha256::digest(key.as_bytes())
        .iter()
        .take(4)
        .map(|byte| format!("{:02x}", byte))
        .collect()
}

fn validate_host(host: &str) -> Result<(), ValidationError> {
    let trimmed = host.trim();
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        return Ok(());
    }
    Err(ValidationError::new("host")
        .with_message(Cow::from("credential host must be an http(s) base URL")))
}

fn validate_models(models: &BTreeSet<ModelId>) -> Result<(), ValidationError> {
    if models.is_empty() || models.iter().any(|model| model.trim().is_empty()) {
        return Err(ValidationError::new("models")
            .with_message(Cow::from("credential models must be a non-empty set of names")));
    }
    Ok(())
}

#[derive(Clone, PartialEq, Eq)]
pub struct UsageCheckTask {
    pub credential_id: CredentialId,
    pub provider: Provider,
    pub key: String,
    pub host: String,
}

impl fmt::Debug for UsageCheckTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UsageCheckTask")
            .field("credential_id", &self.credential_id)
            .field("provider", &self.provider)
            .field("key", &format_args!("<redacted:{}>", key_fingerprint(&self.key)))
            .field("host", &self.host)
            .finish()
    }
}

/// Result of one quota/validity query against an upstream account.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    /// Key accepted. `remaining` is `None` when the provider does not expose quota.
    Healthy { remaining: Option<f64> },
    Exhausted { detail: String },
    Invalid { detail: String },
    Transient { detail: String },
}

#[derive(Debug, Clone)]
pub struct AdapterContext {
    pub request_id: RequestId,
    pub credential: std::sync::Arc<Credential>,
    pub model: ModelId,
    pub response_timeout: Duration,
    pub read_timeout: Duration,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BrokerConfig {
    #[serde(default)]
    pub credentials: Vec<Credential>,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub adapters: AdapterConfig,
    #[serde(default)]
    pub prober: ProberConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_max_function_rounds")]
    pub max_function_rounds: u32,
    #[serde(default = "default_true")]
    pub reselect_on_credential_failure: bool,
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_function_timeout_ms")]
    pub function_timeout_ms: u64,
    #[serde(default = "default_output_buffer")]
    pub output_buffer: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_function_rounds: default_max_function_rounds(),
            reselect_on_credential_failure: true,
            response_timeout_ms: default_response_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            function_timeout_ms: default_function_timeout_ms(),
            output_buffer: default_output_buffer(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterConfig {
    #[serde(default = "default_anthropic_version")]
    pub anthropic_version: String,
    #[serde(default = "default_anthropic_max_tokens")]
    pub anthropic_default_max_tokens: u64,
    #[serde(default = "default_true")]
    pub openai_include_usage: bool,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            anthropic_version: default_anthropic_version(),
            anthropic_default_max_tokens: default_anthropic_max_tokens(),
            openai_include_usage: true,
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProberConfig {
    #[serde(default = "default_prober_workers")]
    pub workers: usize,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_bulk_limit")]
    pub bulk_limit: usize,
    #[serde(default)]
    pub revalidate_on_start: bool,
}

impl Default for ProberConfig {
    fn default() -> Self {
        Self {
            workers: default_prober_workers(),
            probe_timeout_ms: default_probe_timeout_ms(),
            bulk_limit: default_bulk_limit(),
            revalidate_on_start: false,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_function_rounds() -> u32 {
    5
}

fn default_response_timeout_ms() -> u64 {
    30_000
}

fn default_read_timeout_ms() -> u64 {
    60_000
}

fn default_function_timeout_ms() -> u64 {
    30_000
}

fn default_output_buffer() -> usize {
    128
}

fn default_anthropic_version() -> String {
    "2023-06-01".to_string()
}

fn default_anthropic_max_tokens() -> u64 {
    4_096
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_prober_workers() -> usize {
    2
}

fn default_probe_timeout_ms() -> u64 {
    15_000
}

fn default_bulk_limit() -> usize {
    100
}
