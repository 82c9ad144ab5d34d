use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, anyhow};
use jsonschema::JSONSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::broker::types::BrokerConfig;

const SCHEMA_FILE_NAME: &str = "broker.schema.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_logging_dir() -> PathBuf {
    PathBuf::from("./logs/broker")
}

fn default_logging_filter() -> String {
    "info".to_string()
}

fn default_logging_retention_days() -> usize {
    14
}

fn default_stderr_warn_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum LoggingRotation {
    #[default]
    Daily,
    Hourly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_logging_filter")]
    pub filter: String,
    #[serde(default)]
    pub rotation: LoggingRotation,
    #[serde(default = "default_logging_retention_days")]
    pub retention_days: usize,
    #[serde(default = "default_stderr_warn_enabled")]
    pub stderr_warn_enabled: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: default_logging_dir(),
            filter: default_logging_filter(),
            rotation: LoggingRotation::Daily,
            retention_days: default_logging_retention_days(),
            stderr_warn_enabled: true,
        }
    }
}

impl Config {
    pub fn load(config_path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("failed to read {}", config_path.display()))?;
        let config_value: Value = json5::from_str(&config_content)
            .with_context(|| format!("failed to parse {}", config_path.display()))?;

        let config_base = config_path.parent().unwrap_or_else(|| Path::new("."));
        let schema_path = resolve_schema_path(config_base, &config_value)?;
        validate_against_schema(&config_value, &schema_path)?;

        let config: Config =
            serde_json::from_value(config_value).context("failed to deserialize broker config")?;
        config.check_credentials()?;
        Ok(config)
    }

    fn check_credentials(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for credential in &self.broker.credentials {
            credential.check().map_err(|err| anyhow!("{err}"))?;
            if !seen.insert(credential.id.as_str()) {
                return Err(anyhow!(
                    "credential id '{}' is configured more than once",
                    credential.id
                ));
            }
        }
        Ok(())
    }
}

fn resolve_schema_path(config_base: &Path, config_value: &Value) -> Result<PathBuf> {
    if let Some(path_text) = config_value.get("$schema").and_then(Value::as_str) {
        let configured = PathBuf::from(path_text);
        if configured.is_absolute() {
            return Ok(configured);
        }
        return Ok(config_base.join(&configured));
    }

    [
        config_base.join("core").join(SCHEMA_FILE_NAME),
        config_base.join(SCHEMA_FILE_NAME),
    ]
    .into_iter()
    .find(|candidate| candidate.exists())
    .ok_or_else(|| {
        anyhow!(
            "unable to resolve schema path: expected $schema in config, core/{SCHEMA_FILE_NAME}, or {SCHEMA_FILE_NAME}"
        )
    })
}

fn validate_against_schema(config_value: &Value, schema_path: &Path) -> Result<()> {
    let schema_content = fs::read_to_string(schema_path)
        .with_context(|| format!("failed to read schema {}", schema_path.display()))?;
    let schema: Value = serde_json::from_str(&schema_content)
        .with_context(|| format!("failed to parse schema {}", schema_path.display()))?;

    let compiled =
        JSONSchema::compile(&schema).map_err(|e| anyhow!("failed to compile schema: {e}"))?;

    if let Err(errors) = compiled.validate(config_value) {
        let messages = errors
            .map(|error| error.to_string())
            .collect::<Vec<_>>();
        return Err(anyhow!("config validation failed: {}", messages.join("; ")));
    }
    Ok(())
}
