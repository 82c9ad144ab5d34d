use std::time::Duration;

use jsonschema::JSONSchema;
use serde_json::{Value, json};
use thiserror::Error;

use crate::broker::types_chat::{ChatMessage, FunctionCall, FunctionSpec};

#[derive(Debug, Clone, Error)]
pub enum FunctionError {
    #[error("unknown function '{0}'")]
    UnknownFunction(String),
    #[error("arguments for '{name}' are not valid JSON: {detail}")]
    MalformedArguments { name: String, detail: String },
    #[error("parameter schema of '{name}' cannot be compiled: {detail}")]
    InvalidSchema { name: String, detail: String },
    #[error("arguments for '{name}' do not match its parameters: {detail}")]
    SchemaMismatch { name: String, detail: String },
    #[error("function '{name}' failed: {detail}")]
    Handler { name: String, detail: String },
    #[error("function '{name}' did not finish within {timeout_ms} ms")]
    Timeout { name: String, timeout_ms: u128 },
}

impl FunctionError {
    /// Body of the function-role message that reports this error to the model.
    pub fn into_message(self) -> String {
        json!({ "error": self.to_string() }).to_string()
    }
}

/// Outcome of resolving and running one requested call. `message` is always present.
#[derive(Debug)]
pub struct FunctionResult {
    pub message: ChatMessage,
    pub error: Option<FunctionError>,
}

impl FunctionResult {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct FunctionBridge {
    timeout: Duration,
}

impl FunctionBridge {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub async fn invoke(
        &self,
        spec: &FunctionSpec,
        arguments_json: &str,
    ) -> Result<String, FunctionError> {
        let name = spec.name().to_string();
        let arguments = parse_arguments(&name, arguments_json)?;
        validate_arguments(&name, &spec.definition.parameters, &arguments)?;

        match tokio::time::timeout(self.timeout, spec.handler.invoke(arguments)).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(err)) => Err(FunctionError::Handler {
                name,
                detail: format!("{:#}", err),
            }),
            Err(_) => Err(FunctionError::Timeout {
                name,
                timeout_ms: self.timeout.as_millis(),
            }),
        }
    }

    /// Resolves `call` by name and runs it; errors become the message content.
    pub async fn execute(&self, functions: &[FunctionSpec], call: &FunctionCall) -> FunctionResult {
        let outcome = match functions.iter().find(|spec| spec.name() == call.name) {
            Some(spec) => self.invoke(spec, &call.arguments).await,
            None => Err(FunctionError::UnknownFunction(call.name.clone())),
        };

        match outcome {
            Ok(content) => FunctionResult {
                message: ChatMessage::function_result(&call.name, &call.id, content),
                error: None,
            },
            Err(err) => {
                tracing::warn!(
                    target: "broker",
                    function = %call.name,
                    call_id = %call.id,
                    error = %err,
                    "function_call_failed"
                );
                let content = err.clone().into_message();
                FunctionResult {
                    message: ChatMessage::function_result(&call.name, &call.id, content),
                    error: Some(err),
                }
            }
        }
    }
}

fn parse_arguments(name: &str, arguments_json: &str) -> Result<Value, FunctionError> {
    if arguments_json.trim().is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_str(arguments_json).map_err(|err| FunctionError::MalformedArguments {
        name: name.to_string(),
        detail: err.to_string(),
    })
}

fn validate_arguments(name: &str, schema: &Value, arguments: &Value) -> Result<(), FunctionError> {
    let compiled = JSONSchema::compile(schema).map_err(|err| FunctionError::InvalidSchema {
        name: name.to_string(),
        detail: err.to_string(),
    })?;

    if let Err(errors) = compiled.validate(arguments) {
        let detail = errors
            .map(|error| error.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        return Err(FunctionError::SchemaMismatch {
            name: name.to_string(),
            detail,
        });
    }
    Ok(())
}
