use std::collections::HashSet;

use crate::broker::{
    error::{BrokerError, invalid_request},
    types_chat::{ChatMessage, ChatRequest, FunctionDefinition, Role},
};

const ALLOWED_SCHEMA_KEYWORDS: &[&str] = &[
    "$defs",
    "$schema",
    "additionalProperties",
    "allOf",
    "anyOf",
    "default",
    "description",
    "enum",
    "format",
    "items",
    "maxItems",
    "maxLength",
    "maximum",
    "minItems",
    "minLength",
    "minimum",
    "nullable",
    "oneOf",
    "pattern",
    "properties",
    "required",
    "title",
    "type",
];

/// Rejects requests no provider could serve before a credential is spent on them.
#[derive(Default)]
pub struct RequestNormalizer;

impl RequestNormalizer {
    pub fn validate(&self, request: &ChatRequest) -> Result<(), BrokerError> {
        if request.model.trim().is_empty() {
            return Err(invalid_request("model must not be empty"));
        }
        if request.messages.is_empty() {
            return Err(invalid_request("messages must not be empty"));
        }

        for message in &request.messages {
            Self::validate_message_linkage(message)?;
        }

        let mut seen = HashSet::new();
        for function in &request.functions {
            let definition = &function.definition;
            if definition.name.trim().is_empty() {
                return Err(invalid_request("function name must not be empty"));
            }
            if !seen.insert(definition.name.as_str()) {
                return Err(invalid_request(format!(
                    "function '{}' is declared more than once",
                    definition.name
                )));
            }
            Self::validate_schema_keywords(definition)?;
        }

        Ok(())
    }

    fn validate_message_linkage(message: &ChatMessage) -> Result<(), BrokerError> {
        match message.role {
            Role::Function => {
                if message.name.as_deref().is_none_or(str::is_empty) {
                    return Err(invalid_request("function role message must include name"));
                }
                if message.function_call.is_some() {
                    return Err(invalid_request(
                        "function role message must not carry a function call",
                    ));
                }
            }
            Role::System | Role::User => {
                if message.function_call.is_some() {
                    return Err(invalid_request(
                        "only assistant messages may carry a function call",
                    ));
                }
                if message.call_id.is_some() {
                    return Err(invalid_request(
                        "non-function message must not include call_id",
                    ));
                }
            }
            Role::Assistant => {
                if message.call_id.is_some() {
                    return Err(invalid_request(
                        "non-function message must not include call_id",
                    ));
                }
            }
        }

        Ok(())
    }

    fn validate_schema_keywords(function: &FunctionDefinition) -> Result<(), BrokerError> {
        let object = function.parameters.as_object().ok_or_else(|| {
            invalid_request(format!(
                "function '{}' parameters must be a JSON object",
                function.name
            ))
        })?;

        for key in object.keys() {
            if !ALLOWED_SCHEMA_KEYWORDS.contains(&key.as_str()) {
                return Err(invalid_request(format!(
                    "function '{}' parameters contain unsupported keyword '{}'",
                    function.name, key
                )));
            }
        }

        Ok(())
    }
}
