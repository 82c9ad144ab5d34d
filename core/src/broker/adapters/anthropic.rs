use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use reqwest::{Client, header};
use serde_json::{Value, json};

use crate::broker::{
    adapters::{
        ProviderAdapter,
        http_common::{self, SseDecoder},
    },
    error::{BrokerError, BrokerErrorKind, protocol_violation},
    types::{AdapterConfig, AdapterContext, CredentialId, ProbeOutcome, Provider},
    types_chat::{
        ChatEvent, ChatEventStream, ChatMessage, FinishReason, MessageContent, ProviderRequest,
        Role, UsageStats,
    },
};

#[derive(Clone)]
pub struct AnthropicAdapter {
    client: Client,
    version: String,
    default_max_tokens: u64,
}

impl AnthropicAdapter {
    pub fn new(config: &AdapterConfig) -> Result<Self, BrokerError> {
        Ok(Self {
            client: http_common::build_client(Duration::from_millis(config.connect_timeout_ms))?,
            version: config.anthropic_version.clone(),
            default_max_tokens: config.anthropic_default_max_tokens,
        })
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn provider(&self) -> Provider {
        Provider::Anthropic
    }

    fn stream(&self, ctx: AdapterContext, request: ProviderRequest) -> ChatEventStream {
        let url = http_common::endpoint(&ctx.credential.host, "v1/messages");
        let body = build_messages_body(&request, self.default_max_tokens);
        let builder = self
            .client
            .post(url)
            .header("x-api-key", &ctx.credential.key)
            .header("anthropic-version", &self.version)
            .header(header::ACCEPT, "text/event-stream")
            .json(&body);
        let decoder = AnthropicStreamDecoder::new(ctx.credential.id.clone());
        http_common::spawn_sse_stream(ctx, builder, decoder)
    }

    async fn probe_quota(&self, key: &str, host: &str) -> ProbeOutcome {
        let response = self
            .client
            .get(http_common::endpoint(host, "v1/models"))
            .header("x-api-key", key)
            .header("anthropic-version", &self.version)
            .send()
            .await;

        match response {
            Ok(response) => {
                let status = response.status().as_u16();
                let body = response.text().await.unwrap_or_default();
                http_common::probe_outcome_for_status(status, &body)
            }
            Err(err) => ProbeOutcome::Transient {
                detail: format!("model listing failed: {}", err),
            },
        }
    }
}

pub fn build_messages_body(request: &ProviderRequest, default_max_tokens: u64) -> Value {
    let (system, messages) = messages_to_wire(&request.messages);
    let mut body = json!({
        "model": request.model,
        "max_tokens": request.options.max_tokens.unwrap_or(default_max_tokens),
        "messages": messages,
        "stream": true,
    });

    if let Some(system) = system {
        body["system"] = Value::String(system);
    }
    if !request.functions.is_empty() {
        body["tools"] = Value::Array(
            request
                .functions
                .iter()
                .map(|function| {
                    json!({
                        "name": function.name,
                        "description": function.description,
                        "input_schema": function.parameters,
                    })
                })
                .collect(),
        );
    }
    if let Some(temperature) = request.options.temperature {
        body["temperature"] = json!(temperature);
    }
    if let Some(top_p) = request.options.top_p {
        body["top_p"] = json!(top_p);
    }
    if !request.options.stop.is_empty() {
        body["stop_sequences"] = json!(request.options.stop);
    }
    body
}

/// Lifts system prompts out of the conversation and folds the rest into alternating
/// `user`/`assistant` turns made of content blocks.
pub fn messages_to_wire(messages: &[ChatMessage]) -> (Option<String>, Vec<Value>) {
    let mut system_parts = Vec::new();
    let mut turns: Vec<(&'static str, Vec<Value>)> = Vec::new();

    for message in messages {
        if message.role == Role::System {
            let text = message.content.to_text();
            if !text.is_empty() {
                system_parts.push(text);
            }
            continue;
        }

        let role = match message.role {
            Role::Assistant => "assistant",
            _ => "user",
        };
        let blocks = message_blocks(message);
        if blocks.is_empty() {
            continue;
        }

        match turns.last_mut() {
            Some((last_role, last_blocks)) if *last_role == role => last_blocks.extend(blocks),
            _ => turns.push((role, blocks)),
        }
    }

    let system = (!system_parts.is_empty()).then(|| system_parts.join("\n\n"));
    let messages = turns
        .into_iter()
        .map(|(role, content)| json!({"role": role, "content": content}))
        .collect();
    (system, messages)
}

fn message_blocks(message: &ChatMessage) -> Vec<Value> {
    let mut blocks = Vec::new();

    if message.role == Role::Function {
        let text = message.content.to_text();
        match &message.call_id {
            Some(call_id) => blocks.push(json!({
                "type": "tool_result",
                "tool_use_id": call_id,
                "content": text,
            })),
            None => {
                let name = message.name.as_deref().unwrap_or("function");
                blocks.push(text_block(format!("[{} result]\n{}", name, text)));
            }
        }
        return blocks;
    }

    match &message.content {
        MessageContent::Structured(Value::Array(parts)) => blocks.extend(parts.iter().cloned()),
        content if !content.is_empty() => {
            let text = content.to_text();
            if !text.trim().is_empty() {
                blocks.push(text_block(text));
            }
        }
        _ => {}
    }

    if message.role == Role::Assistant
        && let Some(call) = &message.function_call
    {
        let input = serde_json::from_str::<Value>(&call.arguments)
            .ok()
            .filter(Value::is_object)
            .unwrap_or_else(|| json!({}));
        blocks.push(json!({
            "type": "tool_use",
            "id": call.id,
            "name": call.name,
            "input": input,
        }));
    }
    blocks
}

fn text_block(text: String) -> Value {
    json!({"type": "text", "text": text})
}

pub fn parse_stop_reason(value: &str) -> FinishReason {
    match value {
        "end_turn" | "stop_sequence" => FinishReason::Stop,
        "max_tokens" => FinishReason::Length,
        "tool_use" => FinishReason::FunctionCall,
        other => FinishReason::Other(other.to_string()),
    }
}

#[derive(Debug)]
struct PendingToolUse {
    id: String,
    name: String,
    input_json: String,
}

/// Decoder for Messages API SSE events. Tool-use blocks are released on their
/// `content_block_stop`, the terminal `Done` on `message_stop`.
pub struct AnthropicStreamDecoder {
    credential_id: CredentialId,
    tool_uses: HashMap<u64, PendingToolUse>,
    stop_reason: Option<String>,
    usage: UsageStats,
    finished: bool,
}

impl AnthropicStreamDecoder {
    pub fn new(credential_id: impl Into<String>) -> Self {
        Self {
            credential_id: credential_id.into(),
            tool_uses: HashMap::new(),
            stop_reason: None,
            usage: UsageStats::default(),
            finished: false,
        }
    }

    fn fail(&mut self, error: BrokerError) -> Vec<ChatEvent> {
        self.finished = true;
        vec![ChatEvent::Failed(
            error.with_credential_id(self.credential_id.clone()),
        )]
    }

    fn absorb_usage(&mut self, usage: &Value) {
        if let Some(input) = usage.get("input_tokens").and_then(Value::as_u64) {
            self.usage.input_tokens = Some(input);
        }
        if let Some(output) = usage.get("output_tokens").and_then(Value::as_u64) {
            self.usage.output_tokens = Some(output);
        }
        self.usage.provider_usage_raw = Some(usage.clone());
    }

    fn complete(&mut self) -> Vec<ChatEvent> {
        self.finished = true;
        let mut usage = std::mem::take(&mut self.usage);
        if let (Some(input), Some(output)) = (usage.input_tokens, usage.output_tokens) {
            usage.total_tokens = Some(input.saturating_add(output));
        }
        let usage = (usage != UsageStats::default()).then_some(usage);
        vec![ChatEvent::Done {
            finish_reason: self
                .stop_reason
                .as_deref()
                .map(parse_stop_reason)
                .unwrap_or(FinishReason::Stop),
            usage,
        }]
    }
}

impl SseDecoder for AnthropicStreamDecoder {
    fn decode(&mut self, data: &str) -> Vec<ChatEvent> {
        if self.finished {
            return Vec::new();
        }

        let payload = match serde_json::from_str::<Value>(data) {
            Ok(payload) => payload,
            Err(err) => {
                return self.fail(protocol_violation(format!(
                    "failed to parse anthropic stream payload: {}",
                    err
                )));
            }
        };
        let index = payload.get("index").and_then(Value::as_u64).unwrap_or(0);

        match payload.get("type").and_then(Value::as_str).unwrap_or_default() {
            "message_start" => {
                if let Some(usage) = payload.pointer("/message/usage") {
                    self.absorb_usage(usage);
                }
                Vec::new()
            }
            "content_block_start" => {
                let Some(block) = payload.get("content_block") else {
                    return self.fail(protocol_violation("content_block_start without block"));
                };
                match block.get("type").and_then(Value::as_str) {
                    Some("tool_use") => {
                        self.tool_uses.insert(
                            index,
                            PendingToolUse {
                                id: block
                                    .get("id")
                                    .and_then(Value::as_str)
                                    .unwrap_or_default()
                                    .to_string(),
                                name: block
                                    .get("name")
                                    .and_then(Value::as_str)
                                    .unwrap_or_default()
                                    .to_string(),
                                input_json: String::new(),
                            },
                        );
                        Vec::new()
                    }
                    Some("text") => block
                        .get("text")
                        .and_then(Value::as_str)
                        .filter(|text| !text.is_empty())
                        .map(|text| vec![ChatEvent::TextDelta(text.to_string())])
                        .unwrap_or_default(),
                    _ => Vec::new(),
                }
            }
            "content_block_delta" => {
                let delta = payload.get("delta").cloned().unwrap_or(Value::Null);
                match delta.get("type").and_then(Value::as_str) {
                    Some("text_delta") => delta
                        .get("text")
                        .and_then(Value::as_str)
                        .filter(|text| !text.is_empty())
                        .map(|text| vec![ChatEvent::TextDelta(text.to_string())])
                        .unwrap_or_default(),
                    Some("input_json_delta") => {
                        if let Some(partial) = delta.get("partial_json").and_then(Value::as_str)
                            && let Some(tool_use) = self.tool_uses.get_mut(&index)
                        {
                            tool_use.input_json.push_str(partial);
                        }
                        Vec::new()
                    }
                    _ => Vec::new(),
                }
            }
            "content_block_stop" => match self.tool_uses.remove(&index) {
                Some(tool_use) => {
                    let arguments = if tool_use.input_json.trim().is_empty() {
                        "{}".to_string()
                    } else {
                        tool_use.input_json
                    };
                    vec![ChatEvent::FunctionCallRequested {
                        id: (!tool_use.id.is_empty()).then_some(tool_use.id),
                        name: tool_use.name,
                        arguments,
                    }]
                }
                None => Vec::new(),
            },
            "message_delta" => {
                if let Some(reason) = payload.pointer("/delta/stop_reason").and_then(Value::as_str)
                {
                    self.stop_reason = Some(reason.to_string());
                }
                if let Some(usage) = payload.get("usage") {
                    self.absorb_usage(usage);
                }
                Vec::new()
            }
            "message_stop" => self.complete(),
            "error" => {
                let error = payload.get("error").cloned().unwrap_or(Value::Null);
                self.fail(map_inband_error(&error))
            }
            _ => Vec::new(),
        }
    }

    fn finish(&mut self) -> Vec<ChatEvent> {
        if self.finished {
            return Vec::new();
        }
        self.fail(protocol_violation(
            "anthropic stream ended before message_stop",
        ))
    }
}

fn map_inband_error(error: &Value) -> BrokerError {
    let error_type = error
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("api_error");
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("upstream reported an error");

    let kind = match error_type {
        "authentication_error" | "permission_error" => BrokerErrorKind::Authentication,
        "rate_limit_error" | "overloaded_error" => BrokerErrorKind::RateLimited,
        "not_found_error" => BrokerErrorKind::ModelUnavailable,
        "invalid_request_error" => BrokerErrorKind::InvalidRequest,
        _ => BrokerErrorKind::UpstreamUnavailable,
    };
    BrokerError::new(kind, format!("{}: {}", error_type, message))
}
