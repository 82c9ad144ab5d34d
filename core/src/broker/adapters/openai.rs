use std::{collections::BTreeMap, time::Duration};

use async_trait::async_trait;
use reqwest::{Client, header};
use serde_json::{Value, json};
use time::{Date, OffsetDateTime};

use crate::broker::{
    adapters::{
        ProviderAdapter,
        http_common::{self, SseDecoder},
    },
    error::{BrokerError, BrokerErrorKind, protocol_violation},
    types::{AdapterConfig, AdapterContext, CredentialId, ProbeOutcome, Provider},
    types_chat::{
        ChatEvent, ChatEventStream, ChatMessage, ChatOptions, FinishReason, FunctionDefinition,
        MessageContent, ProviderRequest, Role, UsageStats,
    },
};

const BILLING_WINDOW_DAYS: i64 = 99;

#[derive(Clone)]
pub struct OpenAiAdapter {
    client: Client,
    include_usage: bool,
}

impl OpenAiAdapter {
    pub fn new(config: &AdapterConfig) -> Result<Self, BrokerError> {
        Ok(Self {
            client: http_common::build_client(Duration::from_millis(config.connect_timeout_ms))?,
            include_usage: config.openai_include_usage,
        })
    }

    async fn get_json(&self, url: String, key: &str) -> Result<Value, ProbeOutcome> {
        let response = self
            .client
            .get(url)
            .bearer_auth(key)
            .send()
            .await
            .map_err(|err| ProbeOutcome::Transient {
                detail: format!("quota query failed: {}", err),
            })?;

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        match http_common::probe_outcome_for_status(status, &body) {
            ProbeOutcome::Healthy { .. } => {
                serde_json::from_str(&body).map_err(|err| ProbeOutcome::Transient {
                    detail: format!("quota response is not json: {}", err),
                })
            }
            ProbeOutcome::Transient { .. } if status == 404 => Err(ProbeOutcome::Transient {
                detail: BILLING_UNAVAILABLE.to_string(),
            }),
            ProbeOutcome::Invalid { .. } if body.contains("session key") => {
                Err(ProbeOutcome::Transient {
                    detail: BILLING_UNAVAILABLE.to_string(),
                })
            }
            other => Err(other),
        }
    }

    async fn probe_models(&self, key: &str, host: &str) -> ProbeOutcome {
        match self.get_json(http_common::endpoint(host, "v1/models"), key).await {
            Ok(_) => ProbeOutcome::Healthy { remaining: None },
            Err(outcome) => outcome,
        }
    }
}

const BILLING_UNAVAILABLE: &str = "billing endpoints unavailable for this key";

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn provider(&self) -> Provider {
        Provider::OpenAi
    }

    fn stream(&self, ctx: AdapterContext, request: ProviderRequest) -> ChatEventStream {
        let url = http_common::endpoint(&ctx.credential.host, "v1/chat/completions");
        let body = build_chat_body(&request, self.include_usage);
        let builder = self
            .client
            .post(url)
            .bearer_auth(&ctx.credential.key)
            .header(header::ACCEPT, "text/event-stream")
            .header("x-request-id", ctx.request_id.clone())
            .json(&body);
        let decoder = OpenAiStreamDecoder::new(ctx.credential.id.clone());
        http_common::spawn_sse_stream(ctx, builder, decoder)
    }

    async fn probe_quota(&self, key: &str, host: &str) -> ProbeOutcome {
        let subscription = match self
            .get_json(
                http_common::endpoint(host, "v1/dashboard/billing/subscription"),
                key,
            )
            .await
        {
            Ok(subscription) => subscription,
            Err(ProbeOutcome::Transient { detail }) if detail == BILLING_UNAVAILABLE => {
                return self.probe_models(key, host).await;
            }
            Err(outcome) => return outcome,
        };

        let now = OffsetDateTime::now_utc();
        if let Some(access_until) = subscription.get("access_until").and_then(Value::as_i64)
            && access_until > 0
            && access_until < now.unix_timestamp()
        {
            return ProbeOutcome::Exhausted {
                detail: "subscription access has expired".to_string(),
            };
        }

        let Some(hard_limit_usd) = subscription.get("hard_limit_usd").and_then(Value::as_f64)
        else {
            return ProbeOutcome::Healthy { remaining: None };
        };

        let today = now.date();
        let usage_url = format!(
            "{}?start_date={}&end_date={}",
            http_common::endpoint(host, "v1/dashboard/billing/usage"),
            format_date(today - time::Duration::days(BILLING_WINDOW_DAYS)),
            format_date(today + time::Duration::days(1)),
        );
        let usage = match self.get_json(usage_url, key).await {
            Ok(usage) => usage,
            Err(outcome) => return outcome,
        };

        let used_usd = usage
            .get("total_usage")
            .and_then(Value::as_f64)
            .unwrap_or_default()
            / 100.0;
        quota_outcome(hard_limit_usd, used_usd)
    }
}

pub fn quota_outcome(hard_limit_usd: f64, used_usd: f64) -> ProbeOutcome {
    let remaining = hard_limit_usd - used_usd;
    if remaining <= 0.0 {
        ProbeOutcome::Exhausted {
            detail: format!(
                "quota exhausted: used {:.2} of {:.2} usd",
                used_usd, hard_limit_usd
            ),
        }
    } else {
        ProbeOutcome::Healthy {
            remaining: Some(remaining),
        }
    }
}

fn format_date(date: Date) -> String {
    format!(
        "{:04}-{:02}-{:02}",
        date.year(),
        u8::from(date.month()),
        date.day()
    )
}

pub fn build_chat_body(request: &ProviderRequest, include_usage: bool) -> Value {
    let mut body = json!({
        "model": request.model,
        "messages": messages_to_wire(&request.messages),
        "stream": true,
    });

    if include_usage {
        body["stream_options"] = json!({"include_usage": true});
    }
    if !request.functions.is_empty() {
        body["functions"] = Value::Array(functions_to_wire(&request.functions));
        body["function_call"] = Value::String("auto".to_string());
    }
    apply_options(&mut body, &request.options);
    body
}

fn apply_options(body: &mut Value, options: &ChatOptions) {
    if let Some(temperature) = options.temperature {
        body["temperature"] = json!(temperature);
    }
    if let Some(top_p) = options.top_p {
        body["top_p"] = json!(top_p);
    }
    if let Some(max_tokens) = options.max_tokens {
        body["max_tokens"] = json!(max_tokens);
    }
    if let Some(presence_penalty) = options.presence_penalty {
        body["presence_penalty"] = json!(presence_penalty);
    }
    if let Some(frequency_penalty) = options.frequency_penalty {
        body["frequency_penalty"] = json!(frequency_penalty);
    }
    if !options.stop.is_empty() {
        body["stop"] = json!(options.stop);
    }
}

pub fn messages_to_wire(messages: &[ChatMessage]) -> Vec<Value> {
    messages
        .iter()
        .map(|message| {
            let mut obj = serde_json::Map::new();
            obj.insert("role".into(), Value::String(role_to_wire(message.role).into()));

            let content = match &message.content {
                MessageContent::Text(text) => Value::String(text.clone()),
                MessageContent::Structured(value) => value.clone(),
            };

            match (&message.role, &message.function_call) {
                (Role::Assistant, Some(call)) => {
                    let content = if message.content.is_empty() {
                        Value::Null
                    } else {
                        content
                    };
                    obj.insert("content".into(), content);
                    obj.insert(
                        "function_call".into(),
                        json!({"name": call.name, "arguments": call.arguments}),
                    );
                }
                (Role::Function, _) => {
                    obj.insert(
                        "name".into(),
                        Value::String(message.name.clone().unwrap_or_else(|| "function".into())),
                    );
                    obj.insert("content".into(), Value::String(message.content.to_text()));
                }
                _ => {
                    obj.insert("content".into(), content);
                    if let Some(name) = &message.name {
                        obj.insert("name".into(), Value::String(name.clone()));
                    }
                }
            }
            Value::Object(obj)
        })
        .collect()
}

fn role_to_wire(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Function => "function",
    }
}

fn functions_to_wire(functions: &[FunctionDefinition]) -> Vec<Value> {
    functions
        .iter()
        .map(|function| {
            json!({
                "name": function.name,
                "description": function.description,
                "parameters": function.parameters,
            })
        })
        .collect()
}

pub fn parse_finish_reason(value: &str) -> FinishReason {
    match value {
        "stop" => FinishReason::Stop,
        "length" => FinishReason::Length,
        "function_call" | "tool_calls" => FinishReason::FunctionCall,
        "content_filter" => FinishReason::ContentFilter,
        other => FinishReason::Other(other.to_string()),
    }
}

#[derive(Debug, Default)]
struct PendingCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

/// Incremental decoder for `chat/completions` SSE payloads.
///
/// Function-call fragments are assembled per call index and released, together with the
/// terminal `Done`, once the stream reports `[DONE]` or ends after a finish reason.
pub struct OpenAiStreamDecoder {
    credential_id: CredentialId,
    calls: BTreeMap<u64, PendingCall>,
    finish_reason: Option<String>,
    usage: Option<UsageStats>,
    finished: bool,
}

impl OpenAiStreamDecoder {
    pub fn new(credential_id: impl Into<String>) -> Self {
        Self {
            credential_id: credential_id.into(),
            calls: BTreeMap::new(),
            finish_reason: None,
            usage: None,
            finished: false,
        }
    }

    fn fail(&mut self, error: BrokerError) -> Vec<ChatEvent> {
        self.finished = true;
        vec![ChatEvent::Failed(
            error.with_credential_id(self.credential_id.clone()),
        )]
    }

    fn complete(&mut self) -> Vec<ChatEvent> {
        self.finished = true;
        let mut events = std::mem::take(&mut self.calls)
            .into_values()
            .filter(|call| !call.name.is_empty())
            .map(|call| ChatEvent::FunctionCallRequested {
                id: call.id,
                name: call.name,
                arguments: call.arguments,
            })
            .collect::<Vec<_>>();
        events.push(ChatEvent::Done {
            finish_reason: self
                .finish_reason
                .as_deref()
                .map(parse_finish_reason)
                .unwrap_or(FinishReason::Stop),
            usage: self.usage.take(),
        });
        events
    }

    fn absorb_call_fragment(&mut self, index: u64, id: Option<&str>, function: &Value) {
        let call = self.calls.entry(index).or_default();
        if let Some(id) = id {
            call.id = Some(id.to_string());
        }
        if let Some(name) = function.get("name").and_then(Value::as_str) {
            call.name.push_str(name);
        }
        if let Some(arguments) = function.get("arguments").and_then(Value::as_str) {
            call.arguments.push_str(arguments);
        }
    }
}

impl SseDecoder for OpenAiStreamDecoder {
    fn decode(&mut self, data: &str) -> Vec<ChatEvent> {
        if self.finished {
            return Vec::new();
        }
        if data == "[DONE]" {
            return self.complete();
        }

        let payload = match serde_json::from_str::<Value>(data) {
            Ok(payload) => payload,
            Err(err) => {
                return self.fail(protocol_violation(format!(
                    "failed to parse openai stream payload: {}",
                    err
                )));
            }
        };

        if let Some(error) = payload.get("error") {
            return self.fail(map_inband_error(error));
        }

        if let Some(usage) = payload.get("usage").filter(|usage| !usage.is_null()) {
            self.usage = Some(parse_usage(usage));
        }

        let Some(choices) = payload.get("choices").and_then(Value::as_array) else {
            if self.usage.is_some() {
                return Vec::new();
            }
            return self.fail(protocol_violation("openai stream payload missing choices"));
        };

        let mut events = Vec::new();
        for choice in choices {
            if let Some(delta) = choice.get("delta") {
                if let Some(content) = delta.get("content").and_then(Value::as_str)
                    && !content.is_empty()
                {
                    events.push(ChatEvent::TextDelta(content.to_string()));
                }

                if let Some(function_call) = delta.get("function_call") {
                    self.absorb_call_fragment(0, None, function_call);
                }

                if let Some(tool_calls) = delta.get("tool_calls").and_then(Value::as_array) {
                    for (position, tool_call) in tool_calls.iter().enumerate() {
                        let index = tool_call
                            .get("index")
                            .and_then(Value::as_u64)
                            .unwrap_or(position as u64);
                        let id = tool_call.get("id").and_then(Value::as_str);
                        if let Some(function) = tool_call.get("function") {
                            self.absorb_call_fragment(index, id, function);
                        }
                    }
                }
            }

            if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
                self.finish_reason = Some(reason.to_string());
            }
        }
        events
    }

    fn finish(&mut self) -> Vec<ChatEvent> {
        if self.finished {
            return Vec::new();
        }
        if self.finish_reason.is_some() {
            return self.complete();
        }
        self.fail(protocol_violation(
            "openai stream ended before a finish reason",
        ))
    }
}

fn map_inband_error(error: &Value) -> BrokerError {
    let code = error
        .get("code")
        .and_then(Value::as_str)
        .or_else(|| error.get("type").and_then(Value::as_str))
        .unwrap_or_default();
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("upstream reported an error");

    let kind = match code {
        "invalid_api_key" | "authentication_error" | "account_deactivated" => {
            BrokerErrorKind::Authentication
        }
        "insufficient_quota" | "rate_limit_exceeded" | "requests" | "tokens" => {
            BrokerErrorKind::RateLimited
        }
        "model_not_found" => BrokerErrorKind::ModelUnavailable,
        _ => BrokerErrorKind::UpstreamUnavailable,
    };
    BrokerError::new(kind, format!("{}: {}", code, message))
}

pub fn parse_usage(usage: &Value) -> UsageStats {
    UsageStats {
        input_tokens: usage.get("prompt_tokens").and_then(Value::as_u64),
        output_tokens: usage.get("completion_tokens").and_then(Value::as_u64),
        total_tokens: usage.get("total_tokens").and_then(Value::as_u64),
        provider_usage_raw: Some(usage.clone()),
    }
}
