use std::{fmt, future::Future, pin::Pin, sync::Arc};

use async_trait::async_trait;
use futures_core::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::broker::{
    error::BrokerError,
    types::{CredentialId, ModelId, Provider},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Function,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Structured(serde_json::Value),
}

impl MessageContent {
    /// Flattened text form, used where a wire format only accepts strings.
    pub fn to_text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Structured(value) => match value {
                serde_json::Value::String(text) => text.clone(),
                other => other.to_string(),
            },
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            MessageContent::Text(text) => text.is_empty(),
            MessageContent::Structured(value) => value.is_null(),
        }
    }
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::Text(String::new())
    }
}

impl From<&str> for MessageContent {
    fn from(value: &str) -> Self {
        MessageContent::Text(value.to_string())
    }
}

impl From<String> for MessageContent {
    fn from(value: String) -> Self {
        MessageContent::Text(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub content: MessageContent,
    #[serde(default)]
    pub is_history: bool,
    #[serde(default)]
    pub function_call: Option<FunctionCall>,
    #[serde(default)]
    pub call_id: Option<String>,
}

impl ChatMessage {
    fn plain(role: Role, content: impl Into<MessageContent>) -> Self {
        Self {
            role,
            name: None,
            content: content.into(),
            is_history: false,
            function_call: None,
            call_id: None,
        }
    }

    pub fn system(content: impl Into<MessageContent>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<MessageContent>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<MessageContent>) -> Self {
        Self::plain(Role::Assistant, content)
    }

    pub fn assistant_call(content: impl Into<MessageContent>, call: FunctionCall) -> Self {
        Self {
            function_call: Some(call),
            ..Self::plain(Role::Assistant, content)
        }
    }

    pub fn function_result(
        name: impl Into<String>,
        call_id: impl Into<String>,
        content: impl Into<MessageContent>,
    ) -> Self {
        Self {
            name: Some(name.into()),
            call_id: Some(call_id.into()),
            ..Self::plain(Role::Function, content)
        }
    }

    pub fn into_history(mut self) -> Self {
        self.is_history = true;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatOptions {
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u64>,
    #[serde(default)]
    pub presence_penalty: Option<f64>,
    #[serde(default)]
    pub frequency_penalty: Option<f64>,
    #[serde(default)]
    pub stop: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub parameters: serde_json::Value,
}

/// Plugin-side implementation of a callable function.
#[async_trait]
pub trait FunctionHandler: Send + Sync {
    async fn invoke(&self, arguments: serde_json::Value) -> anyhow::Result<String>;
}

#[derive(Clone)]
pub struct FunctionSpec {
    pub definition: FunctionDefinition,
    pub handler: Arc<dyn FunctionHandler>,
}

impl FunctionSpec {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
        handler: Arc<dyn FunctionHandler>,
    ) -> Self {
        Self {
            definition: FunctionDefinition {
                name: name.into(),
                description: Some(description.into()),
                parameters,
            },
            handler,
        }
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }
}

impl fmt::Debug for FunctionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionSpec")
            .field("definition", &self.definition)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub provider: Provider,
    pub model: ModelId,
    pub messages: Vec<ChatMessage>,
    pub options: ChatOptions,
    pub functions: Vec<FunctionSpec>,
}

/// What an adapter needs for one streaming turn.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub model: ModelId,
    pub messages: Vec<ChatMessage>,
    pub options: ChatOptions,
    pub functions: Vec<FunctionDefinition>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageStats {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
    #[serde(default)]
    pub provider_usage_raw: Option<serde_json::Value>,
}

impl UsageStats {
    /// Sums per-round counters; the raw payload of the latest round wins.
    pub fn absorb(&mut self, other: &UsageStats) {
        self.input_tokens = add_counter(self.input_tokens, other.input_tokens);
        self.output_tokens = add_counter(self.output_tokens, other.output_tokens);
        self.total_tokens = add_counter(self.total_tokens, other.total_tokens);
        if other.provider_usage_raw.is_some() {
            self.provider_usage_raw = other.provider_usage_raw.clone();
        }
    }
}

fn add_counter(left: Option<u64>, right: Option<u64>) -> Option<u64> {
    match (left, right) {
        (Some(left), Some(right)) => Some(left.saturating_add(right)),
        (left, None) => left,
        (None, right) => right,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    FunctionCall,
    ContentFilter,
    Other(String),
}

#[derive(Debug, Clone)]
pub enum ChatEvent {
    TextDelta(String),
    FunctionCallRequested {
        id: Option<String>,
        name: String,
        arguments: String,
    },
    Done {
        finish_reason: FinishReason,
        usage: Option<UsageStats>,
    },
    Failed(BrokerError),
}

impl ChatEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChatEvent::Done { .. } | ChatEvent::Failed(_))
    }
}

pub type ChatEventStream = Pin<Box<dyn Stream<Item = ChatEvent> + Send + 'static>>;

#[derive(Debug, Clone)]
pub enum ExchangeStatus {
    Completed { finish_reason: FinishReason },
    Failed { error: BrokerError },
}

impl ExchangeStatus {
    pub fn is_completed(&self) -> bool {
        matches!(self, ExchangeStatus::Completed { .. })
    }

    pub fn error(&self) -> Option<&BrokerError> {
        match self {
            ExchangeStatus::Completed { .. } => None,
            ExchangeStatus::Failed { error } => Some(error),
        }
    }
}

#[derive(Debug, Clone)]
pub enum FunctionProgress {
    Invoking { name: String, arguments: String },
    Succeeded { name: String },
    Failed { name: String, error: String },
}

#[derive(Debug, Clone)]
pub enum OutputEvent {
    Text(String),
    FunctionProgress(FunctionProgress),
    Finished(ExchangeStatus),
}

pub type OutputSink = mpsc::Sender<OutputEvent>;

/// Everything handed to the persistence side once an exchange ends.
#[derive(Debug, Clone)]
pub struct FinishedExchange {
    pub request_id: String,
    pub messages: Vec<ChatMessage>,
    pub model: ModelId,
    pub usage: UsageStats,
    pub status: ExchangeStatus,
    pub function_rounds: u32,
    pub credential_id: Option<CredentialId>,
}

impl FinishedExchange {
    /// Messages produced by this exchange, i.e. not loaded from earlier turns.
    pub fn new_messages(&self) -> impl Iterator<Item = &ChatMessage> {
        self.messages.iter().filter(|message| !message.is_history)
    }
}

#[async_trait]
pub trait FinishHandler: Send {
    async fn on_finish(self: Box<Self>, exchange: FinishedExchange);
}

#[async_trait]
impl<F, Fut> FinishHandler for F
where
    F: FnOnce(FinishedExchange) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn on_finish(self: Box<Self>, exchange: FinishedExchange) {
        (*self)(exchange).await
    }
}

/// Per-request wiring, fixed before the exchange starts.
pub struct ChatSession {
    pub sink: OutputSink,
    pub on_finish: Box<dyn FinishHandler>,
    pub debug: bool,
    pub user_id: Option<String>,
}

impl ChatSession {
    pub fn new(sink: OutputSink, on_finish: Box<dyn FinishHandler>) -> Self {
        Self {
            sink,
            on_finish,
            debug: false,
            user_id: None,
        }
    }
}
