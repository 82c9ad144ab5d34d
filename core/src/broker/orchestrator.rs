use std::{sync::Arc, time::Duration};

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::broker::{
    adapters::AdapterRegistry,
    bridge::FunctionBridge,
    error::{BrokerError, BrokerErrorKind, protocol_violation},
    pool::{CredentialPool, SelectionHint},
    prober::ProberHandle,
    request_normalizer::RequestNormalizer,
    telemetry::{BrokerTelemetryEvent, emit_broker_event},
    types::{AdapterContext, Credential, OrchestratorConfig, RequestId},
    types_chat::{
        ChatEvent, ChatMessage, ChatRequest, ChatSession, ExchangeStatus, FinishHandler,
        FinishReason, FinishedExchange, FunctionCall, FunctionDefinition, FunctionProgress,
        OutputEvent, OutputSink, ProviderRequest, UsageStats,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExchangeState {
    Selecting,
    Streaming,
    AwaitingFunction,
    Finalizing,
}

impl ExchangeState {
    fn as_str(self) -> &'static str {
        match self {
            ExchangeState::Selecting => "selecting",
            ExchangeState::Streaming => "streaming",
            ExchangeState::AwaitingFunction => "awaiting_function",
            ExchangeState::Finalizing => "finalizing",
        }
    }
}

/// Mutable record of one exchange; handed to the finish handler at the end.
struct ExchangeRecord {
    request_id: RequestId,
    messages: Vec<ChatMessage>,
    usage: UsageStats,
    function_rounds: u32,
    credential_id: Option<String>,
}

impl ExchangeRecord {
    fn transition(&self, state: ExchangeState) {
        tracing::debug!(
            target: "broker",
            request_id = %self.request_id,
            state = state.as_str(),
            function_rounds = self.function_rounds,
            "exchange_state"
        );
    }

    fn push_partial(&mut self, content: String) {
        if !content.is_empty() {
            self.messages.push(ChatMessage::assistant(content));
        }
    }
}

enum TurnOutcome {
    Done {
        finish_reason: FinishReason,
        usage: Option<UsageStats>,
        content: String,
        calls: Vec<FunctionCall>,
    },
    Failed {
        error: BrokerError,
        content: String,
        emitted_text: bool,
    },
    Cancelled {
        content: String,
    },
}

pub struct ChatOrchestrator {
    pool: Arc<CredentialPool>,
    adapters: AdapterRegistry,
    bridge: FunctionBridge,
    request_normalizer: RequestNormalizer,
    prober: Option<ProberHandle>,
    config: OrchestratorConfig,
}

impl ChatOrchestrator {
    pub fn new(
        pool: Arc<CredentialPool>,
        adapters: AdapterRegistry,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            pool,
            adapters,
            bridge: FunctionBridge::new(Duration::from_millis(config.function_timeout_ms)),
            request_normalizer: RequestNormalizer,
            prober: None,
            config,
        }
    }

    pub fn with_prober(mut self, prober: ProberHandle) -> Self {
        self.prober = Some(prober);
        self
    }

    pub fn with_adapters(mut self, adapters: AdapterRegistry) -> Self {
        self.adapters = adapters;
        self
    }

    pub fn pool(&self) -> &Arc<CredentialPool> {
        &self.pool
    }

    /// Spawns the exchange on its own task and returns the caller's side of the sink.
    /// Dropping the returned stream cancels the exchange.
    pub fn chat_stream(
        self: &Arc<Self>,
        request: ChatRequest,
        on_finish: Box<dyn FinishHandler>,
        debug: bool,
    ) -> ReceiverStream<OutputEvent> {
        let (sink, receiver) = mpsc::channel(self.config.output_buffer.max(1));
        let mut session = ChatSession::new(sink, on_finish);
        session.debug = debug;

        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            orchestrator.handle(request, session).await;
        });
        ReceiverStream::new(receiver)
    }

    /// Runs one exchange to completion. The finish handler is invoked exactly once before
    /// this returns, whatever the outcome.
    pub async fn handle(&self, request: ChatRequest, session: ChatSession) -> FinishedExchange {
        let request_id = Uuid::now_v7().to_string();
        let span = tracing::info_span!(
            target: "broker",
            "chat_exchange",
            request_id = %request_id,
            provider = %request.provider,
            model = %request.model,
            debug = session.debug,
        );
        self.run_exchange(request_id, request, session)
            .instrument(span)
            .await
    }

    async fn run_exchange(
        &self,
        request_id: RequestId,
        request: ChatRequest,
        session: ChatSession,
    ) -> FinishedExchange {
        let ChatSession {
            sink,
            on_finish,
            debug,
            user_id,
        } = session;

        emit_broker_event(BrokerTelemetryEvent::ExchangeStarted {
            request_id: request_id.clone(),
            provider: request.provider,
            model: request.model.clone(),
            user_id,
        });

        let mut record = ExchangeRecord {
            request_id,
            messages: request.messages.clone(),
            usage: UsageStats::default(),
            function_rounds: 0,
            credential_id: None,
        };

        let status = match self.drive(&request, &mut record, &sink, debug).await {
            Ok(finish_reason) => ExchangeStatus::Completed { finish_reason },
            Err(error) => ExchangeStatus::Failed { error },
        };
        record.transition(ExchangeState::Finalizing);

        let _ = sink.send(OutputEvent::Finished(status.clone())).await;

        match &status {
            ExchangeStatus::Completed { .. } => {
                emit_broker_event(BrokerTelemetryEvent::ExchangeCompleted {
                    request_id: record.request_id.clone(),
                    function_rounds: record.function_rounds,
                    usage: record.usage.clone(),
                })
            }
            ExchangeStatus::Failed { error } => {
                emit_broker_event(BrokerTelemetryEvent::ExchangeFailed {
                    request_id: record.request_id.clone(),
                    function_rounds: record.function_rounds,
                    error_kind: error.kind,
                })
            }
        }

        let finished = FinishedExchange {
            request_id: record.request_id,
            messages: record.messages,
            model: request.model,
            usage: record.usage,
            status,
            function_rounds: record.function_rounds,
            credential_id: record.credential_id,
        };
        on_finish.on_finish(finished.clone()).await;
        finished
    }

    async fn drive(
        &self,
        request: &ChatRequest,
        record: &mut ExchangeRecord,
        sink: &OutputSink,
        debug: bool,
    ) -> Result<FinishReason, BrokerError> {
        self.request_normalizer.validate(request)?;
        let definitions = request
            .functions
            .iter()
            .map(|function| function.definition.clone())
            .collect::<Vec<_>>();

        record.transition(ExchangeState::Selecting);
        let mut hint = SelectionHint::default();
        let mut credential = self
            .pool
            .select(request.provider, &request.model, &hint)?;
        let mut reselected = false;
        self.note_selected(record, &credential, false);

        loop {
            if sink.is_closed() {
                return Err(cancelled());
            }

            record.transition(ExchangeState::Streaming);
            let turn = self
                .stream_turn(record, &credential, request, &definitions, sink)
                .await;

            let (content, calls) = match turn {
                TurnOutcome::Cancelled { content } => {
                    record.push_partial(content);
                    return Err(cancelled());
                }
                TurnOutcome::Failed {
                    error,
                    content,
                    emitted_text,
                } => {
                    let error = if error.credential_id.is_some() {
                        error
                    } else {
                        error.with_credential_id(credential.id.clone())
                    };
                    if error.is_credential_failure() {
                        self.note_credential_failure(record, &credential, &error);
                    }

                    let may_reselect = error.is_credential_failure()
                        && self.config.reselect_on_credential_failure
                        && !reselected
                        && !emitted_text;
                    if may_reselect {
                        hint.exclude.insert(credential.id.clone());
                        record.transition(ExchangeState::Selecting);
                        match self.pool.select(request.provider, &request.model, &hint) {
                            Ok(next) => {
                                reselected = true;
                                credential = next;
                                self.note_selected(record, &credential, true);
                                record.push_partial(content);
                                continue;
                            }
                            Err(reselect_error) => {
                                tracing::debug!(
                                    target: "broker",
                                    request_id = %record.request_id,
                                    error = %reselect_error,
                                    "reselection_unavailable"
                                );
                            }
                        }
                    }

                    record.push_partial(content);
                    return Err(error);
                }
                TurnOutcome::Done {
                    finish_reason,
                    usage,
                    content,
                    calls,
                } => {
                    if let Some(usage) = usage {
                        record.usage.absorb(&usage);
                    }
                    if calls.is_empty() {
                        record.push_partial(content);
                        return Ok(finish_reason);
                    }
                    (content, calls)
                }
            };

            if record.function_rounds >= self.config.max_function_rounds {
                record.push_partial(content);
                return Err(BrokerError::new(
                    BrokerErrorKind::FunctionLoopExceeded,
                    format!(
                        "model requested another function call after {} rounds",
                        record.function_rounds
                    ),
                )
                .with_credential_id(credential.id.clone()));
            }

            record.function_rounds += 1;
            record.transition(ExchangeState::AwaitingFunction);
            if !self
                .run_function_round(record, request, content, calls, sink, debug)
                .await
            {
                return Err(cancelled());
            }
        }
    }

    /// Appends the assistant call(s) and their results. Returns `false` once the caller is gone.
    async fn run_function_round(
        &self,
        record: &mut ExchangeRecord,
        request: &ChatRequest,
        content: String,
        calls: Vec<FunctionCall>,
        sink: &OutputSink,
        debug: bool,
    ) -> bool {
        let mut content = Some(content);
        for call in calls {
            record.messages.push(ChatMessage::assistant_call(
                content.take().unwrap_or_default(),
                call.clone(),
            ));

            if debug
                && sink
                    .send(OutputEvent::FunctionProgress(FunctionProgress::Invoking {
                        name: call.name.clone(),
                        arguments: call.arguments.clone(),
                    }))
                    .await
                    .is_err()
            {
                return false;
            }

            let result = self.bridge.execute(&request.functions, &call).await;
            emit_broker_event(BrokerTelemetryEvent::FunctionInvoked {
                request_id: record.request_id.clone(),
                round: record.function_rounds,
                name: call.name.clone(),
                ok: result.is_ok(),
            });

            if debug {
                let progress = match &result.error {
                    None => FunctionProgress::Succeeded {
                        name: call.name.clone(),
                    },
                    Some(err) => FunctionProgress::Failed {
                        name: call.name.clone(),
                        error: err.to_string(),
                    },
                };
                if sink
                    .send(OutputEvent::FunctionProgress(progress))
                    .await
                    .is_err()
                {
                    record.messages.push(result.message);
                    return false;
                }
            }
            record.messages.push(result.message);
        }
        true
    }

    async fn stream_turn(
        &self,
        record: &ExchangeRecord,
        credential: &Arc<Credential>,
        request: &ChatRequest,
        definitions: &[FunctionDefinition],
        sink: &OutputSink,
    ) -> TurnOutcome {
        let adapter = match self.adapters.get(credential.provider) {
            Ok(adapter) => adapter,
            Err(error) => {
                return TurnOutcome::Failed {
                    error,
                    content: String::new(),
                    emitted_text: false,
                };
            }
        };

        let cancel = CancellationToken::new();
        // Fires on every exit path, including the caller dropping this future.
        let _cancel_on_exit = cancel.clone().drop_guard();

        let ctx = AdapterContext {
            request_id: record.request_id.clone(),
            credential: Arc::clone(credential),
            model: request.model.clone(),
            response_timeout: Duration::from_millis(self.config.response_timeout_ms),
            read_timeout: Duration::from_millis(self.config.read_timeout_ms),
            cancel,
        };
        let provider_request = ProviderRequest {
            model: request.model.clone(),
            messages: record.messages.clone(),
            options: request.options.clone(),
            functions: definitions.to_vec(),
        };

        let mut events = adapter.stream(ctx, provider_request);
        let mut content = String::new();
        let mut calls = Vec::new();
        let mut emitted_text = false;

        loop {
            let next = tokio::select! {
                _ = sink.closed() => return TurnOutcome::Cancelled { content },
                next = events.next() => next,
            };

            match next {
                Some(ChatEvent::TextDelta(text)) => {
                    if sink.send(OutputEvent::Text(text.clone())).await.is_err() {
                        return TurnOutcome::Cancelled { content };
                    }
                    content.push_str(&text);
                    emitted_text = true;
                }
                Some(ChatEvent::FunctionCallRequested {
                    id,
                    name,
                    arguments,
                }) => {
                    calls.push(FunctionCall {
                        id: id.unwrap_or_else(generate_call_id),
                        name,
                        arguments,
                    });
                }
                Some(ChatEvent::Done {
                    finish_reason,
                    usage,
                }) => {
                    return TurnOutcome::Done {
                        finish_reason,
                        usage,
                        content,
                        calls,
                    };
                }
                Some(ChatEvent::Failed(error)) => {
                    return TurnOutcome::Failed {
                        error,
                        content,
                        emitted_text,
                    };
                }
                None => {
                    return TurnOutcome::Failed {
                        error: protocol_violation("adapter stream ended without a terminal event")
                            .with_credential_id(credential.id.clone()),
                        content,
                        emitted_text,
                    };
                }
            }
        }
    }

    fn note_selected(&self, record: &mut ExchangeRecord, credential: &Credential, reselection: bool) {
        record.credential_id = Some(credential.id.clone());
        emit_broker_event(BrokerTelemetryEvent::CredentialSelected {
            request_id: record.request_id.clone(),
            credential_id: credential.id.clone(),
            reselection,
        });
    }

    fn note_credential_failure(
        &self,
        record: &ExchangeRecord,
        credential: &Credential,
        error: &BrokerError,
    ) {
        emit_broker_event(BrokerTelemetryEvent::CredentialFailed {
            request_id: record.request_id.clone(),
            credential_id: credential.id.clone(),
            kind: error.kind,
        });

        if (error.kind == BrokerErrorKind::Authentication || error.is_quota_exhausted())
            && let Some(prober) = &self.prober
            && let Err(err) = prober.enqueue(credential.usage_check_task())
        {
            tracing::debug!(
                target: "broker",
                credential_id = %credential.id,
                error = %err,
                "probe_enqueue_failed"
            );
        }
    }
}

fn cancelled() -> BrokerError {
    BrokerError::new(BrokerErrorKind::Cancelled, "caller disconnected")
}

fn generate_call_id() -> String {
    format!("call_{}", Uuid::now_v7().simple())
}
