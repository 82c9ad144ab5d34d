use std::{
    sync::{Arc, Mutex, atomic::Ordering},
    time::Duration,
};

use futures_util::StreamExt;

use chat_broker::broker::{
    error::{BrokerError, BrokerErrorKind},
    orchestrator::ChatOrchestrator,
    pool::CredentialPool,
    prober::HealthProber,
    types::{OrchestratorConfig, ProberConfig, Provider},
    types_chat::{
        ChatEvent, ChatMessage, ChatOptions, ChatRequest, ExchangeStatus, FinishReason,
        FinishedExchange, FunctionProgress, OutputEvent, Role,
    },
};

use crate::{
    bridge::search_weather,
    support::{
        ScriptedAdapter, Script, call, call_done, credential, done, failed, recording_finish, text,
    },
};

const WEATHER_ARGS: &str = r#"{"city":"Beijing"}"#;

fn pool_of(ids: &[&str]) -> Arc<CredentialPool> {
    Arc::new(
        CredentialPool::from_credentials(
            ids.iter()
                .map(|id| credential(id, Provider::OpenAi, &["gpt-3.5-turbo"])),
        )
        .expect("pool should seed"),
    )
}

fn weather_request(model: &str) -> ChatRequest {
    ChatRequest {
        provider: Provider::OpenAi,
        model: model.to_string(),
        messages: vec![
            ChatMessage::system("You are a weather assistant.").into_history(),
            ChatMessage::user("What is the weather in Beijing?"),
        ],
        options: ChatOptions::default(),
        functions: vec![search_weather()],
    }
}

fn orchestrator(
    pool: Arc<CredentialPool>,
    adapter: &Arc<ScriptedAdapter>,
    config: OrchestratorConfig,
) -> Arc<ChatOrchestrator> {
    Arc::new(ChatOrchestrator::new(pool, adapter.registry(), config))
}

/// Runs one exchange through the public stream and returns what the caller saw plus the
/// single recorded finish.
async fn run(
    orchestrator: &Arc<ChatOrchestrator>,
    request: ChatRequest,
    debug: bool,
) -> (Vec<OutputEvent>, FinishedExchange) {
    let (on_finish, finished) = recording_finish();
    let events = tokio::time::timeout(
        Duration::from_secs(5),
        orchestrator
            .chat_stream(request, on_finish, debug)
            .collect::<Vec<_>>(),
    )
    .await
    .expect("exchange should finish");
    (events, single_finish(&finished))
}

fn single_finish(finished: &Arc<Mutex<Vec<FinishedExchange>>>) -> FinishedExchange {
    let finished = finished.lock().expect("finish lock");
    assert_eq!(finished.len(), 1, "finish handler must run exactly once");
    finished[0].clone()
}

fn texts(events: &[OutputEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            OutputEvent::Text(text) => Some(text.clone()),
            _ => None,
        })
        .collect()
}

fn failure_kind(status: &ExchangeStatus) -> Option<BrokerErrorKind> {
    status.error().map(|error| error.kind)
}

#[tokio::test]
async fn given_no_credential_serves_model_when_chatting_then_exchange_fails_once() {
    let adapter = ScriptedAdapter::new(Provider::OpenAi, Vec::new());
    let orchestrator = orchestrator(pool_of(&["c1"]), &adapter, OrchestratorConfig::default());

    let (events, finished) = run(&orchestrator, weather_request("gpt-4"), false).await;

    assert_eq!(events.len(), 1);
    assert!(matches!(
        &events[0],
        OutputEvent::Finished(ExchangeStatus::Failed { error })
            if error.kind == BrokerErrorKind::NoEligibleCredential
    ));
    assert_eq!(
        failure_kind(&finished.status),
        Some(BrokerErrorKind::NoEligibleCredential)
    );
    assert!(adapter.seen().is_empty());
    assert!(finished.credential_id.is_none());
}

#[tokio::test]
async fn given_invalid_request_when_chatting_then_no_upstream_turn_is_started() {
    let adapter = ScriptedAdapter::new(Provider::OpenAi, Vec::new());
    let orchestrator = orchestrator(pool_of(&["c1"]), &adapter, OrchestratorConfig::default());
    let mut request = weather_request("gpt-3.5-turbo");
    request.messages.clear();

    let (_, finished) = run(&orchestrator, request, false).await;

    assert_eq!(
        failure_kind(&finished.status),
        Some(BrokerErrorKind::InvalidRequest)
    );
    assert!(adapter.seen().is_empty());
}

#[tokio::test]
async fn given_weather_function_call_when_chatting_then_result_feeds_second_turn() {
    let adapter = ScriptedAdapter::new(
        Provider::OpenAi,
        vec![
            Script::Events(vec![call("search_weather", WEATHER_ARGS), call_done()]),
            Script::Events(vec![text("Beijing is "), text("sunny."), done()]),
        ],
    );
    let orchestrator = orchestrator(pool_of(&["c1"]), &adapter, OrchestratorConfig::default());

    let (events, finished) = run(&orchestrator, weather_request("gpt-3.5-turbo"), false).await;

    assert_eq!(texts(&events), vec!["Beijing is ", "sunny."]);
    assert!(matches!(
        events.last(),
        Some(OutputEvent::Finished(ExchangeStatus::Completed {
            finish_reason: FinishReason::Stop
        }))
    ));
    assert!(
        !events
            .iter()
            .any(|event| matches!(event, OutputEvent::FunctionProgress(_))),
        "progress is only reported to debug sessions"
    );

    assert_eq!(finished.function_rounds, 1);
    assert_eq!(finished.credential_id.as_deref(), Some("c1"));
    assert_eq!(finished.usage.total_tokens, Some(15));

    let roles = finished
        .messages
        .iter()
        .map(|message| message.role)
        .collect::<Vec<_>>();
    assert_eq!(
        roles,
        vec![
            Role::System,
            Role::User,
            Role::Assistant,
            Role::Function,
            Role::Assistant
        ]
    );
    let assistant_call = finished.messages[2]
        .function_call
        .as_ref()
        .expect("assistant message should carry the call");
    assert_eq!(assistant_call.name, "search_weather");
    assert!(assistant_call.id.starts_with("call_"));
    assert_eq!(
        finished.messages[3].call_id.as_deref(),
        Some(assistant_call.id.as_str())
    );
    assert!(finished.messages[3].content.to_text().contains("sunny"));
    assert_eq!(finished.messages[4].content.to_text(), "Beijing is sunny.");

    let new_roles = finished
        .new_messages()
        .map(|message| message.role)
        .collect::<Vec<_>>();
    assert_eq!(
        new_roles,
        vec![Role::User, Role::Assistant, Role::Function, Role::Assistant]
    );

    let seen = adapter.seen();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].request.functions[0].name, "search_weather");
    assert_eq!(seen[1].request.messages.len(), 4);
    assert_eq!(
        seen[1].request.messages.last().map(|message| message.role),
        Some(Role::Function)
    );
}

#[tokio::test]
async fn given_unknown_function_when_chatting_then_error_result_lets_model_recover() {
    let adapter = ScriptedAdapter::new(
        Provider::OpenAi,
        vec![
            Script::Events(vec![call("search_stock", "{}"), call_done()]),
            Script::Events(vec![text("I cannot look that up."), done()]),
        ],
    );
    let orchestrator = orchestrator(pool_of(&["c1"]), &adapter, OrchestratorConfig::default());

    let (_, finished) = run(&orchestrator, weather_request("gpt-3.5-turbo"), false).await;

    assert!(finished.status.is_completed());
    let function_message = finished
        .messages
        .iter()
        .find(|message| message.role == Role::Function)
        .expect("function result should be recorded");
    assert_eq!(function_message.name.as_deref(), Some("search_stock"));
    assert!(function_message.content.to_text().contains("error"));
}

#[tokio::test]
async fn given_model_keeps_calling_functions_when_cap_is_reached_then_exchange_fails() {
    let adapter = ScriptedAdapter::new(
        Provider::OpenAi,
        vec![
            Script::Events(vec![call("search_weather", WEATHER_ARGS), call_done()]),
            Script::Events(vec![call("search_weather", WEATHER_ARGS), call_done()]),
        ],
    );
    let config = OrchestratorConfig {
        max_function_rounds: 1,
        ..OrchestratorConfig::default()
    };
    let orchestrator = orchestrator(pool_of(&["c1"]), &adapter, config);

    let (_, finished) = run(&orchestrator, weather_request("gpt-3.5-turbo"), false).await;

    assert_eq!(
        failure_kind(&finished.status),
        Some(BrokerErrorKind::FunctionLoopExceeded)
    );
    assert_eq!(finished.function_rounds, 1);
    assert_eq!(adapter.seen().len(), 2);
}

#[tokio::test]
async fn given_rejected_credential_before_output_when_chatting_then_another_is_tried_once() {
    let adapter = ScriptedAdapter::new(
        Provider::OpenAi,
        vec![
            Script::Events(vec![failed(BrokerErrorKind::Authentication)]),
            Script::Events(vec![text("Hello"), done()]),
        ],
    );
    let pool = pool_of(&["c1", "c2"]);
    let prober = HealthProber::start(
        Arc::clone(&pool),
        adapter.registry(),
        &ProberConfig::default(),
    );
    let orchestrator = Arc::new(
        ChatOrchestrator::new(
            Arc::clone(&pool),
            adapter.registry(),
            OrchestratorConfig::default(),
        )
        .with_prober(prober.handle()),
    );

    let (events, finished) = run(&orchestrator, weather_request("gpt-3.5-turbo"), false).await;

    assert_eq!(texts(&events), vec!["Hello"]);
    assert!(finished.status.is_completed());
    let seen = adapter.seen();
    assert_eq!(seen.len(), 2);
    assert_ne!(seen[0].credential_id, seen[1].credential_id);
    assert_eq!(
        finished.credential_id.as_deref(),
        Some(seen[1].credential_id.as_str())
    );

    let probed = tokio::time::timeout(Duration::from_secs(2), async {
        while adapter.probes.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(probed.is_ok(), "rejected credential should be queued for a probe");
    prober.shutdown().await;
}

#[tokio::test]
async fn given_exhausted_quota_during_chat_when_reselecting_then_credential_is_queued_for_check() {
    let adapter = ScriptedAdapter::new(
        Provider::OpenAi,
        vec![
            Script::Events(vec![ChatEvent::Failed(BrokerError::new(
                BrokerErrorKind::RateLimited,
                "insufficient_quota: You exceeded your current quota",
            ))]),
            Script::Events(vec![text("Hello"), done()]),
        ],
    );
    let pool = pool_of(&["c1", "c2"]);
    let prober = HealthProber::start(
        Arc::clone(&pool),
        adapter.registry(),
        &ProberConfig::default(),
    );
    let orchestrator = Arc::new(
        ChatOrchestrator::new(
            Arc::clone(&pool),
            adapter.registry(),
            OrchestratorConfig::default(),
        )
        .with_prober(prober.handle()),
    );

    let (_, finished) = run(&orchestrator, weather_request("gpt-3.5-turbo"), false).await;

    assert!(finished.status.is_completed());
    assert_eq!(adapter.seen().len(), 2);
    let probed = tokio::time::timeout(Duration::from_secs(2), async {
        while adapter.probes.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(probed.is_ok(), "quota-exhausted credential should be queued for a probe");
    prober.shutdown().await;
}

#[tokio::test]
async fn given_plain_rate_limit_during_chat_when_reselecting_then_no_check_is_queued() {
    let adapter = ScriptedAdapter::new(
        Provider::OpenAi,
        vec![
            Script::Events(vec![failed(BrokerErrorKind::RateLimited)]),
            Script::Events(vec![text("Hello"), done()]),
        ],
    );
    let pool = pool_of(&["c1", "c2"]);
    let prober = HealthProber::start(
        Arc::clone(&pool),
        adapter.registry(),
        &ProberConfig::default(),
    );
    let orchestrator = Arc::new(
        ChatOrchestrator::new(
            Arc::clone(&pool),
            adapter.registry(),
            OrchestratorConfig::default(),
        )
        .with_prober(prober.handle()),
    );

    let (_, finished) = run(&orchestrator, weather_request("gpt-3.5-turbo"), false).await;

    assert!(finished.status.is_completed());
    prober.shutdown().await;
    assert_eq!(adapter.probes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn given_every_credential_rejected_when_chatting_then_reselection_happens_only_once() {
    let adapter = ScriptedAdapter::new(
        Provider::OpenAi,
        vec![
            Script::Events(vec![failed(BrokerErrorKind::RateLimited)]),
            Script::Events(vec![failed(BrokerErrorKind::RateLimited)]),
            Script::Events(vec![text("never reached"), done()]),
        ],
    );
    let orchestrator = orchestrator(
        pool_of(&["c1", "c2", "c3"]),
        &adapter,
        OrchestratorConfig::default(),
    );

    let (_, finished) = run(&orchestrator, weather_request("gpt-3.5-turbo"), false).await;

    let error = finished.status.error().expect("exchange should fail");
    assert_eq!(error.kind, BrokerErrorKind::RateLimited);
    let seen = adapter.seen();
    assert_eq!(seen.len(), 2);
    assert_eq!(error.credential_id.as_deref(), Some(seen[1].credential_id.as_str()));
}

#[tokio::test]
async fn given_text_already_streamed_when_credential_fails_then_no_reselection_happens() {
    let adapter = ScriptedAdapter::new(
        Provider::OpenAi,
        vec![
            Script::Events(vec![text("Beijing"), failed(BrokerErrorKind::RateLimited)]),
            Script::Events(vec![text("retry"), done()]),
        ],
    );
    let orchestrator = orchestrator(
        pool_of(&["c1", "c2"]),
        &adapter,
        OrchestratorConfig::default(),
    );

    let (events, finished) = run(&orchestrator, weather_request("gpt-3.5-turbo"), false).await;

    assert_eq!(texts(&events), vec!["Beijing"]);
    assert_eq!(
        failure_kind(&finished.status),
        Some(BrokerErrorKind::RateLimited)
    );
    assert_eq!(adapter.seen().len(), 1);
    let last = finished.messages.last().expect("partial reply is kept");
    assert_eq!(last.role, Role::Assistant);
    assert_eq!(last.content.to_text(), "Beijing");
}

#[tokio::test]
async fn given_reselection_disabled_when_credential_fails_then_error_is_returned() {
    let adapter = ScriptedAdapter::new(
        Provider::OpenAi,
        vec![
            Script::Events(vec![failed(BrokerErrorKind::Authentication)]),
            Script::Events(vec![text("unused"), done()]),
        ],
    );
    let config = OrchestratorConfig {
        reselect_on_credential_failure: false,
        ..OrchestratorConfig::default()
    };
    let orchestrator = orchestrator(pool_of(&["c1", "c2"]), &adapter, config);

    let (_, finished) = run(&orchestrator, weather_request("gpt-3.5-turbo"), false).await;

    assert_eq!(
        failure_kind(&finished.status),
        Some(BrokerErrorKind::Authentication)
    );
    assert_eq!(adapter.seen().len(), 1);
}

#[tokio::test]
async fn given_caller_drops_stream_mid_reply_when_chatting_then_upstream_is_released() {
    let adapter = ScriptedAdapter::new(
        Provider::OpenAi,
        vec![Script::Hang(vec![text("one "), text("two "), text("three")])],
    );
    let orchestrator = orchestrator(pool_of(&["c1"]), &adapter, OrchestratorConfig::default());
    let (on_finish, finished) = recording_finish();

    let mut stream = orchestrator.chat_stream(weather_request("gpt-3.5-turbo"), on_finish, false);
    let mut received = Vec::new();
    while received.len() < 3 {
        match tokio::time::timeout(Duration::from_secs(2), stream.next()).await {
            Ok(Some(OutputEvent::Text(text))) => received.push(text),
            other => panic!("unexpected output: {other:?}"),
        }
    }
    drop(stream);

    let settled = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let recorded = !finished.lock().expect("finish lock").is_empty();
            if recorded && adapter.upstream_released.load(Ordering::SeqCst) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(settled.is_ok(), "exchange should wind down after disconnect");

    let finished = single_finish(&finished);
    assert_eq!(
        failure_kind(&finished.status),
        Some(BrokerErrorKind::Cancelled)
    );
    assert_eq!(
        finished
            .messages
            .last()
            .map(|message| message.content.to_text()),
        Some("one two three".to_string())
    );
}

#[tokio::test]
async fn given_debug_session_when_function_runs_then_progress_precedes_reply_text() {
    let adapter = ScriptedAdapter::new(
        Provider::OpenAi,
        vec![
            Script::Events(vec![call("search_weather", WEATHER_ARGS), call_done()]),
            Script::Events(vec![text("Sunny."), done()]),
        ],
    );
    let orchestrator = orchestrator(pool_of(&["c1"]), &adapter, OrchestratorConfig::default());

    let (events, _) = run(&orchestrator, weather_request("gpt-3.5-turbo"), true).await;

    assert_eq!(events.len(), 4);
    assert!(matches!(
        &events[0],
        OutputEvent::FunctionProgress(FunctionProgress::Invoking { name, arguments })
            if name == "search_weather" && arguments == WEATHER_ARGS
    ));
    assert!(matches!(
        &events[1],
        OutputEvent::FunctionProgress(FunctionProgress::Succeeded { name }) if name == "search_weather"
    ));
    assert!(matches!(&events[2], OutputEvent::Text(text) if text == "Sunny."));
    assert!(matches!(&events[3], OutputEvent::Finished(status) if status.is_completed()));
}
