use std::time::Duration;

use futures_util::StreamExt;
use reqwest::{Client, RequestBuilder, Response};
use tokio::{sync::mpsc, time::timeout};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::broker::{
    error::{BrokerError, BrokerErrorKind, internal_error},
    types::{AdapterContext, ProbeOutcome},
    types_chat::{ChatEvent, ChatEventStream},
};

const EVENT_CHANNEL_CAPACITY: usize = 64;
const ERROR_BODY_LIMIT: usize = 240;

pub fn build_client(connect_timeout: Duration) -> Result<Client, BrokerError> {
    Client::builder()
        .connect_timeout(connect_timeout)
        .pool_idle_timeout(Duration::from_secs(30))
        .build()
        .map_err(|err| internal_error(format!("failed to build http client: {}", err)))
}

/// Joins a credential host with an API path, tolerating hosts that already end in `/v1`.
pub fn endpoint(host: &str, path: &str) -> String {
    let base = host.trim().trim_end_matches('/');
    let path = path.trim_start_matches('/');
    match (base.ends_with("/v1"), path.strip_prefix("v1/")) {
        (true, Some(rest)) => format!("{}/{}", base, rest),
        _ => format!("{}/{}", base, path),
    }
}

pub fn map_http_error(status: u16, credential_id: &str, body: &str) -> BrokerError {
    let normalized_body = body.chars().take(ERROR_BODY_LIMIT).collect::<String>();

    let kind = match status {
        401 | 403 => BrokerErrorKind::Authentication,
        429 => BrokerErrorKind::RateLimited,
        404 => BrokerErrorKind::ModelUnavailable,
        408 | 504 => BrokerErrorKind::UpstreamTimeout,
        529 => BrokerErrorKind::RateLimited,
        400..=499 if body.contains("model_not_found") => BrokerErrorKind::ModelUnavailable,
        400..=499 => BrokerErrorKind::InvalidRequest,
        _ => BrokerErrorKind::UpstreamUnavailable,
    };

    let summary = if status == 429 && body.contains("insufficient_quota") {
        format!("upstream returned status {} (insufficient_quota)", status)
    } else {
        format!("upstream returned status {}", status)
    };
    let mut err = BrokerError::new(kind, summary)
        .with_credential_id(credential_id)
        .with_provider_http_status(status);
    if !normalized_body.is_empty() {
        err.message = format!("{}: {}", err.message, normalized_body);
    }
    err
}

pub fn map_transport_error(err: &reqwest::Error, credential_id: &str) -> BrokerError {
    let kind = if err.is_timeout() {
        BrokerErrorKind::UpstreamTimeout
    } else if err.is_decode() || err.is_body() {
        BrokerErrorKind::UpstreamProtocol
    } else {
        BrokerErrorKind::UpstreamUnavailable
    };
    BrokerError::new(kind, format!("upstream request failed: {}", err))
        .with_credential_id(credential_id)
}

/// Splits a byte stream into complete lines; a trailing partial line stays buffered.
///
/// Lines are decoded only once complete, so a character split across chunks survives.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<String>, BrokerError> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(idx) = self.pending.iter().position(|byte| *byte == b'\n') {
            let raw = self.pending.drain(..=idx).collect::<Vec<_>>();
            lines.push(decode_line(&raw[..idx])?);
        }
        Ok(lines)
    }

    pub fn finish(&mut self) -> Result<Option<String>, BrokerError> {
        let rest = std::mem::take(&mut self.pending);
        let line = decode_line(&rest)?;
        Ok((!line.is_empty()).then_some(line))
    }
}

fn decode_line(raw: &[u8]) -> Result<String, BrokerError> {
    let line = std::str::from_utf8(raw).map_err(|err| {
        BrokerError::new(
            BrokerErrorKind::UpstreamProtocol,
            format!("stream line is not valid utf-8: {}", err),
        )
    })?;
    Ok(line.trim_end_matches('\r').to_string())
}

/// Payload of an SSE `data:` line, or `None` for comments, event names and blank lines.
pub fn sse_data(line: &str) -> Option<&str> {
    let data = line.strip_prefix("data:")?.trim();
    (!data.is_empty()).then_some(data)
}

/// Provider-specific decoding of SSE `data:` payloads into chat events.
pub trait SseDecoder: Send + 'static {
    fn decode(&mut self, data: &str) -> Vec<ChatEvent>;
    /// Called once the body ends; must yield the terminal event if none was produced.
    fn finish(&mut self) -> Vec<ChatEvent>;
}

/// Sends the request and pumps decoded events into a channel on a dedicated task.
///
/// The task stops as soon as the receiver is dropped or `ctx.cancel` fires, dropping the
/// upstream response with it. Header and per-chunk waits are bounded by the context's
/// response and read timeouts.
pub fn spawn_sse_stream(
    ctx: AdapterContext,
    request: RequestBuilder,
    decoder: impl SseDecoder,
) -> ChatEventStream {
    let (tx, rx) = mpsc::channel::<ChatEvent>(EVENT_CHANNEL_CAPACITY);
    tokio::spawn(pump_sse(ctx, request, decoder, tx));
    Box::pin(ReceiverStream::new(rx))
}

pub fn failed_stream(error: BrokerError) -> ChatEventStream {
    Box::pin(tokio_stream::iter(vec![ChatEvent::Failed(error)]))
}

async fn pump_sse(
    ctx: AdapterContext,
    request: RequestBuilder,
    mut decoder: impl SseDecoder,
    tx: mpsc::Sender<ChatEvent>,
) {
    let credential_id = ctx.credential.id.clone();
    let cancel = ctx.cancel.clone();

    let response = tokio::select! {
        _ = cancel.cancelled() => return,
        _ = tx.closed() => return,
        sent = timeout(ctx.response_timeout, request.send()) => sent,
    };

    let response = match response {
        Err(_) => {
            let _ = tx
                .send(ChatEvent::Failed(
                    BrokerError::new(
                        BrokerErrorKind::UpstreamTimeout,
                        format!(
                            "no response headers within {} ms",
                            ctx.response_timeout.as_millis()
                        ),
                    )
                    .with_credential_id(credential_id),
                ))
                .await;
            return;
        }
        Ok(Err(err)) => {
            let _ = tx
                .send(ChatEvent::Failed(map_transport_error(&err, &credential_id)))
                .await;
            return;
        }
        Ok(Ok(response)) => response,
    };

    if !response.status().is_success() {
        let status = response.status().as_u16();
        let body = read_error_body(response, &cancel, ctx.read_timeout).await;
        let _ = tx
            .send(ChatEvent::Failed(map_http_error(status, &credential_id, &body)))
            .await;
        return;
    }

    let mut body = response.bytes_stream();
    let mut lines = LineBuffer::default();

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tx.closed() => return,
            next = timeout(ctx.read_timeout, body.next()) => next,
        };

        let chunk = match next {
            Err(_) => {
                let _ = tx
                    .send(ChatEvent::Failed(
                        BrokerError::new(
                            BrokerErrorKind::UpstreamTimeout,
                            format!("no stream data within {} ms", ctx.read_timeout.as_millis()),
                        )
                        .with_credential_id(credential_id),
                    ))
                    .await;
                return;
            }
            Ok(None) => break,
            Ok(Some(Err(err))) => {
                let _ = tx
                    .send(ChatEvent::Failed(map_transport_error(&err, &credential_id)))
                    .await;
                return;
            }
            Ok(Some(Ok(chunk))) => chunk,
        };

        let decoded = match lines.push(&chunk) {
            Ok(decoded) => decoded,
            Err(err) => {
                let _ = tx
                    .send(ChatEvent::Failed(err.with_credential_id(credential_id)))
                    .await;
                return;
            }
        };
        for line in decoded {
            let Some(data) = sse_data(&line) else {
                continue;
            };
            if forward(&tx, decoder.decode(data)).await {
                return;
            }
        }
    }

    match lines.finish() {
        Ok(Some(line)) => {
            if let Some(data) = sse_data(&line)
                && forward(&tx, decoder.decode(data)).await
            {
                return;
            }
        }
        Ok(None) => {}
        Err(err) => {
            let _ = tx
                .send(ChatEvent::Failed(err.with_credential_id(credential_id)))
                .await;
            return;
        }
    }
    forward(&tx, decoder.finish()).await;
}

/// Returns `true` once a terminal event was sent or the receiver is gone.
async fn forward(tx: &mpsc::Sender<ChatEvent>, events: Vec<ChatEvent>) -> bool {
    for event in events {
        let terminal = event.is_terminal();
        if tx.send(event).await.is_err() || terminal {
            return true;
        }
    }
    false
}

async fn read_error_body(
    response: Response,
    cancel: &CancellationToken,
    read_timeout: Duration,
) -> String {
    tokio::select! {
        _ = cancel.cancelled() => String::new(),
        body = timeout(read_timeout, response.text()) => match body {
            Ok(Ok(text)) => text,
            _ => String::new(),
        },
    }
}

/// Shared classification for account queries.
pub fn probe_outcome_for_status(status: u16, body: &str) -> ProbeOutcome {
    let detail = body.chars().take(ERROR_BODY_LIMIT).collect::<String>();
    match status {
        200..=299 => ProbeOutcome::Healthy { remaining: None },
        401 | 403 => ProbeOutcome::Invalid { detail },
        402 => ProbeOutcome::Exhausted { detail },
        429 if body.contains("insufficient_quota") => ProbeOutcome::Exhausted { detail },
        _ => ProbeOutcome::Transient {
            detail: format!("status {}: {}", status, detail),
        },
    }
}
