use crate::broker::{
    error::BrokerErrorKind,
    types::{CredentialId, CredentialStatus, Provider, RequestId},
    types_chat::UsageStats,
};

#[derive(Debug, Clone)]
pub enum BrokerTelemetryEvent {
    ExchangeStarted {
        request_id: RequestId,
        provider: Provider,
        model: String,
        user_id: Option<String>,
    },
    CredentialSelected {
        request_id: RequestId,
        credential_id: CredentialId,
        reselection: bool,
    },
    CredentialFailed {
        request_id: RequestId,
        credential_id: CredentialId,
        kind: BrokerErrorKind,
    },
    FunctionInvoked {
        request_id: RequestId,
        round: u32,
        name: String,
        ok: bool,
    },
    ExchangeCompleted {
        request_id: RequestId,
        function_rounds: u32,
        usage: UsageStats,
    },
    ExchangeFailed {
        request_id: RequestId,
        function_rounds: u32,
        error_kind: BrokerErrorKind,
    },
    ProbeFinished {
        credential_id: CredentialId,
        outcome: &'static str,
        status_before: Option<CredentialStatus>,
        status_after: Option<CredentialStatus>,
    },
}

pub fn emit_broker_event(event: BrokerTelemetryEvent) {
    match event {
        BrokerTelemetryEvent::ExchangeStarted {
            request_id,
            provider,
            model,
            user_id,
        } => {
            tracing::info!(
                target: "broker",
                request_id = %request_id,
                provider = %provider,
                model = %model,
                user_id = user_id.as_deref().unwrap_or("-"),
                "exchange_started"
            );
        }
        BrokerTelemetryEvent::CredentialSelected {
            request_id,
            credential_id,
            reselection,
        } => {
            tracing::debug!(
                target: "broker",
                request_id = %request_id,
                credential_id = %credential_id,
                reselection = reselection,
                "credential_selected"
            );
        }
        BrokerTelemetryEvent::CredentialFailed {
            request_id,
            credential_id,
            kind,
        } => {
            tracing::warn!(
                target: "broker",
                request_id = %request_id,
                credential_id = %credential_id,
                kind = ?kind,
                "credential_failed"
            );
        }
        BrokerTelemetryEvent::FunctionInvoked {
            request_id,
            round,
            name,
            ok,
        } => {
            tracing::info!(
                target: "broker",
                request_id = %request_id,
                round = round,
                function = %name,
                ok = ok,
                "function_invoked"
            );
        }
        BrokerTelemetryEvent::ExchangeCompleted {
            request_id,
            function_rounds,
            usage,
        } => {
            tracing::info!(
                target: "broker",
                request_id = %request_id,
                function_rounds = function_rounds,
                input_tokens = ?usage.input_tokens,
                output_tokens = ?usage.output_tokens,
                total_tokens = ?usage.total_tokens,
                "exchange_completed"
            );
        }
        BrokerTelemetryEvent::ExchangeFailed {
            request_id,
            function_rounds,
            error_kind,
        } => {
            tracing::warn!(
                target: "broker",
                request_id = %request_id,
                function_rounds = function_rounds,
                error_kind = ?error_kind,
                "exchange_failed"
            );
        }
        BrokerTelemetryEvent::ProbeFinished {
            credential_id,
            outcome,
            status_before,
            status_after,
        } => {
            if status_before != status_after {
                tracing::warn!(
                    target: "broker",
                    credential_id = %credential_id,
                    outcome = outcome,
                    status_before = ?status_before,
                    status_after = ?status_after,
                    "credential_status_changed"
                );
            } else {
                tracing::debug!(
                    target: "broker",
                    credential_id = %credential_id,
                    outcome = outcome,
                    status = ?status_after,
                    "probe_finished"
                );
            }
        }
    }
}
