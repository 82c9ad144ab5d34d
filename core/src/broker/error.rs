use std::fmt;

use serde::{Deserialize, Serialize};

use crate::broker::types::CredentialId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerErrorKind {
    InvalidRequest,
    NoEligibleCredential,
    Authentication,
    RateLimited,
    ModelUnavailable,
    UpstreamTimeout,
    UpstreamProtocol,
    UpstreamUnavailable,
    FunctionLoopExceeded,
    Cancelled,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerError {
    pub kind: BrokerErrorKind,
    pub message: String,
    pub credential_id: Option<CredentialId>,
    pub provider_http_status: Option<u16>,
}

impl BrokerError {
    pub fn new(kind: BrokerErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            credential_id: None,
            provider_http_status: None,
        }
    }

    pub fn with_credential_id(mut self, credential_id: impl Into<String>) -> Self {
        self.credential_id = Some(credential_id.into());
        self
    }

    pub fn with_provider_http_status(mut self, status: u16) -> Self {
        self.provider_http_status = Some(status);
        self
    }

    /// Upstream failures caused by the credential itself rather than the request.
    pub fn is_credential_failure(&self) -> bool {
        matches!(
            self.kind,
            BrokerErrorKind::Authentication | BrokerErrorKind::RateLimited
        )
    }

    /// Rate-limit failures the provider attributes to an exhausted account balance.
    pub fn is_quota_exhausted(&self) -> bool {
        self.kind == BrokerErrorKind::RateLimited && self.message.contains("insufficient_quota")
    }

    pub fn is_service_unavailable(&self) -> bool {
        matches!(self.kind, BrokerErrorKind::NoEligibleCredential)
    }
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.credential_id, self.provider_http_status) {
            (Some(credential_id), Some(status)) => write!(
                f,
                "{} (credential={}, status={})",
                self.message, credential_id, status
            ),
            (Some(credential_id), None) => {
                write!(f, "{} (credential={})", self.message, credential_id)
            }
            (None, Some(status)) => write!(f, "{} (status={})", self.message, status),
            (None, None) => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for BrokerError {}

pub fn invalid_request(message: impl Into<String>) -> BrokerError {
    BrokerError::new(BrokerErrorKind::InvalidRequest, message)
}

pub fn protocol_violation(message: impl Into<String>) -> BrokerError {
    BrokerError::new(BrokerErrorKind::UpstreamProtocol, message)
}

pub fn internal_error(message: impl Into<String>) -> BrokerError {
    BrokerError::new(BrokerErrorKind::Internal, message)
}
