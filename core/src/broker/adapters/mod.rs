use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;

use crate::broker::{
    error::{BrokerError, BrokerErrorKind},
    types::{AdapterConfig, AdapterContext, ProbeOutcome, Provider},
    types_chat::{ChatEventStream, ProviderRequest},
};

pub mod anthropic;
pub mod http_common;
pub mod openai;

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn provider(&self) -> Provider;

    /// Starts one streaming turn. The returned stream always ends with exactly one
    /// `Done` or `Failed` event unless the consumer drops it or `ctx.cancel` fires first.
    fn stream(&self, ctx: AdapterContext, request: ProviderRequest) -> ChatEventStream;

    /// Lightweight account query used by the health prober; never part of a chat.
    async fn probe_quota(&self, key: &str, host: &str) -> ProbeOutcome;
}

/// The only place a provider tag is turned into wire behaviour.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<Provider, Arc<dyn ProviderAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.provider(), adapter);
    }

    pub fn get(&self, provider: Provider) -> Result<Arc<dyn ProviderAdapter>, BrokerError> {
        self.adapters.get(&provider).cloned().ok_or_else(|| {
            BrokerError::new(
                BrokerErrorKind::Internal,
                format!("adapter for provider {} is not registered", provider),
            )
        })
    }
}

pub fn build_default_adapters(config: &AdapterConfig) -> Result<AdapterRegistry, BrokerError> {
    let mut registry = AdapterRegistry::new();
    registry.register(Arc::new(openai::OpenAiAdapter::new(config)?));
    registry.register(Arc::new(anthropic::AnthropicAdapter::new(config)?));
    Ok(registry)
}
