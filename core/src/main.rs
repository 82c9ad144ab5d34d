use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal::unix::{SignalKind, signal};

use chat_broker::{
    broker::{
        adapters::build_default_adapters, orchestrator::ChatOrchestrator, pool::CredentialPool,
        prober::HealthProber, types::Provider,
    },
    cli::args_from_env,
    config::Config,
    logging::init_tracing,
};

#[tokio::main]
async fn main() -> Result<()> {
    let args = args_from_env()?;
    let config = Config::load(&args.config_path)
        .with_context(|| format!("failed to load config from {}", args.config_path.display()))?;
    let logging_guard = init_tracing(&config.logging).context("failed to initialize logging")?;

    let broker_config = config.broker;
    let pool = Arc::new(
        CredentialPool::from_credentials(broker_config.credentials)
            .context("failed to seed credential pool")?,
    );
    let adapters =
        build_default_adapters(&broker_config.adapters).context("failed to build adapters")?;

    let prober = HealthProber::start(Arc::clone(&pool), adapters.clone(), &broker_config.prober);
    let orchestrator = Arc::new(
        ChatOrchestrator::new(
            Arc::clone(&pool),
            adapters,
            broker_config.orchestrator.clone(),
        )
        .with_prober(prober.handle()),
    );

    if args.revalidate || broker_config.prober.revalidate_on_start {
        let handle = prober.handle();
        for provider in Provider::ALL {
            let queued = handle
                .enqueue_all(provider)
                .with_context(|| format!("failed to queue {provider} credentials for probing"))?;
            tracing::info!(target: "broker", provider = %provider, queued = queued, "revalidation_queued");
        }
    }

    tracing::info!(
        target: "broker",
        run_id = logging_guard.run_id(),
        openai_credentials = orchestrator.pool().len(Provider::OpenAi),
        anthropic_credentials = orchestrator.pool().len(Provider::Anthropic),
        "broker_started"
    );

    let mut sigint =
        signal(SignalKind::interrupt()).context("unable to listen for SIGINT (Ctrl+C)")?;
    let mut sigterm = signal(SignalKind::terminate()).context("unable to listen for SIGTERM")?;

    let signal_name = tokio::select! {
        _ = sigint.recv() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
    };

    tracing::info!(target: "broker", signal = signal_name, "shutdown_requested");
    drop(orchestrator);
    prober.shutdown().await;
    tracing::info!(target: "broker", signal = signal_name, "broker_stopped");
    Ok(())
}
