use std::{sync::Arc, time::Duration};

use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::broker::{
    adapters::{AdapterRegistry, ProviderAdapter},
    error::{BrokerError, internal_error},
    pool::CredentialPool,
    telemetry::{BrokerTelemetryEvent, emit_broker_event},
    types::{
        Credential, CredentialStatus, DisableReason, ProbeOutcome, ProberConfig, Provider,
        UsageCheckTask,
    },
};

type TaskQueue = Arc<Mutex<mpsc::UnboundedReceiver<UsageCheckTask>>>;

/// Background validation of credentials. Owns the worker tasks; hand out
/// [`ProberHandle`]s to enqueue work.
pub struct HealthProber {
    handle: ProberHandle,
    workers: Vec<JoinHandle<()>>,
}

#[derive(Clone)]
pub struct ProberHandle {
    sender: mpsc::UnboundedSender<UsageCheckTask>,
    pool: Arc<CredentialPool>,
    registry: AdapterRegistry,
    probe_timeout: Duration,
    bulk_limit: usize,
    shutdown: CancellationToken,
}

impl HealthProber {
    pub fn start(
        pool: Arc<CredentialPool>,
        registry: AdapterRegistry,
        config: &ProberConfig,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let queue: TaskQueue = Arc::new(Mutex::new(receiver));
        let shutdown = CancellationToken::new();
        let probe_timeout = Duration::from_millis(config.probe_timeout_ms);

        let workers = (0..config.workers.max(1))
            .map(|worker_id| {
                let queue = Arc::clone(&queue);
                let pool = Arc::clone(&pool);
                let registry = registry.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    run_worker(worker_id, queue, pool, registry, probe_timeout, shutdown).await
                })
            })
            .collect::<Vec<_>>();

        tracing::info!(
            target: "broker",
            workers = workers.len(),
            probe_timeout_ms = config.probe_timeout_ms,
            bulk_limit = config.bulk_limit,
            "prober_started"
        );

        Self {
            handle: ProberHandle {
                sender,
                pool,
                registry,
                probe_timeout,
                bulk_limit: config.bulk_limit,
                shutdown,
            },
            workers,
        }
    }

    pub fn handle(&self) -> ProberHandle {
        self.handle.clone()
    }

    /// Stops the workers after their in-flight probe and waits for them.
    pub async fn shutdown(self) {
        self.handle.shutdown.cancel();
        for worker in self.workers {
            if let Err(err) = worker.await {
                tracing::warn!(target: "broker", error = %err, "prober_worker_join_failed");
            }
        }
        tracing::info!(target: "broker", "prober_stopped");
    }
}

impl ProberHandle {
    /// Never blocks; fails only once the prober has shut down.
    pub fn enqueue(&self, task: UsageCheckTask) -> Result<(), BrokerError> {
        if self.shutdown.is_cancelled() {
            return Err(internal_error("health prober has shut down"));
        }
        let credential_id = task.credential_id.clone();
        self.sender
            .send(task)
            .map_err(|_| internal_error("health prober has shut down"))?;
        tracing::debug!(
            target: "broker",
            credential_id = %credential_id,
            "probe_task_enqueued"
        );
        Ok(())
    }

    /// Queues every enabled credential of `provider`, up to the bulk limit.
    pub fn enqueue_all(&self, provider: Provider) -> Result<usize, BrokerError> {
        let tasks = self
            .pool
            .snapshot(provider)
            .into_iter()
            .filter(|credential| credential.status.is_enabled())
            .take(self.bulk_limit)
            .map(|credential| credential.usage_check_task())
            .collect::<Vec<_>>();

        let count = tasks.len();
        for task in tasks {
            self.enqueue(task)?;
        }
        tracing::info!(
            target: "broker",
            provider = %provider,
            enqueued = count,
            "probe_bulk_enqueued"
        );
        Ok(count)
    }

    /// Probes an arbitrary key right away without touching the pool.
    pub async fn check_now(
        &self,
        provider: Provider,
        key: &str,
        host: &str,
    ) -> Result<ProbeOutcome, BrokerError> {
        let adapter = self.registry.get(provider)?;
        Ok(run_probe(adapter.as_ref(), key, host, self.probe_timeout).await)
    }
}

async fn run_worker(
    worker_id: usize,
    queue: TaskQueue,
    pool: Arc<CredentialPool>,
    registry: AdapterRegistry,
    probe_timeout: Duration,
    shutdown: CancellationToken,
) {
    loop {
        let next = {
            let mut receiver = tokio::select! {
                _ = shutdown.cancelled() => break,
                receiver = queue.lock() => receiver,
            };
            tokio::select! {
                _ = shutdown.cancelled() => break,
                task = receiver.recv() => task,
            }
        };

        let Some(task) = next else {
            break;
        };
        process_task(&pool, &registry, probe_timeout, task).await;
    }
    tracing::debug!(target: "broker", worker_id = worker_id, "prober_worker_exited");
}

async fn process_task(
    pool: &CredentialPool,
    registry: &AdapterRegistry,
    probe_timeout: Duration,
    task: UsageCheckTask,
) {
    if current_version(pool, &task).is_none() {
        tracing::debug!(
            target: "broker",
            credential_id = %task.credential_id,
            "probe_task_stale"
        );
        return;
    }

    let adapter = match registry.get(task.provider) {
        Ok(adapter) => adapter,
        Err(err) => {
            tracing::warn!(
                target: "broker",
                credential_id = %task.credential_id,
                error = %err,
                "probe_skipped"
            );
            return;
        }
    };

    let outcome = run_probe(adapter.as_ref(), &task.key, &task.host, probe_timeout).await;

    // The credential may have been replaced while the probe was in flight.
    let Some(current) = current_version(pool, &task) else {
        tracing::debug!(
            target: "broker",
            credential_id = %task.credential_id,
            "probe_task_stale"
        );
        return;
    };

    let status_before = current.status;
    let next = next_status(status_before, &outcome);
    let status_after = if next == status_before {
        Some(status_before)
    } else {
        // Only applies if no put or remove landed since `current` was read.
        let applied = pool.set_status_if(&current, next);
        if applied.is_none() {
            tracing::debug!(
                target: "broker",
                credential_id = %task.credential_id,
                "probe_result_superseded"
            );
        }
        applied.map(|credential| credential.status)
    };

    if let ProbeOutcome::Transient { detail } = &outcome {
        tracing::debug!(
            target: "broker",
            credential_id = %task.credential_id,
            detail = %detail,
            "probe_transient"
        );
    }

    emit_broker_event(BrokerTelemetryEvent::ProbeFinished {
        credential_id: task.credential_id,
        outcome: outcome_label(&outcome),
        status_before: Some(status_before),
        status_after,
    });
}

async fn run_probe(
    adapter: &dyn ProviderAdapter,
    key: &str,
    host: &str,
    probe_timeout: Duration,
) -> ProbeOutcome {
    tokio::time::timeout(probe_timeout, adapter.probe_quota(key, host))
        .await
        .unwrap_or_else(|_| ProbeOutcome::Transient {
            detail: format!("probe timed out after {} ms", probe_timeout.as_millis()),
        })
}

/// The pool's current version of the probed credential, if the task still describes it.
fn current_version(pool: &CredentialPool, task: &UsageCheckTask) -> Option<Arc<Credential>> {
    pool.get(&task.credential_id).filter(|credential| {
        credential.provider == task.provider
            && credential.key == task.key
            && credential.host == task.host
    })
}

/// Status a credential should move to after a probe. Admin decisions always stand.
pub fn next_status(current: CredentialStatus, outcome: &ProbeOutcome) -> CredentialStatus {
    if current == CredentialStatus::Disabled(DisableReason::Admin) {
        return current;
    }
    match outcome {
        ProbeOutcome::Healthy { .. } => match current {
            CredentialStatus::Disabled(DisableReason::QuotaExhausted) => CredentialStatus::Enabled,
            other => other,
        },
        ProbeOutcome::Exhausted { .. } => {
            CredentialStatus::Disabled(DisableReason::QuotaExhausted)
        }
        ProbeOutcome::Invalid { .. } => CredentialStatus::Disabled(DisableReason::AuthRejected),
        ProbeOutcome::Transient { .. } => current,
    }
}

fn outcome_label(outcome: &ProbeOutcome) -> &'static str {
    match outcome {
        ProbeOutcome::Healthy { .. } => "healthy",
        ProbeOutcome::Exhausted { .. } => "exhausted",
        ProbeOutcome::Invalid { .. } => "invalid",
        ProbeOutcome::Transient { .. } => "transient",
    }
}
