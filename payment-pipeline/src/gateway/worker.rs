//! Dispatcher and workers behind [`super::PaymentGatewayClient`].
//!
//! Each idle worker pushes its private job sender into the shared pool; the
//! dispatcher pairs the next queued job with the next advertised worker. A
//! worker re-advertises only after it finished its job, so a sender taken from
//! the pool always belongs to an idle worker.

use backoff::ExponentialBackoff;
use dashmap::DashSet;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use super::http::GatewayHttp;
use super::types::{GatewayCallback, GatewayError, GatewayReference, PaymentJob};
use crate::config::{GatewayConfig, OutcomeMode};
use crate::models::{map_external_status, PaymentStatus};

pub(crate) type WorkerSender = mpsc::Sender<PaymentJob>;

/// External ids of jobs that shutdown kept from settling.
pub(crate) type Abandoned = Arc<DashSet<String>>;

const SIMULATED_FAILURE_REASONS: &[&str] = &[
    "insufficient balance in disbursement account",
    "beneficiary bank rejected the transfer",
    "beneficiary account not found",
];

/// Settled result of one job, before it is turned into a callback.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Outcome {
    pub status: PaymentStatus,
    pub failure_reason: Option<String>,
}

impl Outcome {
    fn success() -> Self {
        Self {
            status: PaymentStatus::Success,
            failure_reason: None,
        }
    }

    fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: PaymentStatus::Failed,
            failure_reason: Some(reason.into()),
        }
    }
}

/// State shared by every worker.
pub(crate) struct WorkerContext {
    pub http: GatewayHttp,
    pub config: GatewayConfig,
    pub shutdown: CancellationToken,
    pub abandoned: Abandoned,
}

pub(crate) fn simulated_payment_id() -> String {
    format!("sim_{}", Uuid::new_v4().simple())
}

fn retry_policy(window: Duration) -> ExponentialBackoff {
    ExponentialBackoff {
        initial_interval: Duration::from_millis(200),
        max_interval: Duration::from_secs(5),
        max_elapsed_time: Some(window),
        ..Default::default()
    }
}

fn classify(e: GatewayError) -> backoff::Error<GatewayError> {
    if e.is_transient() {
        backoff::Error::transient(e)
    } else {
        backoff::Error::permanent(e)
    }
}

pub(crate) async fn run_dispatcher(
    mut jobs: mpsc::Receiver<PaymentJob>,
    mut pool: mpsc::Receiver<WorkerSender>,
    shutdown: CancellationToken,
    abandoned: Abandoned,
) {
    tracing::info!("Payment dispatcher started");

    loop {
        let job = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            job = jobs.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        let worker = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                drop_job(&abandoned, job, "Shutdown while waiting for a worker");
                break;
            }
            worker = pool.recv() => match worker {
                Some(worker) => worker,
                None => {
                    drop_job(&abandoned, job, "Worker pool closed");
                    break;
                }
            },
        };

        // Reserve first so a cancelled hand-off still owns the job.
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                drop_job(&abandoned, job, "Shutdown while handing job to worker");
                break;
            }
            permit = worker.reserve() => match permit {
                Ok(permit) => permit.send(job),
                Err(_) => drop_job(&abandoned, job, "Worker exited"),
            },
        }
    }

    jobs.close();
    while let Ok(job) = jobs.try_recv() {
        drop_job(&abandoned, job, "Shutdown before dispatch");
    }

    tracing::info!("Payment dispatcher stopped");
}

fn drop_job(abandoned: &Abandoned, job: PaymentJob, reason: &str) {
    tracing::warn!(external_id = %job.request.external_id, reason, "Payment job dropped");
    abandoned.insert(job.request.external_id);
}

pub(crate) struct Worker {
    pub id: usize,
    pub ctx: Arc<WorkerContext>,
    pub pool: mpsc::Sender<WorkerSender>,
}

impl Worker {
    pub async fn run(self) {
        let (job_tx, mut job_rx) = mpsc::channel::<PaymentJob>(1);
        let shutdown = self.ctx.shutdown.clone();

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                advertised = self.pool.send(job_tx.clone()) => {
                    if advertised.is_err() {
                        break;
                    }
                }
            }

            let job = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                job = job_rx.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            let span = tracing::info_span!(
                "payment_job",
                worker_id = self.id,
                external_id = %job.request.external_id,
            );
            self.process(job).instrument(span).await;
        }

        job_rx.close();
        while let Ok(job) = job_rx.try_recv() {
            drop_job(&self.ctx.abandoned, job, "Worker stopped before starting job");
        }

        tracing::debug!(worker_id = self.id, "Payment worker stopped");
    }

    async fn process(&self, job: PaymentJob) {
        tracing::info!(
            amount = job.request.amount,
            queued_ms = job.enqueued_at.elapsed().as_millis() as u64,
            "Processing payment job"
        );

        let (gateway_payment_id, outcome) = match self.resolve_reference(&job).await {
            Some(Ok(id)) => match self.await_outcome(&id, &job).await {
                Some(outcome) => (id, outcome),
                None => return self.abandon(&job),
            },
            Some(Err(e)) => (
                String::new(),
                Outcome::failed(format!("payment initiation failed: {e}")),
            ),
            None => return self.abandon(&job),
        };

        metrics::counter!("payment_jobs_processed_total", "outcome" => outcome.status.as_str())
            .increment(1);
        metrics::histogram!("payment_job_duration_seconds")
            .record(job.enqueued_at.elapsed().as_secs_f64());

        tracing::info!(
            gateway_payment_id = %gateway_payment_id,
            outcome = %outcome.status,
            failure_reason = outcome.failure_reason.as_deref().unwrap_or(""),
            "Payment job settled"
        );

        let callback = GatewayCallback {
            external_id: job.request.external_id,
            status: outcome.status.as_str().to_string(),
            gateway_payment_id,
            amount: job.request.amount,
            failure_reason: outcome.failure_reason,
        };
        self.dispatch_callback(callback);
    }

    fn abandon(&self, job: &PaymentJob) {
        metrics::counter!("payment_jobs_processed_total", "outcome" => "abandoned").increment(1);
        tracing::warn!(
            external_id = %job.request.external_id,
            "Shutdown interrupted payment job, no callback sent"
        );
        self.ctx.abandoned.insert(job.request.external_id.clone());
    }

    /// Gateway id for the job, initiating now if submission could not.
    /// `None` means shutdown interrupted the retries.
    async fn resolve_reference(&self, job: &PaymentJob) -> Option<Result<String, GatewayError>> {
        match &job.reference {
            GatewayReference::Assigned(id) => Some(Ok(id.clone())),
            GatewayReference::Deferred if !self.ctx.http.is_configured() => {
                Some(Ok(simulated_payment_id()))
            }
            GatewayReference::Deferred => {
                let callback_url = self.ctx.config.webhook_url.as_deref();
                let initiate = backoff::future::retry_notify(
                    retry_policy(self.ctx.config.retry_window()),
                    || async {
                        self.ctx
                            .http
                            .initiate(&job.request, callback_url)
                            .await
                            .map_err(classify)
                    },
                    |e: GatewayError, wait: Duration| {
                        tracing::warn!(
                            error = %e,
                            retry_in_ms = wait.as_millis() as u64,
                            "Deferred initiation failed, retrying"
                        );
                    },
                );

                tokio::select! {
                    biased;
                    _ = self.ctx.shutdown.cancelled() => None,
                    result = initiate => Some(result.map(|payment| payment.id)),
                }
            }
        }
    }

    /// `None` means shutdown interrupted the wait.
    async fn await_outcome(&self, gateway_payment_id: &str, job: &PaymentJob) -> Option<Outcome> {
        match self.ctx.config.outcome {
            OutcomeMode::Simulated => self.simulate().await,
            OutcomeMode::Poll if self.ctx.http.is_configured() => {
                self.poll(&job.request.external_id).await
            }
            OutcomeMode::Poll => {
                tracing::warn!(
                    gateway_payment_id,
                    "Poll mode without a gateway, falling back to simulation"
                );
                self.simulate().await
            }
        }
    }

    async fn simulate(&self) -> Option<Outcome> {
        let config = &self.ctx.config;
        let (delay_ms, succeeded, reason) = {
            let mut rng = rand::thread_rng();
            let delay_ms =
                rng.gen_range(config.simulated_delay_min_ms..=config.simulated_delay_max_ms);
            let succeeded = rng.gen_bool(config.simulated_success_rate);
            let reason = SIMULATED_FAILURE_REASONS[rng.gen_range(0..SIMULATED_FAILURE_REASONS.len())];
            (delay_ms, succeeded, reason)
        };

        if !self.pause(Duration::from_millis(delay_ms)).await {
            return None;
        }

        Some(if succeeded {
            Outcome::success()
        } else {
            Outcome::failed(reason)
        })
    }

    async fn poll(&self, external_id: &str) -> Option<Outcome> {
        let attempts = self.ctx.config.poll_max_attempts;

        for attempt in 1..=attempts {
            if !self.pause(self.ctx.config.poll_interval()).await {
                return None;
            }

            match self.ctx.http.fetch_status(external_id).await {
                Ok(payment) => match map_external_status(&payment.status) {
                    PaymentStatus::Success => return Some(Outcome::success()),
                    PaymentStatus::Failed => {
                        return Some(Outcome::failed(format!(
                            "gateway reported {}",
                            payment.status
                        )))
                    }
                    PaymentStatus::Pending => {
                        tracing::debug!(attempt, status = %payment.status, "Payment not settled yet");
                    }
                },
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "Gateway status poll failed");
                }
            }
        }

        Some(Outcome::failed(format!(
            "payment not settled after {attempts} status checks"
        )))
    }

    /// Sleep unless shutdown comes first. Returns `false` on shutdown.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.ctx.shutdown.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    // Delivery runs detached so the worker can take the next job; it may still
    // be in flight after shutdown.
    fn dispatch_callback(&self, callback: GatewayCallback) {
        let Some(url) = self.ctx.config.webhook_url.clone() else {
            tracing::warn!(
                external_id = %callback.external_id,
                "No webhook URL configured, payment result dropped"
            );
            return;
        };
        let http = self.ctx.http.clone();
        let window = self.ctx.config.retry_window();

        tokio::spawn(
            async move {
                let delivered = backoff::future::retry(retry_policy(window), || async {
                    http.deliver_callback(&url, &callback).await.map_err(classify)
                })
                .await;

                match delivered {
                    Ok(()) => tracing::debug!("Payment callback delivered"),
                    Err(e) => tracing::error!(error = %e, "Payment callback delivery failed"),
                }
            }
            .in_current_span(),
        );
    }
}
