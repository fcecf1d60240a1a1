use async_trait::async_trait;
use dashmap::DashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use validator::Validate;

use super::http::GatewayHttp;
use super::types::{
    GatewayError, GatewayPayment, GatewayReference, PaymentAcceptance, PaymentJob,
    PaymentRequest,
};
use super::worker::{run_dispatcher, simulated_payment_id, Abandoned, Worker, WorkerContext};
use super::PaymentGateway;
use crate::config::GatewayConfig;

/// Bounded worker pool in front of the external payment gateway.
///
/// Submission never waits: a full queue is reported as
/// [`GatewayError::QueueFull`]. Results come back out of band through the
/// configured webhook URL.
pub struct PaymentGatewayClient {
    jobs: mpsc::Sender<PaymentJob>,
    http: GatewayHttp,
    config: GatewayConfig,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    abandoned: Abandoned,
}

impl PaymentGatewayClient {
    /// Start the dispatcher and `max_workers` workers. Must be called from
    /// within a Tokio runtime.
    pub fn start(config: GatewayConfig, client: reqwest::Client) -> Self {
        let config = config.normalized();
        let http = GatewayHttp::new(client, &config);
        let shutdown = CancellationToken::new();
        let tasks = TaskTracker::new();
        let abandoned: Abandoned = Arc::new(DashSet::new());

        let (jobs_tx, jobs_rx) = mpsc::channel(config.job_queue_size);
        let (pool_tx, pool_rx) = mpsc::channel(config.worker_pool_size);

        let ctx = Arc::new(WorkerContext {
            http: http.clone(),
            config: config.clone(),
            shutdown: shutdown.clone(),
            abandoned: abandoned.clone(),
        });

        for id in 0..config.max_workers {
            let worker = Worker {
                id,
                ctx: ctx.clone(),
                pool: pool_tx.clone(),
            };
            tasks.spawn(worker.run());
        }
        tasks.spawn(run_dispatcher(
            jobs_rx,
            pool_rx,
            shutdown.clone(),
            abandoned.clone(),
        ));

        tracing::info!(
            max_workers = config.max_workers,
            job_queue_size = config.job_queue_size,
            worker_pool_size = config.worker_pool_size,
            gateway_configured = http.is_configured(),
            outcome_mode = ?config.outcome,
            "Payment gateway client started"
        );

        Self {
            jobs: jobs_tx,
            http,
            config,
            shutdown,
            tasks,
            abandoned,
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Validate, obtain a gateway reference and enqueue the job.
    pub async fn process_payment(
        &self,
        request: PaymentRequest,
    ) -> Result<PaymentAcceptance, GatewayError> {
        if let Err(e) = request.validate() {
            reject("validation");
            return Err(e.into());
        }
        if self.is_shut_down() {
            reject("shutdown");
            return Err(GatewayError::ShuttingDown);
        }

        let reference = self.initial_reference(&request).await;
        let acceptance = PaymentAcceptance {
            external_id: request.external_id.clone(),
            gateway_payment_id: reference.id().map(str::to_string),
            status: "pending".to_string(),
            message: match reference {
                GatewayReference::Assigned(_) => "payment queued".to_string(),
                GatewayReference::Deferred => "payment queued, initiation deferred".to_string(),
            },
        };

        let job = PaymentJob {
            request,
            reference,
            enqueued_at: Instant::now(),
        };

        match self.jobs.try_send(job) {
            Ok(()) => {
                metrics::counter!("payment_jobs_enqueued_total").increment(1);
                tracing::info!(
                    external_id = %acceptance.external_id,
                    gateway_payment_id = acceptance.gateway_payment_id.as_deref().unwrap_or(""),
                    "Payment job enqueued"
                );
                Ok(acceptance)
            }
            Err(TrySendError::Full(job)) => {
                reject("queue_full");
                tracing::warn!(
                    external_id = %job.request.external_id,
                    "Payment job queue full"
                );
                Err(GatewayError::QueueFull)
            }
            Err(TrySendError::Closed(_)) => {
                reject("shutdown");
                Err(GatewayError::ShuttingDown)
            }
        }
    }

    // A failed or timed-out initiation degrades to a deferred reference.
    async fn initial_reference(&self, request: &PaymentRequest) -> GatewayReference {
        if !self.http.is_configured() {
            return GatewayReference::Assigned(simulated_payment_id());
        }

        match self
            .http
            .initiate(request, self.config.webhook_url.as_deref())
            .await
        {
            Ok(payment) => GatewayReference::Assigned(payment.id),
            Err(e) => {
                tracing::warn!(
                    external_id = %request.external_id,
                    error = %e,
                    "Gateway initiation failed, deferring to worker"
                );
                GatewayReference::Deferred
            }
        }
    }

    /// Query the gateway directly, bypassing the pool.
    pub async fn get_payment_status(
        &self,
        external_id: &str,
    ) -> Result<GatewayPayment, GatewayError> {
        self.http.fetch_status(external_id).await
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Stop dispatching and wait for the dispatcher and workers to exit.
    /// Callbacks already handed off may still be in flight. Safe to call more
    /// than once.
    pub async fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            tracing::info!("Shutting down payment gateway client");
        }
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }

    /// External ids of accepted jobs that shutdown kept from settling. Their
    /// payments are still pending and no callback will come. Drains the set.
    pub fn take_abandoned(&self) -> Vec<String> {
        let ids: Vec<String> = self.abandoned.iter().map(|id| id.key().clone()).collect();
        for id in &ids {
            self.abandoned.remove(id);
        }
        ids
    }
}

fn reject(reason: &'static str) {
    metrics::counter!("payment_jobs_rejected_total", "reason" => reason).increment(1);
}

#[async_trait]
impl PaymentGateway for PaymentGatewayClient {
    async fn process_payment(
        &self,
        request: PaymentRequest,
    ) -> Result<PaymentAcceptance, GatewayError> {
        PaymentGatewayClient::process_payment(self, request).await
    }

    async fn get_payment_status(&self, external_id: &str) -> Result<GatewayPayment, GatewayError> {
        PaymentGatewayClient::get_payment_status(self, external_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request(external_id: &str) -> PaymentRequest {
        PaymentRequest {
            external_id: external_id.to_string(),
            amount: 50_000,
            currency: "IDR".to_string(),
            description: "Taxi".to_string(),
        }
    }

    fn slow_config() -> GatewayConfig {
        GatewayConfig {
            max_workers: 1,
            job_queue_size: 1,
            simulated_delay_min_ms: 5_000,
            simulated_delay_max_ms: 5_000,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_rejects_invalid_requests() {
        let client = PaymentGatewayClient::start(GatewayConfig::default(), reqwest::Client::new());

        let err = client.process_payment(request("")).await.unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));

        let mut zero = request("exp_1");
        zero.amount = 0;
        let err = client.process_payment(zero).await.unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));

        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_saturated_queue_fails_fast() {
        let client = PaymentGatewayClient::start(slow_config(), reqwest::Client::new());

        let mut accepted = 0;
        let mut queue_full = 0;
        for i in 0..10 {
            match client.process_payment(request(&format!("exp_{i}"))).await {
                Ok(_) => accepted += 1,
                Err(GatewayError::QueueFull) => queue_full += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
            tokio::task::yield_now().await;
        }

        // One job per worker, one held by the dispatcher, one in the queue.
        assert!(accepted <= 3, "accepted {accepted}");
        assert!(queue_full >= 7, "queue_full {queue_full}");

        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_is_prompt_and_idempotent() {
        let client = PaymentGatewayClient::start(slow_config(), reqwest::Client::new());
        client.process_payment(request("exp_busy")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        tokio::time::timeout(Duration::from_secs(1), client.shutdown())
            .await
            .expect("shutdown should interrupt the simulated delay");
        client.shutdown().await;

        assert!(client.is_shut_down());
        assert!(matches!(
            client.process_payment(request("exp_late")).await,
            Err(GatewayError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_shutdown_reports_every_unsettled_job() {
        let client = PaymentGatewayClient::start(slow_config(), reqwest::Client::new());

        let mut accepted = Vec::new();
        for i in 0..5 {
            let external_id = format!("exp_cut_{i}");
            if client.process_payment(request(&external_id)).await.is_ok() {
                accepted.push(external_id);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(accepted.len() >= 2, "accepted {accepted:?}");

        client.shutdown().await;

        let mut abandoned = client.take_abandoned();
        abandoned.sort();
        accepted.sort();
        assert_eq!(abandoned, accepted);
        assert!(client.take_abandoned().is_empty());
    }

    #[tokio::test]
    async fn test_uses_gateway_id_when_initiation_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/payments"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": {"id": "gw_777", "external_id": "exp_1", "status": "pending"}
            })))
            .mount(&server)
            .await;

        let config = GatewayConfig {
            base_url: Some(server.uri()),
            ..slow_config()
        };
        let client = PaymentGatewayClient::start(config, reqwest::Client::new());

        let acceptance = client.process_payment(request("exp_1")).await.unwrap();
        assert_eq!(acceptance.gateway_payment_id.as_deref(), Some("gw_777"));

        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_initiation_is_deferred() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let config = GatewayConfig {
            base_url: Some(server.uri()),
            ..slow_config()
        };
        let client = PaymentGatewayClient::start(config, reqwest::Client::new());

        let acceptance = client.process_payment(request("exp_1")).await.unwrap();
        assert!(acceptance.gateway_payment_id.is_none());
        assert!(acceptance.message.contains("deferred"));

        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_worker_delivers_callback() {
        let receiver = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/webhooks/payment"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&receiver)
            .await;

        let config = GatewayConfig {
            webhook_url: Some(format!("{}/webhooks/payment", receiver.uri())),
            simulated_success_rate: 1.0,
            simulated_delay_min_ms: 10,
            simulated_delay_max_ms: 20,
            ..Default::default()
        };
        let client = PaymentGatewayClient::start(config, reqwest::Client::new());
        client.process_payment(request("exp_cb")).await.unwrap();

        let mut delivered = Vec::new();
        for _ in 0..50 {
            delivered = receiver.received_requests().await.unwrap_or_default();
            if !delivered.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(delivered.len(), 1);
        let body: serde_json::Value = serde_json::from_slice(&delivered[0].body).unwrap();
        assert_eq!(body["external_id"], "exp_cb");
        assert_eq!(body["status"], "success");
        assert_eq!(body["amount"], 50_000);
        assert!(body["gateway_payment_id"].as_str().unwrap().starts_with("sim_"));

        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_poll_mode_reports_gateway_verdict() {
        let gateway = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/payments"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": {"id": "gw_poll", "external_id": "exp_poll", "status": "pending"}
            })))
            .mount(&gateway)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/payments/exp_poll"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": {"id": "gw_poll", "external_id": "exp_poll", "status": "DECLINED"}
            })))
            .mount(&gateway)
            .await;
        Mock::given(method("POST"))
            .and(path("/webhooks/payment"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&gateway)
            .await;

        let config = GatewayConfig {
            base_url: Some(gateway.uri()),
            webhook_url: Some(format!("{}/webhooks/payment", gateway.uri())),
            outcome: crate::config::OutcomeMode::Poll,
            poll_interval_ms: 10,
            ..Default::default()
        };
        let client = PaymentGatewayClient::start(config, reqwest::Client::new());
        client.process_payment(request("exp_poll")).await.unwrap();

        let mut callback = None;
        for _ in 0..50 {
            let requests = gateway.received_requests().await.unwrap_or_default();
            callback = requests
                .into_iter()
                .find(|r| r.url.path() == "/webhooks/payment");
            if callback.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let callback = callback.expect("callback delivered");
        let body: serde_json::Value = serde_json::from_slice(&callback.body).unwrap();
        assert_eq!(body["status"], "failed");
        assert_eq!(body["gateway_payment_id"], "gw_poll");
        assert!(body["failure_reason"].as_str().unwrap().contains("DECLINED"));

        client.shutdown().await;
    }
}
