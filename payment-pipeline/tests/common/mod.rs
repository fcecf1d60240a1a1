#![allow(dead_code)]

use payment_pipeline::config::{Config, GatewayConfig};
use payment_pipeline::models::{Expense, ExpenseStatus, Payment};
use payment_pipeline::startup::{AppState, Application};
use secrecy::Secret;
use std::time::Duration;
use tokio::sync::oneshot;
use uuid::Uuid;

pub const MANAGER_ID: &str = "7d0f1e8a-3c0b-4f7e-9a52-6c1f1d2b9e01";
pub const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);
pub const EMPLOYEE_ID: &str = "2b4c6d8e-1a3f-4e5d-8c7b-9a0b1c2d3e4f";

pub struct TestApp {
    pub address: String,
    pub port: u16,
    pub state: AppState,
    pub client: reqwest::Client,
    stop: Option<oneshot::Sender<()>>,
    server: tokio::task::JoinHandle<anyhow::Result<()>>,
}

pub struct TestAppBuilder {
    success_rate: f64,
    webhook_secret: Option<String>,
    max_workers: usize,
}

impl TestAppBuilder {
    pub fn success_rate(mut self, rate: f64) -> Self {
        self.success_rate = rate;
        self
    }

    pub fn webhook_secret(mut self, secret: &str) -> Self {
        self.webhook_secret = Some(secret.to_string());
        self
    }

    pub fn max_workers(mut self, workers: usize) -> Self {
        self.max_workers = workers;
        self
    }

    pub async fn spawn(self) -> TestApp {
        let mut config = Config::default();
        config.server.host = "127.0.0.1".to_string();
        config.server.port = 0;
        config.gateway = GatewayConfig {
            max_workers: self.max_workers,
            simulated_success_rate: self.success_rate,
            simulated_delay_min_ms: 10,
            simulated_delay_max_ms: 40,
            webhook_secret: self.webhook_secret.map(Secret::new),
            ..GatewayConfig::default()
        };

        let app = Application::build(config)
            .await
            .expect("Failed to build test application");

        let port = app.port();
        let address = format!("http://127.0.0.1:{}", port);
        let state = app.state();

        let (stop, stopped) = oneshot::channel::<()>();
        let server = tokio::spawn(app.run_until(async move {
            stopped.await.ok();
        }));

        let client = reqwest::Client::new();
        let health_url = format!("{}/health", address);
        for _ in 0..50 {
            if client.get(&health_url).send().await.is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        TestApp {
            address,
            port,
            state,
            client,
            stop: Some(stop),
            server,
        }
    }
}

impl TestApp {
    pub fn builder() -> TestAppBuilder {
        TestAppBuilder {
            success_rate: 1.0,
            webhook_secret: None,
            max_workers: 4,
        }
    }

    pub async fn spawn() -> Self {
        Self::builder().spawn().await
    }

    /// Submit and approve an expense, which kicks off its payment.
    pub async fn approved_expense(&self, amount: i64) -> Expense {
        let expense = self
            .state
            .expenses
            .submit(Uuid::new_v4(), amount, "IDR", "Team offsite")
            .await
            .expect("Failed to submit expense");
        self.state
            .expenses
            .approve(expense.id)
            .await
            .expect("Failed to approve expense")
    }

    /// Insert a pending payment without submitting it to the gateway.
    pub async fn pending_payment(&self, amount: i64) -> Payment {
        let expense_id = Uuid::new_v4();
        let external_id = format!("EXP-{}", expense_id);
        self.state
            .payments
            .create_payment(expense_id, &external_id, amount)
            .await
            .expect("Failed to create payment")
    }

    pub async fn expense_status(&self, id: Uuid) -> ExpenseStatus {
        self.state
            .expenses
            .get(id)
            .await
            .expect("Failed to load expense")
            .status
    }

    pub async fn payment_for(&self, expense_id: Uuid) -> Payment {
        self.state
            .payments
            .get_payment_by_expense_id(expense_id)
            .await
            .expect("Failed to load payment")
    }

    pub async fn payment_for_opt(&self, expense_id: Uuid) -> Option<Payment> {
        self.state
            .payments
            .get_payment_by_expense_id(expense_id)
            .await
            .ok()
    }

    /// Poll until the expense's latest payment satisfies `predicate`.
    pub async fn wait_for_payment<P>(&self, expense_id: Uuid, predicate: P) -> Option<Payment>
    where
        P: Fn(&Payment) -> bool,
    {
        let deadline = tokio::time::Instant::now() + SETTLE_TIMEOUT;
        loop {
            if let Some(payment) = self.payment_for_opt(expense_id).await {
                if predicate(&payment) {
                    return Some(payment);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Poll until the expense reaches `status`.
    pub async fn wait_for_expense(&self, id: Uuid, status: ExpenseStatus) -> bool {
        let deadline = tokio::time::Instant::now() + SETTLE_TIMEOUT;
        loop {
            if self.expense_status(id).await == status {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub async fn post_webhook(&self, body: &serde_json::Value) -> reqwest::Response {
        self.client
            .post(format!("{}/webhooks/payment", self.address))
            .json(body)
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn post_retry(&self, expense_id: Uuid, user_id: &str, role: &str) -> reqwest::Response {
        self.client
            .post(format!("{}/expenses/{}/payment/retry", self.address, expense_id))
            .header("X-User-ID", user_id)
            .header("X-User-Role", role)
            .send()
            .await
            .expect("Failed to execute request")
    }

    /// Stop the server and wait for the worker pool to drain.
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            stop.send(()).ok();
        }
        (&mut self.server)
            .await
            .expect("Server task panicked")
            .expect("Server returned an error");
    }
}
