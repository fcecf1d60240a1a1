//! Application startup and lifecycle management.

use axum::middleware::from_fn;
use axum::{
    routing::{get, post},
    Router,
};
use mongodb::{options::ClientOptions, Client};
use secrecy::ExposeSecret;
use service_core::error::AppError;
use service_core::middleware::{metrics_middleware, request_id_middleware};
use service_core::observability::REQUEST_ID_HEADER;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::trace::TraceLayer;

use crate::config::{Config, DatabaseBackend};
use crate::events::EventBus;
use crate::gateway::PaymentGatewayClient;
use crate::handlers;
use crate::pipeline;
use crate::services::{
    ExpenseRepository, ExpenseService, InMemoryExpenseRepository, InMemoryPaymentRepository,
    MongoExpenseRepository, MongoPaymentRepository, PaymentRepository, PaymentService,
    WebhookProcessor,
};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub bus: Arc<EventBus>,
    pub gateway: Arc<PaymentGatewayClient>,
    pub payments: Arc<PaymentService>,
    pub expenses: Arc<ExpenseService>,
    pub webhooks: Arc<WebhookProcessor>,
}

type Repositories = (Arc<dyn PaymentRepository>, Arc<dyn ExpenseRepository>);

async fn connect_repositories(config: &Config) -> Result<Repositories, AppError> {
    match config.database.backend {
        DatabaseBackend::Memory => {
            tracing::warn!("Using in-memory storage, data is lost on restart");
            Ok((
                Arc::new(InMemoryPaymentRepository::new()),
                Arc::new(InMemoryExpenseRepository::new()),
            ))
        }
        DatabaseBackend::Mongo => {
            let mut client_options = ClientOptions::parse(config.database.url.expose_secret())
                .await
                .map_err(|e| {
                    tracing::error!("Failed to parse MongoDB connection string: {}", e);
                    AppError::DatabaseError(e.into())
                })?;
            client_options.app_name = Some(config.service_name.clone());

            let client = Client::with_options(client_options).map_err(|e| {
                tracing::error!("Failed to create MongoDB client: {}", e);
                AppError::DatabaseError(e.into())
            })?;
            let db = client.database(&config.database.db_name);

            let payments = MongoPaymentRepository::new(&db);
            payments.init_indexes().await.map_err(|e| {
                tracing::error!("Failed to initialize database indexes: {}", e);
                AppError::DatabaseError(e)
            })?;

            Ok((
                Arc::new(payments),
                Arc::new(MongoExpenseRepository::new(&db)),
            ))
        }
    }
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Build the application. Port 0 binds a random port.
    pub async fn build(mut config: Config) -> Result<Self, AppError> {
        let addr = format!("{}:{}", config.server.host, config.server.port);
        let listener = TcpListener::bind(&addr).await.map_err(|e| {
            tracing::error!("Failed to bind HTTP listener to {}: {}", addr, e);
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        config.gateway = config.gateway.normalized();
        if config.gateway.webhook_url.is_none() {
            config.gateway.webhook_url = Some(format!("http://127.0.0.1:{port}/webhooks/payment"));
        }

        let (payment_repository, expense_repository) = connect_repositories(&config).await?;

        let bus = Arc::new(EventBus::new());
        let gateway = Arc::new(PaymentGatewayClient::start(
            config.gateway.clone(),
            reqwest::Client::new(),
        ));
        let payments = Arc::new(PaymentService::new(
            payment_repository.clone(),
            gateway.clone(),
            config.currency.clone(),
        ));
        let expenses = Arc::new(ExpenseService::new(expense_repository, bus.clone()));
        let webhooks = Arc::new(WebhookProcessor::new(payment_repository, bus.clone()));

        pipeline::register(&bus, payments.clone(), expenses.clone());

        tracing::info!(
            port,
            webhook_url = config.gateway.webhook_url.as_deref().unwrap_or(""),
            "Payment pipeline built"
        );

        Ok(Self {
            port,
            listener,
            state: AppState {
                config,
                bus,
                gateway,
                payments,
                expenses,
                webhooks,
            },
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    pub fn router(state: AppState) -> Router {
        Router::new()
            .route("/health", get(handlers::health_check))
            .route("/ready", get(handlers::readiness_check))
            .route("/metrics", get(handlers::metrics_endpoint))
            .route("/webhooks/payment", post(handlers::webhook::payment_webhook))
            .route(
                "/expenses/:expense_id/payment",
                get(handlers::payments::get_expense_payment),
            )
            .route(
                "/expenses/:expense_id/payment/retry",
                post(handlers::payments::retry_payment),
            )
            .route("/payments/:external_id", get(handlers::payments::get_payment))
            .route(
                "/payments/:external_id/gateway-status",
                get(handlers::payments::get_gateway_status),
            )
            .layer(from_fn(metrics_middleware))
            .layer(from_fn(request_id_middleware))
            .layer(
                TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                    let request_id = request
                        .headers()
                        .get(REQUEST_ID_HEADER)
                        .and_then(|value| value.to_str().ok())
                        .unwrap_or("-");

                    tracing::info_span!(
                        "http_request",
                        request_id = %request_id,
                        method = %request.method(),
                        uri = %request.uri(),
                        user_id = tracing::field::Empty,
                    )
                }),
            )
            .with_state(state)
    }

    /// Serve until SIGINT/SIGTERM, then drain.
    pub async fn run_until_stopped(self) -> anyhow::Result<()> {
        self.run_until(shutdown_signal()).await
    }

    /// Serve until `signal` resolves, then stop the worker pool, fail the
    /// payments it dropped and wait for in-flight event handlers.
    pub async fn run_until<F>(self, signal: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let state = self.state.clone();
        let router = Self::router(self.state);

        tracing::info!("Listening on port {}", self.port);
        axum::serve(self.listener, router)
            .with_graceful_shutdown(signal)
            .await?;

        state.gateway.shutdown().await;
        state
            .payments
            .fail_interrupted(&state.gateway.take_abandoned())
            .await;
        state.bus.shutdown().await;
        tracing::info!("Payment pipeline stopped");

        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
