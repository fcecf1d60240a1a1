pub mod expense_service;
pub mod metrics;
pub mod mongo;
pub mod payment_service;
pub mod repository;
pub mod webhook;

pub use expense_service::ExpenseService;
pub use metrics::{get_metrics, init_metrics};
pub use mongo::{MongoExpenseRepository, MongoPaymentRepository};
pub use payment_service::{PaymentService, ProcessPaymentRequest, RetryPaymentRequest};
pub use repository::{
    ExpenseRepository, InMemoryExpenseRepository, InMemoryPaymentRepository, PaymentRepository,
    RepositoryError,
};
pub use webhook::{WebhookOutcome, WebhookProcessor};
