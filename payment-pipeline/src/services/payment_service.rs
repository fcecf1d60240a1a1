//! Payment lifecycle: creation, submission to the gateway, retries.

use std::sync::Arc;
use uuid::Uuid;

use super::metrics;
use super::repository::{PaymentRepository, RepositoryError};
use crate::error::PaymentError;
use crate::events::ExpenseApproved;
use crate::gateway::types::require_external_id;
use crate::gateway::{GatewayError, GatewayPayment, PaymentGateway, PaymentRequest};
use crate::models::{generate_external_id, Payment, PaymentStatus, StatusUpdate};

#[derive(Debug, Clone)]
pub struct ProcessPaymentRequest {
    pub external_id: String,
    pub amount: i64,
}

#[derive(Debug, Clone)]
pub struct RetryPaymentRequest {
    pub external_id: String,
}

pub struct PaymentService {
    repository: Arc<dyn PaymentRepository>,
    gateway: Arc<dyn PaymentGateway>,
    currency: String,
}

impl PaymentService {
    pub fn new(
        repository: Arc<dyn PaymentRepository>,
        gateway: Arc<dyn PaymentGateway>,
        currency: impl Into<String>,
    ) -> Self {
        Self {
            repository,
            gateway,
            currency: currency.into(),
        }
    }

    pub async fn create_payment(
        &self,
        expense_id: Uuid,
        external_id: &str,
        amount: i64,
    ) -> Result<Payment, PaymentError> {
        if require_external_id(external_id).is_err() {
            return Err(PaymentError::Validation("external_id is required".to_string()));
        }
        if amount <= 0 {
            return Err(PaymentError::Validation("amount must be positive".to_string()));
        }

        let payment = Payment::new(expense_id, external_id.to_string(), amount);
        self.repository.create(&payment).await?;

        tracing::info!(
            payment_id = %payment.id,
            expense_id = %expense_id,
            external_id = %external_id,
            amount,
            "Payment created"
        );

        Ok(payment)
    }

    /// Submit an existing payment that has no job behind it yet.
    ///
    /// Settled payments, and pending ones already with the gateway, are
    /// refused with `Conflict`; retries go through [`Self::retry_payment`].
    pub async fn process_payment(
        &self,
        request: ProcessPaymentRequest,
    ) -> Result<Payment, PaymentError> {
        let payment = self.require_by_external_id(&request.external_id).await?;
        if payment.amount != request.amount {
            return Err(PaymentError::Validation(format!(
                "amount {} does not match payment amount {}",
                request.amount, payment.amount
            )));
        }
        if !payment.is_awaiting_submission() {
            return Err(PaymentError::Conflict(match payment.status {
                PaymentStatus::Pending => {
                    format!("payment {} is already with the gateway", payment.external_id)
                }
                status => format!("payment {} is already {}", payment.external_id, status),
            }));
        }

        self.submit(payment, false).await
    }

    // Hand the payment to the gateway client. A rejected submission leaves
    // the payment failed and retryable; with `refund_retry` the retry that
    // led here is given back.
    async fn submit(&self, payment: Payment, refund_retry: bool) -> Result<Payment, PaymentError> {
        let gateway_request = PaymentRequest {
            external_id: payment.external_id.clone(),
            amount: payment.amount,
            currency: self.currency.clone(),
            description: format!("Reimbursement for expense {}", payment.expense_id),
        };

        match self.gateway.process_payment(gateway_request).await {
            Ok(acceptance) => {
                let mut update = StatusUpdate::new(PaymentStatus::Pending).submitted();
                if let Ok(snapshot) = serde_json::to_value(&acceptance) {
                    update = update.with_response(snapshot);
                }
                self.record_submission(payment, &update).await
            }
            Err(e) => {
                self.record_rejection(&payment, &e, refund_retry).await;
                Err(e.into())
            }
        }
    }

    async fn record_rejection(&self, payment: &Payment, error: &GatewayError, refund_retry: bool) {
        if matches!(error, GatewayError::QueueFull) {
            tracing::warn!(
                payment_id = %payment.id,
                external_id = %payment.external_id,
                "Payment queue full, payment left retryable"
            );
        } else {
            tracing::error!(
                payment_id = %payment.id,
                external_id = %payment.external_id,
                error = %error,
                "Payment submission failed"
            );
        }

        let mut update = StatusUpdate::new(PaymentStatus::Failed)
            .with_response(serde_json::json!({ "error": error.to_string() }))
            .with_failure_reason(Some(error.to_string()));
        if refund_retry && payment.retry_count > 0 {
            update = update.refunding_retry();
        }

        match self
            .repository
            .update_status(payment.id, payment.version, &update)
            .await
        {
            Ok(_) => metrics::record_settlement(PaymentStatus::Failed),
            Err(e) => tracing::error!(
                payment_id = %payment.id,
                error = %e,
                "Could not record rejected submission"
            ),
        }
    }

    /// Mark payments whose jobs were dropped by a shutdown as failed, so they
    /// can be retried. Payments that settled meanwhile are left alone.
    pub async fn fail_interrupted(&self, external_ids: &[String]) -> usize {
        let mut failed = 0;
        for external_id in external_ids {
            let payment = match self.repository.get_by_external_id(external_id).await {
                Ok(Some(payment)) if payment.status == PaymentStatus::Pending => payment,
                Ok(_) => continue,
                Err(e) => {
                    tracing::error!(
                        external_id = %external_id,
                        error = %e,
                        "Could not load interrupted payment"
                    );
                    continue;
                }
            };

            let update = StatusUpdate::new(PaymentStatus::Failed)
                .with_failure_reason(Some("payment interrupted by shutdown".to_string()));
            match self
                .repository
                .update_status(payment.id, payment.version, &update)
                .await
            {
                Ok(_) => failed += 1,
                Err(e) => tracing::warn!(
                    external_id = %external_id,
                    error = %e,
                    "Interrupted payment not marked failed"
                ),
            }
        }

        if failed > 0 {
            tracing::warn!(count = failed, "Payments interrupted by shutdown marked failed");
        }
        failed
    }

    // The callback can beat this write; when it does, its result stands.
    async fn record_submission(
        &self,
        payment: Payment,
        update: &StatusUpdate,
    ) -> Result<Payment, PaymentError> {
        match self
            .repository
            .update_status(payment.id, payment.version, update)
            .await
        {
            Ok(updated) => {
                tracing::info!(
                    payment_id = %updated.id,
                    external_id = %updated.external_id,
                    "Payment submitted to gateway"
                );
                Ok(updated)
            }
            Err(RepositoryError::VersionConflict(_)) => {
                tracing::debug!(
                    payment_id = %payment.id,
                    "Payment changed while submitting, keeping newer state"
                );
                self.require_by_external_id(&payment.external_id).await
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Re-submit a failed payment, consuming one of its retries. A retry the
    /// gateway client refuses is not counted.
    pub async fn retry_payment(&self, request: RetryPaymentRequest) -> Result<Payment, PaymentError> {
        let payment = self.require_by_external_id(&request.external_id).await?;
        self.retry(payment).await
    }

    /// Retry the latest payment of an expense.
    pub async fn retry_for_expense(&self, expense_id: Uuid) -> Result<Payment, PaymentError> {
        let payment = self.get_payment_by_expense_id(expense_id).await?;
        self.retry(payment).await
    }

    async fn retry(&self, payment: Payment) -> Result<Payment, PaymentError> {
        if !payment.can_retry() {
            return Err(PaymentError::NotEligibleForRetry {
                external_id: payment.external_id,
                status: payment.status,
                retry_count: payment.retry_count,
            });
        }

        let rearmed = self
            .repository
            .increment_retry_count(payment.id, payment.version)
            .await?;

        tracing::info!(
            payment_id = %rearmed.id,
            external_id = %rearmed.external_id,
            retry_count = rearmed.retry_count,
            "Retrying payment"
        );

        self.submit(rearmed, true).await
    }

    pub async fn get_payment_by_expense_id(&self, expense_id: Uuid) -> Result<Payment, PaymentError> {
        self.repository
            .get_latest_by_expense_id(expense_id)
            .await?
            .ok_or_else(|| PaymentError::NotFound(format!("payment for expense {expense_id}")))
    }

    pub async fn get_payment_by_external_id(&self, external_id: &str) -> Result<Payment, PaymentError> {
        self.require_by_external_id(external_id).await
    }

    /// Ask the gateway directly about a payment this service knows.
    pub async fn gateway_status(&self, external_id: &str) -> Result<GatewayPayment, PaymentError> {
        self.require_by_external_id(external_id).await?;
        Ok(self.gateway.get_payment_status(external_id).await?)
    }

    /// Create and submit the payment for a newly approved expense.
    pub async fn initiate_for_expense(
        &self,
        approved: &ExpenseApproved,
    ) -> Result<Payment, PaymentError> {
        let external_id = generate_external_id(approved.expense_id);
        let payment = self
            .create_payment(approved.expense_id, &external_id, approved.amount)
            .await?;
        metrics::record_amount(&approved.currency, approved.amount);

        self.submit(payment, false).await
    }

    async fn require_by_external_id(&self, external_id: &str) -> Result<Payment, PaymentError> {
        self.repository
            .get_by_external_id(external_id)
            .await?
            .ok_or_else(|| PaymentError::NotFound(format!("payment {external_id}")))
    }
}
