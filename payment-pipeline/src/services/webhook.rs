//! Reconciles gateway callbacks into payment state and domain events.
//!
//! Only a pending payment takes a new status from a callback. A callback
//! for a settled payment is acknowledged and dropped, so redelivered results
//! never publish twice; after a retry the payment is pending again and the
//! next callback applies normally.

use std::sync::Arc;

use super::metrics;
use super::repository::{PaymentRepository, RepositoryError};
use crate::error::PaymentError;
use crate::events::{Event, EventBus, PaymentCompleted, PaymentFailed};
use crate::gateway::GatewayCallback;
use crate::models::{map_external_status, Payment, PaymentStatus, StatusUpdate};

/// Attempts at the read-modify-write before giving up with a conflict.
const MAX_WRITE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// The callback changed the payment.
    Applied(PaymentStatus),
    /// Same status the payment already has; no event is published.
    Duplicate(PaymentStatus),
    /// The payment is settled with a different status; the callback is stale.
    Ignored(PaymentStatus),
}

impl WebhookOutcome {
    pub fn message(&self) -> String {
        match self {
            WebhookOutcome::Applied(status) => format!("payment updated to {status}"),
            WebhookOutcome::Duplicate(status) => format!("payment already {status}"),
            WebhookOutcome::Ignored(status) => {
                format!("payment already settled as {status}, callback ignored")
            }
        }
    }

    fn label(&self) -> &'static str {
        match self {
            WebhookOutcome::Applied(status) => status.as_str(),
            WebhookOutcome::Duplicate(_) => "duplicate",
            WebhookOutcome::Ignored(_) => "ignored",
        }
    }
}

pub struct WebhookProcessor {
    repository: Arc<dyn PaymentRepository>,
    bus: Arc<EventBus>,
}

impl WebhookProcessor {
    pub fn new(repository: Arc<dyn PaymentRepository>, bus: Arc<EventBus>) -> Self {
        Self { repository, bus }
    }

    pub async fn handle(&self, callback: &GatewayCallback) -> Result<WebhookOutcome, PaymentError> {
        if callback.external_id.trim().is_empty() {
            return Err(PaymentError::Validation("external_id is required".to_string()));
        }
        if callback.status.trim().is_empty() {
            return Err(PaymentError::Validation("status is required".to_string()));
        }

        let mapped = map_external_status(&callback.status);
        let update = self.update_for(callback, mapped);

        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let payment = self
                .repository
                .get_by_external_id(&callback.external_id)
                .await?
                .ok_or_else(|| PaymentError::NotFound(format!("payment {}", callback.external_id)))?;

            if payment.status.is_settled() {
                let outcome = if payment.status == mapped {
                    WebhookOutcome::Duplicate(payment.status)
                } else {
                    WebhookOutcome::Ignored(payment.status)
                };
                tracing::info!(
                    payment_id = %payment.id,
                    external_id = %payment.external_id,
                    callback_status = %callback.status,
                    "Callback for settled payment, not applied"
                );
                return Ok(self.finish(outcome));
            }

            match self
                .repository
                .update_status(payment.id, payment.version, &update)
                .await
            {
                Ok(updated) => {
                    self.announce(&updated, callback);
                    let outcome = if mapped.is_settled() {
                        WebhookOutcome::Applied(mapped)
                    } else {
                        WebhookOutcome::Duplicate(mapped)
                    };
                    return Ok(self.finish(outcome));
                }
                Err(RepositoryError::VersionConflict(_)) => {
                    tracing::debug!(
                        payment_id = %payment.id,
                        attempt,
                        "Payment changed under callback, re-reading"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(PaymentError::Conflict(format!(
            "payment {} kept changing while applying callback",
            callback.external_id
        )))
    }

    fn update_for(&self, callback: &GatewayCallback, mapped: PaymentStatus) -> StatusUpdate {
        let failure_reason = match (&callback.failure_reason, mapped) {
            (Some(reason), _) => Some(reason.clone()),
            (None, PaymentStatus::Failed) => {
                Some(format!("gateway reported status {}", callback.status))
            }
            (None, _) => None,
        };

        let mut update = StatusUpdate::new(mapped).with_failure_reason(failure_reason);
        if let Ok(snapshot) = serde_json::to_value(callback) {
            update = update.with_response(snapshot);
        }
        update
    }

    fn announce(&self, payment: &Payment, callback: &GatewayCallback) {
        tracing::info!(
            payment_id = %payment.id,
            external_id = %payment.external_id,
            expense_id = %payment.expense_id,
            status = %payment.status,
            "Payment updated from callback"
        );

        let event = match payment.status {
            PaymentStatus::Success => Event::new(PaymentCompleted {
                payment_id: payment.id,
                expense_id: payment.expense_id,
                external_id: payment.external_id.clone(),
                amount: payment.amount,
                status: payment.status,
                gateway_payment_id: callback.gateway_payment_id.clone(),
            }),
            PaymentStatus::Failed => Event::new(PaymentFailed {
                payment_id: payment.id,
                expense_id: payment.expense_id,
                external_id: payment.external_id.clone(),
                amount: payment.amount,
                failure_reason: payment.failure_reason.clone().unwrap_or_default(),
                retry_count: payment.retry_count,
            }),
            PaymentStatus::Pending => return,
        };

        metrics::record_settlement(payment.status);
        self.bus.publish(event);
    }

    fn finish(&self, outcome: WebhookOutcome) -> WebhookOutcome {
        metrics::record_webhook(outcome.label());
        outcome
    }
}
