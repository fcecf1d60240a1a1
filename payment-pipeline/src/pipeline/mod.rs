//! Event subscriptions tying expenses and payments together.
//!
//! `ExpenseApproved` starts a payment, `PaymentCompleted` completes the
//! expense. `PaymentFailed` leaves the expense `approved` so a manager can
//! retry; the handler only records whether retries remain.

use anyhow::anyhow;
use async_trait::async_trait;
use std::sync::Arc;

use crate::events::{Event, EventBus, EventHandler, EventPayload, EventType, HandlerError};
use crate::models::MAX_RETRIES;
use crate::services::{ExpenseService, PaymentService};

pub fn register(bus: &EventBus, payments: Arc<PaymentService>, expenses: Arc<ExpenseService>) {
    bus.subscribe(EventType::ExpenseApproved, InitiatePayment { payments });
    bus.subscribe(EventType::PaymentCompleted, CompleteExpense { expenses });
    bus.subscribe(EventType::PaymentFailed, NoteFailedPayment);
}

fn unexpected(event: &Event) -> HandlerError {
    anyhow!("unexpected payload for {} event {}", event.event_type(), event.id)
}

pub struct InitiatePayment {
    payments: Arc<PaymentService>,
}

#[async_trait]
impl EventHandler for InitiatePayment {
    fn name(&self) -> &str {
        "initiate_payment"
    }

    async fn handle(&self, event: &Event) -> Result<(), HandlerError> {
        let EventPayload::ExpenseApproved(approved) = &event.payload else {
            return Err(unexpected(event));
        };

        let payment = self.payments.initiate_for_expense(approved).await?;
        tracing::info!(
            expense_id = %approved.expense_id,
            payment_id = %payment.id,
            external_id = %payment.external_id,
            "Payment initiated for approved expense"
        );
        Ok(())
    }
}

pub struct CompleteExpense {
    expenses: Arc<ExpenseService>,
}

#[async_trait]
impl EventHandler for CompleteExpense {
    fn name(&self) -> &str {
        "complete_expense"
    }

    async fn handle(&self, event: &Event) -> Result<(), HandlerError> {
        let EventPayload::PaymentCompleted(completed) = &event.payload else {
            return Err(unexpected(event));
        };

        self.expenses.mark_paid(completed.expense_id).await?;
        Ok(())
    }
}

pub struct NoteFailedPayment;

#[async_trait]
impl EventHandler for NoteFailedPayment {
    fn name(&self) -> &str {
        "note_failed_payment"
    }

    async fn handle(&self, event: &Event) -> Result<(), HandlerError> {
        let EventPayload::PaymentFailed(failed) = &event.payload else {
            return Err(unexpected(event));
        };

        let retries_left = MAX_RETRIES.saturating_sub(failed.retry_count);
        if retries_left > 0 {
            tracing::warn!(
                expense_id = %failed.expense_id,
                external_id = %failed.external_id,
                failure_reason = %failed.failure_reason,
                retries_left,
                "Payment failed, expense awaits manager retry"
            );
        } else {
            tracing::error!(
                expense_id = %failed.expense_id,
                external_id = %failed.external_id,
                failure_reason = %failed.failure_reason,
                "Payment failed permanently, no retries left"
            );
        }
        Ok(())
    }
}
