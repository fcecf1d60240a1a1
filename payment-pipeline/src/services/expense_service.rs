use std::sync::Arc;
use uuid::Uuid;

use super::repository::ExpenseRepository;
use crate::error::PaymentError;
use crate::events::{Event, EventBus, ExpenseApproved};
use crate::models::{Expense, ExpenseStatus};

/// The expense side of the pipeline: approval publishes `ExpenseApproved`,
/// a completed payment marks the expense paid.
pub struct ExpenseService {
    repository: Arc<dyn ExpenseRepository>,
    bus: Arc<EventBus>,
}

impl ExpenseService {
    pub fn new(repository: Arc<dyn ExpenseRepository>, bus: Arc<EventBus>) -> Self {
        Self { repository, bus }
    }

    pub async fn submit(
        &self,
        user_id: Uuid,
        amount: i64,
        currency: &str,
        description: &str,
    ) -> Result<Expense, PaymentError> {
        if amount <= 0 {
            return Err(PaymentError::Validation("amount must be positive".to_string()));
        }

        let expense = Expense::new(user_id, amount, currency, description);
        self.repository.create(&expense).await?;
        Ok(expense)
    }

    pub async fn get(&self, id: Uuid) -> Result<Expense, PaymentError> {
        self.repository
            .get(id)
            .await?
            .ok_or_else(|| PaymentError::NotFound(format!("expense {id}")))
    }

    /// Approve a pending expense. Payment starts in the background; the
    /// caller sees success regardless of what happens to it.
    pub async fn approve(&self, id: Uuid) -> Result<Expense, PaymentError> {
        let expense = self.get(id).await?;
        if expense.status != ExpenseStatus::Pending {
            return Err(PaymentError::Conflict(format!(
                "expense {id} is {}, only pending expenses can be approved",
                expense.status.as_str()
            )));
        }

        let approved = self
            .repository
            .update_status(id, ExpenseStatus::Approved)
            .await?;

        tracing::info!(
            expense_id = %approved.id,
            user_id = %approved.user_id,
            amount = approved.amount,
            "Expense approved"
        );

        self.bus.publish(Event::new(ExpenseApproved {
            expense_id: approved.id,
            amount: approved.amount,
            user_id: approved.user_id,
            currency: approved.currency.clone(),
        }));

        Ok(approved)
    }

    /// Mark the expense reimbursed. Repeated calls are no-ops.
    pub async fn mark_paid(&self, id: Uuid) -> Result<Expense, PaymentError> {
        let expense = self.get(id).await?;
        if expense.status == ExpenseStatus::Completed {
            tracing::debug!(expense_id = %id, "Expense already completed");
            return Ok(expense);
        }

        let completed = self
            .repository
            .update_status(id, ExpenseStatus::Completed)
            .await?;
        tracing::info!(expense_id = %id, "Expense marked as paid");
        Ok(completed)
    }
}
