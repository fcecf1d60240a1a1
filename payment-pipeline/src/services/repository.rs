//! Persistence contracts for payments and expenses, plus the in-memory
//! backend used by default and in tests.
//!
//! Every payment mutation is conditional on the version the caller read. A
//! stale writer gets [`RepositoryError::VersionConflict`] and must re-read.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{Expense, ExpenseStatus, Payment, StatusUpdate};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("a payment with external id {0} already exists")]
    DuplicateExternalId(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} was modified concurrently")]
    VersionConflict(String),

    #[error("storage backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

impl From<mongodb::error::Error> for RepositoryError {
    fn from(e: mongodb::error::Error) -> Self {
        RepositoryError::Backend(e.into())
    }
}

#[async_trait]
pub trait PaymentRepository: Send + Sync {
    /// Insert a new payment. Fails if `external_id` is taken.
    async fn create(&self, payment: &Payment) -> Result<(), RepositoryError>;

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Payment>, RepositoryError>;

    async fn get_by_external_id(&self, external_id: &str)
        -> Result<Option<Payment>, RepositoryError>;

    /// Most recently created payment for the expense.
    async fn get_latest_by_expense_id(
        &self,
        expense_id: Uuid,
    ) -> Result<Option<Payment>, RepositoryError>;

    /// Apply `update` if the stored version is still `expected_version`.
    /// Returns the payment as written.
    async fn update_status(
        &self,
        id: Uuid,
        expected_version: i64,
        update: &StatusUpdate,
    ) -> Result<Payment, RepositoryError>;

    /// Consume one retry and reset to pending, conditional on `expected_version`.
    async fn increment_retry_count(
        &self,
        id: Uuid,
        expected_version: i64,
    ) -> Result<Payment, RepositoryError>;
}

#[async_trait]
pub trait ExpenseRepository: Send + Sync {
    async fn create(&self, expense: &Expense) -> Result<(), RepositoryError>;

    async fn get(&self, id: Uuid) -> Result<Option<Expense>, RepositoryError>;

    async fn update_status(
        &self,
        id: Uuid,
        status: ExpenseStatus,
    ) -> Result<Expense, RepositoryError>;
}

#[derive(Default)]
pub struct InMemoryPaymentRepository {
    payments: DashMap<Uuid, Payment>,
    by_external_id: DashMap<String, Uuid>,
}

impl InMemoryPaymentRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn mutate<F>(&self, id: Uuid, expected_version: i64, f: F) -> Result<Payment, RepositoryError>
    where
        F: FnOnce(&mut Payment),
    {
        let mut stored = self
            .payments
            .get_mut(&id)
            .ok_or_else(|| RepositoryError::NotFound(format!("payment {id}")))?;

        if stored.version != expected_version {
            return Err(RepositoryError::VersionConflict(format!("payment {id}")));
        }

        f(&mut stored);
        Ok(stored.clone())
    }
}

#[async_trait]
impl PaymentRepository for InMemoryPaymentRepository {
    async fn create(&self, payment: &Payment) -> Result<(), RepositoryError> {
        // The index entry stays locked until the payment row is in place.
        match self.by_external_id.entry(payment.external_id.clone()) {
            Entry::Occupied(_) => Err(RepositoryError::DuplicateExternalId(
                payment.external_id.clone(),
            )),
            Entry::Vacant(slot) => {
                self.payments.insert(payment.id, payment.clone());
                slot.insert(payment.id);
                Ok(())
            }
        }
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Payment>, RepositoryError> {
        Ok(self.payments.get(&id).map(|p| p.clone()))
    }

    async fn get_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Payment>, RepositoryError> {
        let Some(id) = self.by_external_id.get(external_id).map(|id| *id) else {
            return Ok(None);
        };
        self.get_by_id(id).await
    }

    async fn get_latest_by_expense_id(
        &self,
        expense_id: Uuid,
    ) -> Result<Option<Payment>, RepositoryError> {
        Ok(self
            .payments
            .iter()
            .filter(|p| p.expense_id == expense_id)
            .max_by_key(|p| p.created_at)
            .map(|p| p.clone()))
    }

    async fn update_status(
        &self,
        id: Uuid,
        expected_version: i64,
        update: &StatusUpdate,
    ) -> Result<Payment, RepositoryError> {
        self.mutate(id, expected_version, |payment| payment.apply_update(update))
    }

    async fn increment_retry_count(
        &self,
        id: Uuid,
        expected_version: i64,
    ) -> Result<Payment, RepositoryError> {
        self.mutate(id, expected_version, Payment::rearm_for_retry)
    }
}

#[derive(Default)]
pub struct InMemoryExpenseRepository {
    expenses: DashMap<Uuid, Expense>,
}

impl InMemoryExpenseRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExpenseRepository for InMemoryExpenseRepository {
    async fn create(&self, expense: &Expense) -> Result<(), RepositoryError> {
        self.expenses.insert(expense.id, expense.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Expense>, RepositoryError> {
        Ok(self.expenses.get(&id).map(|e| e.clone()))
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: ExpenseStatus,
    ) -> Result<Expense, RepositoryError> {
        let mut expense = self
            .expenses
            .get_mut(&id)
            .ok_or_else(|| RepositoryError::NotFound(format!("expense {id}")))?;
        expense.status = status;
        expense.updated_at = Utc::now();
        Ok(expense.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PaymentStatus;

    fn payment(external_id: &str) -> Payment {
        Payment::new(Uuid::new_v4(), external_id.to_string(), 1_500)
    }

    #[tokio::test]
    async fn test_duplicate_external_id_is_rejected() {
        let repo = InMemoryPaymentRepository::new();
        let first = payment("exp_dup");
        repo.create(&first).await.unwrap();

        let mut second = payment("exp_dup");
        second.amount = 99;
        let err = repo.create(&second).await.unwrap_err();

        assert!(matches!(err, RepositoryError::DuplicateExternalId(_)));
        let stored = repo.get_by_external_id("exp_dup").await.unwrap().unwrap();
        assert_eq!(stored.id, first.id);
        assert_eq!(stored.amount, 1_500);
    }

    #[tokio::test]
    async fn test_concurrent_creates_admit_one() {
        let repo = std::sync::Arc::new(InMemoryPaymentRepository::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let repo = repo.clone();
            handles.push(tokio::spawn(async move {
                repo.create(&payment("exp_race")).await.is_ok()
            }));
        }

        let mut created = 0;
        for handle in handles {
            if handle.await.unwrap() {
                created += 1;
            }
        }
        assert_eq!(created, 1);
    }

    #[tokio::test]
    async fn test_stale_version_conflicts() {
        let repo = InMemoryPaymentRepository::new();
        let p = payment("exp_cas");
        repo.create(&p).await.unwrap();

        let updated = repo
            .update_status(p.id, 0, &StatusUpdate::new(PaymentStatus::Failed))
            .await
            .unwrap();
        assert_eq!(updated.version, 1);

        let err = repo
            .update_status(p.id, 0, &StatusUpdate::new(PaymentStatus::Success))
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::VersionConflict(_)));

        let stored = repo.get_by_id(p.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PaymentStatus::Failed);
    }

    #[tokio::test]
    async fn test_increment_retry_count_rearms() {
        let repo = InMemoryPaymentRepository::new();
        let p = payment("exp_retry");
        repo.create(&p).await.unwrap();
        let failed = repo
            .update_status(p.id, 0, &StatusUpdate::new(PaymentStatus::Failed))
            .await
            .unwrap();

        let rearmed = repo
            .increment_retry_count(p.id, failed.version)
            .await
            .unwrap();

        assert_eq!(rearmed.retry_count, 1);
        assert_eq!(rearmed.status, PaymentStatus::Pending);
    }

    #[tokio::test]
    async fn test_latest_by_expense_id() {
        let repo = InMemoryPaymentRepository::new();
        let expense_id = Uuid::new_v4();

        let older = Payment::new(expense_id, "exp_old".to_string(), 10);
        let mut newer = Payment::new(expense_id, "exp_new".to_string(), 10);
        newer.created_at = older.created_at + chrono::Duration::seconds(1);
        repo.create(&older).await.unwrap();
        repo.create(&newer).await.unwrap();

        let latest = repo.get_latest_by_expense_id(expense_id).await.unwrap();
        assert_eq!(latest.unwrap().external_id, "exp_new");
        assert!(repo
            .get_latest_by_expense_id(Uuid::new_v4())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_unknown_ids() {
        let repo = InMemoryPaymentRepository::new();
        assert!(repo.get_by_external_id("nope").await.unwrap().is_none());
        assert!(matches!(
            repo.increment_retry_count(Uuid::new_v4(), 0).await,
            Err(RepositoryError::NotFound(_))
        ));

        let expenses = InMemoryExpenseRepository::new();
        assert!(matches!(
            expenses
                .update_status(Uuid::new_v4(), ExpenseStatus::Completed)
                .await,
            Err(RepositoryError::NotFound(_))
        ));
    }
}
