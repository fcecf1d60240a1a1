//! MongoDB-backed repositories.

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use mongodb::bson::{self, doc, DateTime as BsonDateTime, Document};
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::{FindOneAndUpdateOptions, FindOneOptions, IndexOptions, ReturnDocument};
use mongodb::{Collection, Database, IndexModel};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::repository::{ExpenseRepository, PaymentRepository, RepositoryError};
use crate::models::{Expense, ExpenseStatus, Payment, PaymentStatus, StatusUpdate};

const DUPLICATE_KEY: i32 = 11000;

#[derive(Debug, Serialize, Deserialize)]
struct PaymentDocument {
    #[serde(rename = "_id")]
    id: String,
    expense_id: String,
    external_id: String,
    amount: i64,
    status: PaymentStatus,
    retry_count: i64,
    gateway_response: Option<serde_json::Value>,
    failure_reason: Option<String>,
    processed_at: Option<BsonDateTime>,
    #[serde(default)]
    submitted_at: Option<BsonDateTime>,
    created_at: BsonDateTime,
    updated_at: BsonDateTime,
    version: i64,
}

impl From<&Payment> for PaymentDocument {
    fn from(p: &Payment) -> Self {
        Self {
            id: p.id.to_string(),
            expense_id: p.expense_id.to_string(),
            external_id: p.external_id.clone(),
            amount: p.amount,
            status: p.status,
            retry_count: i64::from(p.retry_count),
            gateway_response: p.gateway_response.clone(),
            failure_reason: p.failure_reason.clone(),
            processed_at: p.processed_at.map(BsonDateTime::from_chrono),
            submitted_at: p.submitted_at.map(BsonDateTime::from_chrono),
            created_at: BsonDateTime::from_chrono(p.created_at),
            updated_at: BsonDateTime::from_chrono(p.updated_at),
            version: p.version,
        }
    }
}

impl TryFrom<PaymentDocument> for Payment {
    type Error = RepositoryError;

    fn try_from(d: PaymentDocument) -> Result<Self, Self::Error> {
        Ok(Self {
            id: parse_id(&d.id)?,
            expense_id: parse_id(&d.expense_id)?,
            external_id: d.external_id,
            amount: d.amount,
            status: d.status,
            retry_count: u32::try_from(d.retry_count)
                .context("retry_count out of range")?,
            gateway_response: d.gateway_response,
            failure_reason: d.failure_reason,
            processed_at: d.processed_at.map(BsonDateTime::to_chrono),
            submitted_at: d.submitted_at.map(BsonDateTime::to_chrono),
            created_at: d.created_at.to_chrono(),
            updated_at: d.updated_at.to_chrono(),
            version: d.version,
        })
    }
}

fn parse_id(raw: &str) -> Result<Uuid, RepositoryError> {
    Uuid::parse_str(raw)
        .with_context(|| format!("stored id {raw} is not a UUID"))
        .map_err(RepositoryError::from)
}

fn is_duplicate_key(e: &mongodb::error::Error) -> bool {
    matches!(
        &*e.kind,
        ErrorKind::Write(WriteFailure::WriteError(we)) if we.code == DUPLICATE_KEY
    )
}

fn now() -> BsonDateTime {
    BsonDateTime::from_chrono(Utc::now())
}

#[derive(Clone)]
pub struct MongoPaymentRepository {
    collection: Collection<PaymentDocument>,
}

impl MongoPaymentRepository {
    pub fn new(db: &Database) -> Self {
        Self {
            collection: db.collection("payments"),
        }
    }

    pub async fn init_indexes(&self) -> anyhow::Result<()> {
        let external_id_index = IndexModel::builder()
            .keys(doc! { "external_id": 1 })
            .options(
                IndexOptions::builder()
                    .name("external_id_unique".to_string())
                    .unique(true)
                    .build(),
            )
            .build();

        let expense_index = IndexModel::builder()
            .keys(doc! { "expense_id": 1, "created_at": -1 })
            .options(
                IndexOptions::builder()
                    .name("expense_created_idx".to_string())
                    .build(),
            )
            .build();

        self.collection
            .create_indexes([external_id_index, expense_index], None)
            .await?;

        tracing::info!("Payment indexes initialized");
        Ok(())
    }

    async fn find(&self, filter: Document) -> Result<Option<Payment>, RepositoryError> {
        self.collection
            .find_one(filter, None)
            .await?
            .map(Payment::try_from)
            .transpose()
    }

    async fn compare_and_set(
        &self,
        id: Uuid,
        expected_version: i64,
        update: Document,
    ) -> Result<Payment, RepositoryError> {
        let options = FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::After)
            .build();

        let updated = self
            .collection
            .find_one_and_update(
                doc! { "_id": id.to_string(), "version": expected_version },
                update,
                options,
            )
            .await?;

        if let Some(d) = updated {
            return Payment::try_from(d);
        }
        match self.get_by_id(id).await? {
            Some(_) => Err(RepositoryError::VersionConflict(format!("payment {id}"))),
            None => Err(RepositoryError::NotFound(format!("payment {id}"))),
        }
    }
}

#[async_trait]
impl PaymentRepository for MongoPaymentRepository {
    async fn create(&self, payment: &Payment) -> Result<(), RepositoryError> {
        match self
            .collection
            .insert_one(PaymentDocument::from(payment), None)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_duplicate_key(&e) => Err(RepositoryError::DuplicateExternalId(
                payment.external_id.clone(),
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Payment>, RepositoryError> {
        self.find(doc! { "_id": id.to_string() }).await
    }

    async fn get_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Payment>, RepositoryError> {
        self.find(doc! { "external_id": external_id }).await
    }

    async fn get_latest_by_expense_id(
        &self,
        expense_id: Uuid,
    ) -> Result<Option<Payment>, RepositoryError> {
        let options = FindOneOptions::builder()
            .sort(doc! { "created_at": -1 })
            .build();

        self.collection
            .find_one(doc! { "expense_id": expense_id.to_string() }, options)
            .await?
            .map(Payment::try_from)
            .transpose()
    }

    async fn update_status(
        &self,
        id: Uuid,
        expected_version: i64,
        update: &StatusUpdate,
    ) -> Result<Payment, RepositoryError> {
        let timestamp = now();
        let mut set = doc! {
            "status": update.status.as_str(),
            "failure_reason": update.failure_reason.as_deref(),
            "processed_at": update.status.is_settled().then_some(timestamp),
            "updated_at": timestamp,
        };
        if let Some(response) = &update.gateway_response {
            let response = bson::to_bson(response).context("gateway response is not BSON")?;
            set.insert("gateway_response", response);
        }
        if update.submitted {
            set.insert("submitted_at", timestamp);
        }

        let mut inc = doc! { "version": 1 };
        if update.refund_retry {
            inc.insert("retry_count", -1);
        }

        self.compare_and_set(id, expected_version, doc! { "$set": set, "$inc": inc })
            .await
    }

    async fn increment_retry_count(
        &self,
        id: Uuid,
        expected_version: i64,
    ) -> Result<Payment, RepositoryError> {
        self.compare_and_set(
            id,
            expected_version,
            doc! {
                "$set": {
                    "status": PaymentStatus::Pending.as_str(),
                    "processed_at": bson::Bson::Null,
                    "submitted_at": bson::Bson::Null,
                    "updated_at": now(),
                },
                "$inc": { "retry_count": 1, "version": 1 },
            },
        )
        .await
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ExpenseDocument {
    #[serde(rename = "_id")]
    id: String,
    user_id: String,
    amount: i64,
    currency: String,
    description: String,
    status: ExpenseStatus,
    created_at: BsonDateTime,
    updated_at: BsonDateTime,
}

impl From<&Expense> for ExpenseDocument {
    fn from(e: &Expense) -> Self {
        Self {
            id: e.id.to_string(),
            user_id: e.user_id.to_string(),
            amount: e.amount,
            currency: e.currency.clone(),
            description: e.description.clone(),
            status: e.status,
            created_at: BsonDateTime::from_chrono(e.created_at),
            updated_at: BsonDateTime::from_chrono(e.updated_at),
        }
    }
}

impl TryFrom<ExpenseDocument> for Expense {
    type Error = RepositoryError;

    fn try_from(d: ExpenseDocument) -> Result<Self, Self::Error> {
        Ok(Self {
            id: parse_id(&d.id)?,
            user_id: parse_id(&d.user_id)?,
            amount: d.amount,
            currency: d.currency,
            description: d.description,
            status: d.status,
            created_at: d.created_at.to_chrono(),
            updated_at: d.updated_at.to_chrono(),
        })
    }
}

#[derive(Clone)]
pub struct MongoExpenseRepository {
    collection: Collection<ExpenseDocument>,
}

impl MongoExpenseRepository {
    pub fn new(db: &Database) -> Self {
        Self {
            collection: db.collection("expenses"),
        }
    }
}

#[async_trait]
impl ExpenseRepository for MongoExpenseRepository {
    async fn create(&self, expense: &Expense) -> Result<(), RepositoryError> {
        self.collection
            .insert_one(ExpenseDocument::from(expense), None)
            .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Expense>, RepositoryError> {
        self.collection
            .find_one(doc! { "_id": id.to_string() }, None)
            .await?
            .map(Expense::try_from)
            .transpose()
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: ExpenseStatus,
    ) -> Result<Expense, RepositoryError> {
        let options = FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::After)
            .build();

        self.collection
            .find_one_and_update(
                doc! { "_id": id.to_string() },
                doc! { "$set": { "status": status.as_str(), "updated_at": now() } },
                options,
            )
            .await?
            .ok_or_else(|| RepositoryError::NotFound(format!("expense {id}")))
            .and_then(Expense::try_from)
    }
}
