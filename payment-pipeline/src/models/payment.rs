use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Number of manager-initiated retries a failed payment may receive.
pub const MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Success,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Success => "success",
            PaymentStatus::Failed => "failed",
        }
    }

    /// Whether the gateway has reached a final verdict for the current attempt.
    pub fn is_settled(&self) -> bool {
        !matches!(self, PaymentStatus::Pending)
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map a gateway status string onto the internal status.
///
/// Matching is case-insensitive. Anything unrecognised, including the empty
/// string, is an intermediate state and maps to `Pending`.
pub fn map_external_status(status: &str) -> PaymentStatus {
    match status.trim().to_ascii_lowercase().as_str() {
        "success" | "completed" | "paid" => PaymentStatus::Success,
        "failed" | "cancelled" | "declined" => PaymentStatus::Failed,
        _ => PaymentStatus::Pending,
    }
}

/// Fresh idempotency key for a payment attempt on `expense_id`.
pub fn generate_external_id(expense_id: Uuid) -> String {
    format!("exp_{}_{}", expense_id.simple(), Uuid::new_v4().simple())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Payment {
    pub id: Uuid,
    pub expense_id: Uuid,
    pub external_id: String,
    /// Amount in minor currency units.
    pub amount: i64,
    pub status: PaymentStatus,
    pub retry_count: u32,
    /// Last raw payload received from the gateway or its callback.
    pub gateway_response: Option<serde_json::Value>,
    pub failure_reason: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    /// When the current attempt was accepted by the gateway client. Cleared
    /// when a retry re-arms the payment.
    #[serde(default)]
    pub submitted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Bumped on every write; updates are conditional on the version read.
    pub version: i64,
}

impl Payment {
    pub fn new(expense_id: Uuid, external_id: String, amount: i64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            expense_id,
            external_id,
            amount,
            status: PaymentStatus::Pending,
            retry_count: 0,
            gateway_response: None,
            failure_reason: None,
            processed_at: None,
            submitted_at: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    pub fn can_retry(&self) -> bool {
        self.status == PaymentStatus::Failed && self.retry_count < MAX_RETRIES
    }

    /// Failed with the retry budget spent. No transition leaves this state.
    pub fn is_permanently_failed(&self) -> bool {
        self.status == PaymentStatus::Failed && self.retry_count >= MAX_RETRIES
    }

    /// Pending with no job behind it yet. The only state a submission may
    /// start from.
    pub fn is_awaiting_submission(&self) -> bool {
        self.status == PaymentStatus::Pending && self.submitted_at.is_none()
    }

    pub fn apply_update(&mut self, update: &StatusUpdate) {
        let now = Utc::now();
        self.status = update.status;
        if update.submitted {
            self.submitted_at = Some(now);
        }
        if update.refund_retry {
            self.retry_count = self.retry_count.saturating_sub(1);
        }
        if let Some(response) = &update.gateway_response {
            self.gateway_response = Some(response.clone());
        }
        self.failure_reason = update.failure_reason.clone();
        self.processed_at = update.status.is_settled().then_some(now);
        self.updated_at = now;
        self.version += 1;
    }

    /// Consume one retry and put the payment back in flight.
    pub fn rearm_for_retry(&mut self) {
        self.retry_count += 1;
        self.status = PaymentStatus::Pending;
        self.processed_at = None;
        self.submitted_at = None;
        self.updated_at = Utc::now();
        self.version += 1;
    }
}

/// A status transition to persist on a payment.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub status: PaymentStatus,
    pub gateway_response: Option<serde_json::Value>,
    pub failure_reason: Option<String>,
    /// Stamp `submitted_at`: the gateway client took the job.
    pub submitted: bool,
    /// Give back the retry consumed by the attempt this update ends.
    pub refund_retry: bool,
}

impl StatusUpdate {
    pub fn new(status: PaymentStatus) -> Self {
        Self {
            status,
            gateway_response: None,
            failure_reason: None,
            submitted: false,
            refund_retry: false,
        }
    }

    pub fn submitted(mut self) -> Self {
        self.submitted = true;
        self
    }

    pub fn refunding_retry(mut self) -> Self {
        self.refund_retry = true;
        self
    }

    pub fn with_response(mut self, response: serde_json::Value) -> Self {
        self.gateway_response = Some(response);
        self
    }

    pub fn with_failure_reason(mut self, reason: Option<String>) -> Self {
        self.failure_reason = reason;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed_payment(retry_count: u32) -> Payment {
        let mut payment = Payment::new(Uuid::new_v4(), "ext-1".to_string(), 1_000);
        payment.status = PaymentStatus::Failed;
        payment.retry_count = retry_count;
        payment
    }

    #[test]
    fn test_map_external_status() {
        for s in ["SUCCESS", "Completed", "paid", " success "] {
            assert_eq!(map_external_status(s), PaymentStatus::Success, "{s}");
        }
        for s in ["Failed", "CANCELLED", "declined"] {
            assert_eq!(map_external_status(s), PaymentStatus::Failed, "{s}");
        }
        for s in ["", "processing", "pending", "refunded", "succeeded"] {
            assert_eq!(map_external_status(s), PaymentStatus::Pending, "{s}");
        }
    }

    #[test]
    fn test_can_retry_only_failed_under_cap() {
        assert!(failed_payment(0).can_retry());
        assert!(failed_payment(2).can_retry());
        assert!(!failed_payment(3).can_retry());
        assert!(!failed_payment(7).can_retry());

        let mut pending = failed_payment(0);
        pending.status = PaymentStatus::Pending;
        assert!(!pending.can_retry());

        let mut success = failed_payment(0);
        success.status = PaymentStatus::Success;
        assert!(!success.can_retry());
    }

    #[test]
    fn test_permanently_failed() {
        assert!(failed_payment(3).is_permanently_failed());
        assert!(!failed_payment(2).is_permanently_failed());
    }

    #[test]
    fn test_apply_update_sets_processed_at_on_settlement() {
        let mut payment = Payment::new(Uuid::new_v4(), "ext-2".to_string(), 500);

        payment.apply_update(&StatusUpdate::new(PaymentStatus::Pending));
        assert!(payment.processed_at.is_none());
        assert_eq!(payment.version, 1);

        payment.apply_update(
            &StatusUpdate::new(PaymentStatus::Failed)
                .with_response(serde_json::json!({"status": "declined"}))
                .with_failure_reason(Some("card declined".to_string())),
        );
        assert!(payment.processed_at.is_some());
        assert_eq!(payment.failure_reason.as_deref(), Some("card declined"));
        assert_eq!(payment.version, 2);
    }

    #[test]
    fn test_rearm_for_retry() {
        let mut payment = failed_payment(1);
        payment.processed_at = Some(Utc::now());
        payment.submitted_at = Some(Utc::now());

        payment.rearm_for_retry();

        assert_eq!(payment.retry_count, 2);
        assert_eq!(payment.status, PaymentStatus::Pending);
        assert!(payment.processed_at.is_none());
        assert!(payment.is_awaiting_submission());
    }

    #[test]
    fn test_submission_and_refund_flags() {
        let mut payment = Payment::new(Uuid::new_v4(), "ext-3".to_string(), 700);
        assert!(payment.is_awaiting_submission());

        payment.apply_update(&StatusUpdate::new(PaymentStatus::Pending).submitted());
        assert!(payment.submitted_at.is_some());
        assert!(!payment.is_awaiting_submission());

        let mut retried = failed_payment(1);
        retried.rearm_for_retry();
        retried.apply_update(&StatusUpdate::new(PaymentStatus::Failed).refunding_retry());
        assert_eq!(retried.retry_count, 1);
        assert!(retried.can_retry());
    }

    #[test]
    fn test_generated_external_ids_are_unique() {
        let expense_id = Uuid::new_v4();
        assert_ne!(
            generate_external_id(expense_id),
            generate_external_id(expense_id)
        );
    }
}
