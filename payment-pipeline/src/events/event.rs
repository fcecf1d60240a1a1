use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::models::PaymentStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "expense.approved")]
    ExpenseApproved,
    #[serde(rename = "payment.completed")]
    PaymentCompleted,
    #[serde(rename = "payment.failed")]
    PaymentFailed,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::ExpenseApproved => "expense.approved",
            EventType::PaymentCompleted => "payment.completed",
            EventType::PaymentFailed => "payment.failed",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An expense became payable (auto or manual approval).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpenseApproved {
    pub expense_id: Uuid,
    pub amount: i64,
    pub user_id: Uuid,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentCompleted {
    pub payment_id: Uuid,
    pub expense_id: Uuid,
    pub external_id: String,
    pub amount: i64,
    pub status: PaymentStatus,
    pub gateway_payment_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentFailed {
    pub payment_id: Uuid,
    pub expense_id: Uuid,
    pub external_id: String,
    pub amount: i64,
    pub failure_reason: String,
    pub retry_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    ExpenseApproved(ExpenseApproved),
    PaymentCompleted(PaymentCompleted),
    PaymentFailed(PaymentFailed),
}

impl From<ExpenseApproved> for EventPayload {
    fn from(payload: ExpenseApproved) -> Self {
        EventPayload::ExpenseApproved(payload)
    }
}

impl From<PaymentCompleted> for EventPayload {
    fn from(payload: PaymentCompleted) -> Self {
        EventPayload::PaymentCompleted(payload)
    }
}

impl From<PaymentFailed> for EventPayload {
    fn from(payload: PaymentFailed) -> Self {
        EventPayload::PaymentFailed(payload)
    }
}

/// A domain event as it travels through the bus.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub occurred_at: DateTime<Utc>,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(payload: impl Into<EventPayload>) -> Self {
        let payload = payload.into();
        let event_type = match &payload {
            EventPayload::ExpenseApproved(_) => EventType::ExpenseApproved,
            EventPayload::PaymentCompleted(_) => EventType::PaymentCompleted,
            EventPayload::PaymentFailed(_) => EventType::PaymentFailed,
        };

        Self {
            id: Uuid::new_v4(),
            event_type,
            occurred_at: Utc::now(),
            payload,
        }
    }

    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    /// The payload as a loosely typed field map, for logging and generic consumers.
    pub fn payload_map(&self) -> serde_json::Map<String, serde_json::Value> {
        match serde_json::to_value(&self.payload) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        }
    }
}
