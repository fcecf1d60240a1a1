//! Wire and job types shared by the gateway client, its workers and the
//! webhook endpoint.

use serde::{Deserialize, Serialize};
use std::time::Instant;
use thiserror::Error;
use validator::{Validate, ValidationError};

/// Rejects empty and whitespace-only external ids.
pub fn require_external_id(external_id: &str) -> Result<(), ValidationError> {
    if external_id.trim().is_empty() {
        let mut error = ValidationError::new("blank");
        error.message = Some("external_id is required".into());
        return Err(error);
    }
    Ok(())
}

/// A payout the caller wants the gateway to execute.
#[derive(Debug, Clone, Serialize, Validate)]
pub struct PaymentRequest {
    #[validate(custom(function = "require_external_id"))]
    pub external_id: String,
    /// Amount in minor currency units.
    #[validate(range(min = 1, message = "amount must be positive"))]
    pub amount: i64,
    pub currency: String,
    pub description: String,
}

/// What the worker knows about the gateway-side payment when it picks a job up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayReference {
    /// Id handed out by the gateway (or simulated when no gateway is configured).
    Assigned(String),
    /// Initiation failed at submission time; the worker initiates later.
    Deferred,
}

impl GatewayReference {
    pub fn id(&self) -> Option<&str> {
        match self {
            GatewayReference::Assigned(id) => Some(id),
            GatewayReference::Deferred => None,
        }
    }
}

/// Unit of work on the job queue. Never persisted.
#[derive(Debug, Clone)]
pub struct PaymentJob {
    pub request: PaymentRequest,
    pub reference: GatewayReference,
    pub enqueued_at: Instant,
}

/// Returned by `process_payment` once a job is on the queue. Stored as the
/// payment's `gateway_response` until the callback arrives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentAcceptance {
    pub external_id: String,
    pub gateway_payment_id: Option<String>,
    pub status: String,
    pub message: String,
}

/// Callback body, both as delivered by workers and as accepted by the
/// webhook endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayCallback {
    #[serde(default)]
    pub external_id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub gateway_payment_id: String,
    #[serde(default)]
    pub amount: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

/// Body of the gateway's initiation endpoint.
#[derive(Debug, Serialize)]
pub struct InitiatePaymentBody<'a> {
    pub external_id: &'a str,
    pub amount: i64,
    pub currency: &'a str,
    pub description: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
pub struct GatewayEnvelope<T> {
    pub data: T,
}

/// The gateway's view of a payment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayPayment {
    pub id: String,
    #[serde(default)]
    pub external_id: String,
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid payment request: {0}")]
    Validation(String),

    #[error("payment queue is full, try again later")]
    QueueFull,

    #[error("payment gateway client is shutting down")]
    ShuttingDown,

    #[error("payment gateway is not configured")]
    NotConfigured,

    #[error("payment gateway timed out")]
    Timeout,

    #[error("payment gateway returned {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("payment gateway unreachable: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("unexpected payment gateway response: {0}")]
    Decode(String),

    #[error("invalid payment gateway url: {0}")]
    InvalidUrl(String),
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            GatewayError::Timeout
        } else if e.is_decode() {
            GatewayError::Decode(e.to_string())
        } else {
            GatewayError::Transport(e)
        }
    }
}

impl From<validator::ValidationErrors> for GatewayError {
    fn from(e: validator::ValidationErrors) -> Self {
        GatewayError::Validation(e.to_string())
    }
}

impl GatewayError {
    /// Worth retrying: the gateway may answer differently next time.
    pub fn is_transient(&self) -> bool {
        match self {
            GatewayError::Timeout | GatewayError::Transport(_) => true,
            GatewayError::Rejected { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}
