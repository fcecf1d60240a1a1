use service_core::error::AppError;
use thiserror::Error;

use crate::gateway::GatewayError;
use crate::models::PaymentStatus;
use crate::services::repository::RepositoryError;

/// Seconds a caller should wait after a full job queue.
const QUEUE_FULL_RETRY_AFTER_SECS: u64 = 5;

#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("{0}")]
    Validation(String),

    #[error("payment with external id {0} already exists")]
    DuplicateExternalId(String),

    #[error("payment queue is full, try again later")]
    QueueFull,

    #[error("{0} not found")]
    NotFound(String),

    #[error(
        "payment {external_id} is not eligible for retry (status {status}, {retry_count} retries used)"
    )]
    NotEligibleForRetry {
        external_id: String,
        status: PaymentStatus,
        retry_count: u32,
    },

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    Conflict(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error(transparent)]
    Gateway(GatewayError),

    #[error(transparent)]
    Repository(RepositoryError),
}

impl From<RepositoryError> for PaymentError {
    fn from(e: RepositoryError) -> Self {
        match e {
            RepositoryError::DuplicateExternalId(id) => PaymentError::DuplicateExternalId(id),
            RepositoryError::NotFound(what) => PaymentError::NotFound(what),
            RepositoryError::VersionConflict(what) => {
                PaymentError::Conflict(format!("{what} was modified concurrently"))
            }
            e @ RepositoryError::Backend(_) => PaymentError::Repository(e),
        }
    }
}

impl From<GatewayError> for PaymentError {
    fn from(e: GatewayError) -> Self {
        match e {
            GatewayError::Validation(msg) => PaymentError::Validation(msg),
            GatewayError::QueueFull => PaymentError::QueueFull,
            e => PaymentError::Gateway(e),
        }
    }
}

impl From<PaymentError> for AppError {
    fn from(e: PaymentError) -> Self {
        match e {
            PaymentError::Validation(_) | PaymentError::NotEligibleForRetry { .. } => {
                AppError::BadRequest(e.into())
            }
            PaymentError::DuplicateExternalId(_) | PaymentError::Conflict(_) => {
                AppError::Conflict(e.into())
            }
            PaymentError::QueueFull => {
                AppError::TooManyRequests(e.to_string(), Some(QUEUE_FULL_RETRY_AFTER_SECS))
            }
            PaymentError::NotFound(_) => AppError::NotFound(e.into()),
            PaymentError::Forbidden(_) => AppError::Forbidden(e.into()),
            PaymentError::Unauthorized(_) => AppError::Unauthorized(e.into()),
            PaymentError::Gateway(GatewayError::ShuttingDown) => AppError::ServiceUnavailable,
            PaymentError::Gateway(e) => AppError::BadGateway(e.to_string()),
            PaymentError::Repository(e) => AppError::DatabaseError(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    fn status_of(e: PaymentError) -> StatusCode {
        AppError::from(e).status_code()
    }

    #[test]
    fn test_http_mapping() {
        assert_eq!(
            status_of(PaymentError::Validation("amount".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(PaymentError::DuplicateExternalId("x".into())),
            StatusCode::CONFLICT
        );
        assert_eq!(status_of(PaymentError::QueueFull), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            status_of(PaymentError::NotFound("payment".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(PaymentError::NotEligibleForRetry {
                external_id: "x".into(),
                status: PaymentStatus::Success,
                retry_count: 0,
            }),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(PaymentError::Forbidden("managers only".into())),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            status_of(PaymentError::Gateway(GatewayError::Timeout)),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_of(PaymentError::Repository(RepositoryError::Backend(
                anyhow::anyhow!("down")
            ))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_gateway_errors_keep_their_category() {
        assert!(matches!(
            PaymentError::from(GatewayError::QueueFull),
            PaymentError::QueueFull
        ));
        assert!(matches!(
            PaymentError::from(GatewayError::Validation("bad".into())),
            PaymentError::Validation(_)
        ));
        assert!(matches!(
            PaymentError::from(RepositoryError::VersionConflict("payment 1".into())),
            PaymentError::Conflict(_)
        ));
    }
}
