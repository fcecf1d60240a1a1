//! Payment read and retry endpoints.

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;
use service_core::error::AppError;
use uuid::Uuid;

use crate::gateway::GatewayPayment;
use crate::middleware::CallerContext;
use crate::models::Payment;
use crate::startup::AppState;

#[derive(Debug, Serialize)]
pub struct RetryResponse {
    pub message: String,
    pub payment: Payment,
}

/// `POST /expenses/:expense_id/payment/retry`, managers only.
pub async fn retry_payment(
    State(state): State<AppState>,
    caller: CallerContext,
    Path(expense_id): Path<Uuid>,
) -> Result<Json<RetryResponse>, AppError> {
    caller.require_manager()?;

    tracing::info!(
        expense_id = %expense_id,
        user_id = %caller.user_id,
        "Payment retry requested"
    );

    let payment = state.payments.retry_for_expense(expense_id).await?;

    Ok(Json(RetryResponse {
        message: format!("payment retry {} submitted", payment.retry_count),
        payment,
    }))
}

/// `GET /expenses/:expense_id/payment`
pub async fn get_expense_payment(
    State(state): State<AppState>,
    Path(expense_id): Path<Uuid>,
) -> Result<Json<Payment>, AppError> {
    Ok(Json(state.payments.get_payment_by_expense_id(expense_id).await?))
}

/// `GET /payments/:external_id`
pub async fn get_payment(
    State(state): State<AppState>,
    Path(external_id): Path<String>,
) -> Result<Json<Payment>, AppError> {
    Ok(Json(
        state.payments.get_payment_by_external_id(&external_id).await?,
    ))
}

/// `GET /payments/:external_id/gateway-status`
pub async fn get_gateway_status(
    State(state): State<AppState>,
    Path(external_id): Path<String>,
) -> Result<Json<GatewayPayment>, AppError> {
    Ok(Json(state.payments.gateway_status(&external_id).await?))
}
