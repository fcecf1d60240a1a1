//! Inbound payment result callbacks.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use secrecy::ExposeSecret;
use serde::Serialize;
use service_core::error::AppError;
use service_core::utils::signature::verify_payload;

use crate::error::PaymentError;
use crate::gateway::{GatewayCallback, SIGNATURE_HEADER};
use crate::startup::AppState;

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub status: &'static str,
    pub message: String,
}

/// `POST /webhooks/payment`
///
/// 400 for malformed payloads. An unknown `external_id` answers 500 so the
/// sender keeps redelivering.
pub async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<WebhookResponse>), AppError> {
    verify_signature(&state, &headers, &body)?;

    let callback: GatewayCallback = serde_json::from_slice(&body).map_err(|e| {
        tracing::warn!(error = %e, "Malformed payment webhook");
        AppError::BadRequest(anyhow::anyhow!("Invalid webhook payload: {}", e))
    })?;

    tracing::info!(
        external_id = %callback.external_id,
        status = %callback.status,
        gateway_payment_id = %callback.gateway_payment_id,
        "Payment webhook received"
    );

    let outcome = state.webhooks.handle(&callback).await.map_err(|e| match e {
        PaymentError::NotFound(what) => {
            tracing::error!(external_id = %callback.external_id, "Webhook for unknown payment");
            AppError::InternalError(anyhow::anyhow!("{} not found", what))
        }
        e => e.into(),
    })?;

    Ok((
        StatusCode::OK,
        Json(WebhookResponse {
            status: "success",
            message: outcome.message(),
        }),
    ))
}

fn verify_signature(state: &AppState, headers: &HeaderMap, body: &[u8]) -> Result<(), AppError> {
    let Some(secret) = &state.config.gateway.webhook_secret else {
        return Ok(());
    };

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Missing payment webhook signature");
            AppError::Unauthorized(anyhow::anyhow!("Missing webhook signature"))
        })?;

    let valid = verify_payload(secret.expose_secret(), body, signature).map_err(|e| {
        tracing::error!(error = %e, "Webhook signature verification error");
        AppError::InternalError(anyhow::anyhow!("Webhook verification failed"))
    })?;

    if !valid {
        tracing::warn!("Invalid payment webhook signature");
        return Err(AppError::Unauthorized(anyhow::anyhow!(
            "Invalid webhook signature"
        )));
    }

    Ok(())
}
