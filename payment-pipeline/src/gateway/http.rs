//! HTTP calls to the external gateway and to the webhook receiver.

use reqwest::{Client, RequestBuilder, Response, Url};
use secrecy::{ExposeSecret, Secret};
use serde::de::DeserializeOwned;
use service_core::observability::TracedRequestExt;
use service_core::utils::signature::sign_payload;
use std::time::Duration;

use super::types::{
    GatewayCallback, GatewayEnvelope, GatewayError, GatewayPayment, InitiatePaymentBody,
    PaymentRequest,
};
use crate::config::GatewayConfig;

/// Header carrying `hex(HMAC-SHA256(body))` on webhook deliveries.
pub const SIGNATURE_HEADER: &str = "x-gateway-signature";

#[derive(Clone)]
pub struct GatewayHttp {
    client: Client,
    base_url: Option<String>,
    api_key: Secret<String>,
    initiate_path: String,
    webhook_secret: Option<Secret<String>>,
    payment_timeout: Duration,
    webhook_timeout: Duration,
}

impl GatewayHttp {
    pub fn new(client: Client, config: &GatewayConfig) -> Self {
        Self {
            client,
            base_url: config.base_url.clone(),
            api_key: config.api_key.clone(),
            initiate_path: config.initiate_path.clone(),
            webhook_secret: config.webhook_secret.clone(),
            payment_timeout: config.payment_timeout(),
            webhook_timeout: config.webhook_timeout(),
        }
    }

    /// Whether a real gateway is configured.
    pub fn is_configured(&self) -> bool {
        self.base_url.is_some()
    }

    fn payments_url(&self) -> Result<String, GatewayError> {
        let base = self.base_url.as_deref().ok_or(GatewayError::NotConfigured)?;
        Ok(format!("{}{}", base, self.initiate_path))
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        let key = self.api_key.expose_secret();
        let request = request
            .timeout(self.payment_timeout)
            .with_trace_context();
        if key.is_empty() {
            request
        } else {
            request.bearer_auth(key)
        }
    }

    /// Ask the gateway to start a payout. Bounded by the payment timeout.
    pub async fn initiate(
        &self,
        request: &PaymentRequest,
        callback_url: Option<&str>,
    ) -> Result<GatewayPayment, GatewayError> {
        let url = self.payments_url()?;
        let body = InitiatePaymentBody {
            external_id: &request.external_id,
            amount: request.amount,
            currency: &request.currency,
            description: &request.description,
            callback_url,
        };

        let response = self
            .authorized(self.client.post(&url))
            .json(&body)
            .send()
            .await?;

        let payment: GatewayPayment = read_envelope(response).await?;

        tracing::debug!(
            external_id = %request.external_id,
            gateway_payment_id = %payment.id,
            "Gateway accepted payment"
        );

        Ok(payment)
    }

    /// `GET {payments_url}/{external_id}`, with the id percent-encoded as a
    /// single path segment.
    pub async fn fetch_status(&self, external_id: &str) -> Result<GatewayPayment, GatewayError> {
        let mut url = Url::parse(&self.payments_url()?)
            .map_err(|e| GatewayError::InvalidUrl(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| GatewayError::InvalidUrl("payments url cannot take a path".into()))?
            .pop_if_empty()
            .push(external_id);

        let response = self.authorized(self.client.get(url)).send().await?;
        read_envelope(response).await
    }

    /// POST a result to the webhook receiver, signed when a secret is set.
    pub async fn deliver_callback(
        &self,
        url: &str,
        callback: &GatewayCallback,
    ) -> Result<(), GatewayError> {
        let body =
            serde_json::to_vec(callback).map_err(|e| GatewayError::Decode(e.to_string()))?;

        let mut request = self
            .client
            .post(url)
            .timeout(self.webhook_timeout)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .with_trace_context();

        if let Some(secret) = &self.webhook_secret {
            let signature = sign_payload(secret.expose_secret(), &body)
                .map_err(|e| GatewayError::Decode(e.to_string()))?;
            request = request.header(SIGNATURE_HEADER, signature);
        }

        let response = request.body(body).send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(GatewayError::Rejected {
                status: status.as_u16(),
                body,
            })
        }
    }
}

async fn read_envelope<T: DeserializeOwned>(response: Response) -> Result<T, GatewayError> {
    let status = response.status();
    let body = response.text().await?;

    tracing::debug!(status = %status, body = %body, "Gateway response");

    if !status.is_success() {
        return Err(GatewayError::Rejected {
            status: status.as_u16(),
            body,
        });
    }

    serde_json::from_str::<GatewayEnvelope<T>>(&body)
        .map(|envelope| envelope.data)
        .map_err(|e| GatewayError::Decode(format!("{e}: {body}")))
}
