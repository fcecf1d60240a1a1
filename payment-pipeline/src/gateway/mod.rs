//! Client for the external payment gateway.

pub mod client;
pub mod http;
pub mod types;
mod worker;

use async_trait::async_trait;

pub use client::PaymentGatewayClient;
pub use http::SIGNATURE_HEADER;
pub use types::{
    GatewayCallback, GatewayError, GatewayPayment, GatewayReference, PaymentAcceptance,
    PaymentJob, PaymentRequest,
};

/// The gateway as seen by the payment service.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn process_payment(
        &self,
        request: PaymentRequest,
    ) -> Result<PaymentAcceptance, GatewayError>;

    async fn get_payment_status(&self, external_id: &str) -> Result<GatewayPayment, GatewayError>;
}
