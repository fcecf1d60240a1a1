mod common;

use common::TestApp;
use payment_pipeline::gateway::SIGNATURE_HEADER;
use payment_pipeline::models::PaymentStatus;
use serde_json::json;
use service_core::utils::signature::sign_payload;

#[tokio::test]
async fn webhook_rejects_missing_fields() {
    let app = TestApp::spawn().await;

    let response = app
        .post_webhook(&json!({ "external_id": "", "status": "success" }))
        .await;
    assert_eq!(response.status().as_u16(), 400);

    let response = app
        .post_webhook(&json!({ "external_id": "exp_123", "status": "" }))
        .await;
    assert_eq!(response.status().as_u16(), 400);

    app.stop().await;
}

#[tokio::test]
async fn webhook_rejects_malformed_json() {
    let app = TestApp::spawn().await;

    let response = app
        .client
        .post(format!("{}/webhooks/payment", app.address))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .expect("Failed to execute request");

    assert_eq!(response.status().as_u16(), 400);

    app.stop().await;
}

#[tokio::test]
async fn webhook_for_unknown_payment_asks_for_redelivery() {
    let app = TestApp::spawn().await;

    let response = app
        .post_webhook(&json!({ "external_id": "exp_does_not_exist", "status": "success" }))
        .await;

    assert_eq!(response.status().as_u16(), 500);

    app.stop().await;
}

#[tokio::test]
async fn webhook_settles_pending_payment_once() {
    let app = TestApp::spawn().await;
    let payment = app.pending_payment(150_000).await;

    let callback = json!({
        "external_id": payment.external_id,
        "status": "SUCCESS",
        "gateway_payment_id": "gw_001",
        "amount": 150_000,
    });

    let response = app.post_webhook(&callback).await;
    assert_eq!(response.status().as_u16(), 200);
    let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(body["status"], "success");
    assert_eq!(body["message"], "payment updated to success");

    let settled = app
        .state
        .payments
        .get_payment_by_external_id(&payment.external_id)
        .await
        .expect("Failed to load payment");
    assert_eq!(settled.status, PaymentStatus::Success);
    assert!(settled.processed_at.is_some());

    let response = app.post_webhook(&callback).await;
    assert_eq!(response.status().as_u16(), 200);
    let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(body["message"], "payment already success");

    let unchanged = app
        .state
        .payments
        .get_payment_by_external_id(&payment.external_id)
        .await
        .expect("Failed to load payment");
    assert_eq!(unchanged.version, settled.version);
    assert_eq!(unchanged.processed_at, settled.processed_at);

    app.stop().await;
}

#[tokio::test]
async fn webhook_does_not_flip_failed_payment() {
    let app = TestApp::spawn().await;
    let payment = app.pending_payment(90_000).await;

    let response = app
        .post_webhook(&json!({
            "external_id": payment.external_id,
            "status": "failed",
            "failure_reason": "insufficient balance",
        }))
        .await;
    assert_eq!(response.status().as_u16(), 200);

    let response = app
        .post_webhook(&json!({ "external_id": payment.external_id, "status": "success" }))
        .await;
    assert_eq!(response.status().as_u16(), 200);

    let stored = app
        .state
        .payments
        .get_payment_by_external_id(&payment.external_id)
        .await
        .expect("Failed to load payment");
    assert_eq!(stored.status, PaymentStatus::Failed);
    assert_eq!(stored.failure_reason.as_deref(), Some("insufficient balance"));

    app.stop().await;
}

#[tokio::test]
async fn webhook_requires_valid_signature_when_secret_configured() {
    let secret = "whsec_test";
    let app = TestApp::builder().webhook_secret(secret).spawn().await;
    let payment = app.pending_payment(10_000).await;

    let body = serde_json::to_vec(&json!({
        "external_id": payment.external_id,
        "status": "success",
    }))
    .expect("Failed to serialize body");

    let unsigned = app
        .client
        .post(format!("{}/webhooks/payment", app.address))
        .header("content-type", "application/json")
        .body(body.clone())
        .send()
        .await
        .expect("Failed to execute request");
    assert_eq!(unsigned.status().as_u16(), 401);

    let forged = app
        .client
        .post(format!("{}/webhooks/payment", app.address))
        .header("content-type", "application/json")
        .header(SIGNATURE_HEADER, "deadbeef")
        .body(body.clone())
        .send()
        .await
        .expect("Failed to execute request");
    assert_eq!(forged.status().as_u16(), 401);

    let signature = sign_payload(secret, &body).expect("Failed to sign body");
    let signed = app
        .client
        .post(format!("{}/webhooks/payment", app.address))
        .header("content-type", "application/json")
        .header(SIGNATURE_HEADER, signature)
        .body(body)
        .send()
        .await
        .expect("Failed to execute request");
    assert_eq!(signed.status().as_u16(), 200);

    app.stop().await;
}
