mod common;

use common::{TestApp, EMPLOYEE_ID, MANAGER_ID};
use payment_pipeline::models::PaymentStatus;
use uuid::Uuid;

#[tokio::test]
async fn retry_requires_caller_identity() {
    let app = TestApp::spawn().await;

    let response = app
        .client
        .post(format!("{}/expenses/{}/payment/retry", app.address, Uuid::new_v4()))
        .send()
        .await
        .expect("Failed to execute request");

    assert_eq!(response.status().as_u16(), 401);

    app.stop().await;
}

#[tokio::test]
async fn employees_cannot_retry_payments() {
    let app = TestApp::spawn().await;

    let response = app.post_retry(Uuid::new_v4(), EMPLOYEE_ID, "employee").await;
    assert_eq!(response.status().as_u16(), 403);

    app.stop().await;
}

#[tokio::test]
async fn retry_for_expense_without_payment_is_not_found() {
    let app = TestApp::spawn().await;

    let response = app.post_retry(Uuid::new_v4(), MANAGER_ID, "manager").await;
    assert_eq!(response.status().as_u16(), 404);

    app.stop().await;
}

#[tokio::test]
async fn successful_payment_is_not_retryable() {
    let app = TestApp::spawn().await;
    let expense = app.approved_expense(250_000).await;

    let settled = app
        .wait_for_payment(expense.id, |p| p.status == PaymentStatus::Success)
        .await;
    assert!(settled.is_some(), "payment never settled");

    let response = app.post_retry(expense.id, MANAGER_ID, "manager").await;
    assert_eq!(response.status().as_u16(), 400);

    app.stop().await;
}

#[tokio::test]
async fn manager_retries_failed_payment() {
    let app = TestApp::builder().success_rate(0.0).spawn().await;
    let expense = app.approved_expense(75_000).await;

    let failed = app
        .wait_for_payment(expense.id, |p| p.status == PaymentStatus::Failed)
        .await;
    assert!(failed.is_some(), "payment never failed");

    let response = app.post_retry(expense.id, MANAGER_ID, "Manager").await;
    assert_eq!(response.status().as_u16(), 200);

    let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(body["payment"]["retry_count"], 1);
    assert_eq!(body["payment"]["expense_id"], expense.id.to_string());

    app.stop().await;
}

#[tokio::test]
async fn payment_lookup_endpoints() {
    let app = TestApp::spawn().await;
    let expense = app.approved_expense(40_000).await;

    let created = app.wait_for_payment(expense.id, |_| true).await;
    assert!(created.is_some(), "payment never created");

    let response = app
        .client
        .get(format!("{}/expenses/{}/payment", app.address, expense.id))
        .send()
        .await
        .expect("Failed to execute request");
    assert_eq!(response.status().as_u16(), 200);
    let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    let external_id = body["external_id"]
        .as_str()
        .expect("external_id missing")
        .to_string();
    assert_eq!(body["amount"], 40_000);

    let response = app
        .client
        .get(format!("{}/payments/{}", app.address, external_id))
        .send()
        .await
        .expect("Failed to execute request");
    assert_eq!(response.status().as_u16(), 200);

    let response = app
        .client
        .get(format!("{}/payments/exp_unknown", app.address))
        .send()
        .await
        .expect("Failed to execute request");
    assert_eq!(response.status().as_u16(), 404);

    app.stop().await;
}
