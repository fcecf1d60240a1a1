//! Caller identity extracted from request headers.
//!
//! `X-User-ID` and `X-User-Role` are set by the authenticating proxy in front
//! of this service; they are trusted as-is.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use service_core::error::AppError;

use crate::error::PaymentError;

pub const USER_ID_HEADER: &str = "X-User-ID";
pub const USER_ROLE_HEADER: &str = "X-User-Role";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Employee,
    Manager,
    Admin,
}

impl Role {
    fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "manager" => Role::Manager,
            "admin" => Role::Admin,
            _ => Role::Employee,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CallerContext {
    pub user_id: String,
    pub role: Role,
}

impl CallerContext {
    /// Payment retries are a manager decision.
    pub fn require_manager(&self) -> Result<(), PaymentError> {
        match self.role {
            Role::Manager | Role::Admin => Ok(()),
            Role::Employee => Err(PaymentError::Forbidden(
                "only managers can retry payments".to_string(),
            )),
        }
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for CallerContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| AppError::Unauthorized(anyhow::anyhow!("Missing X-User-ID header")))?;

        let role = parts
            .headers
            .get(USER_ROLE_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(Role::parse)
            .unwrap_or(Role::Employee);

        tracing::Span::current().record("user_id", user_id);

        Ok(CallerContext {
            user_id: user_id.to_string(),
            role,
        })
    }
}
