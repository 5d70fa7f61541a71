use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use rust_decimal::Decimal;
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::responses::RequestMeta;

pub const E_VALIDATION: &str = "VALIDATION";
pub const E_DB_FAILURE: &str = "DB_FAILURE";
pub const E_LINK_NOT_FOUND: &str = "LINK_NOT_FOUND";
pub const E_LINK_INACTIVE: &str = "LINK_INACTIVE";
pub const E_LINK_EXPIRED: &str = "LINK_EXPIRED";
pub const E_LINK_LIMIT: &str = "LINK_LIMIT_EXCEEDED";
pub const E_SLUG_TAKEN: &str = "SLUG_TAKEN";
pub const E_HAS_CONVERSIONS: &str = "HAS_CONVERSIONS";
pub const E_NOT_FOUND: &str = "NOT_FOUND";
pub const E_NOT_OWNER: &str = "NOT_OWNER";
pub const E_INSUFFICIENT_BALANCE: &str = "INSUFFICIENT_BALANCE";
pub const E_BELOW_MINIMUM: &str = "BELOW_MINIMUM_WITHDRAWAL";
pub const E_WITHDRAWAL_PENDING_CONFLICT: &str = "WITHDRAWAL_PENDING_CONFLICT";
pub const E_ALREADY_PROCESSED: &str = "ALREADY_PROCESSED";

/// A failure of one of the core operations. Every variant maps to a stable
/// HTTP status and error code; nothing here leaks raw storage errors to the
/// caller.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("affiliate link not found")]
    LinkNotFound,

    #[error("affiliate link is inactive")]
    LinkInactive,

    #[error("affiliate link has expired")]
    LinkExpired,

    #[error("slug is already taken")]
    SlugTaken,

    #[error("active link limit reached")]
    LinkLimitExceeded,

    #[error("link has recorded conversions; deactivate it instead")]
    HasConversions,

    #[error("account not found")]
    AccountNotFound,

    #[error("bank account not found for this account")]
    BankAccountNotFound,

    #[error("commission not found")]
    CommissionNotFound,

    #[error("withdrawal not found")]
    WithdrawalNotFound,

    #[error("insufficient available balance")]
    InsufficientBalance,

    #[error("amount is below the minimum withdrawal of {minimum}")]
    BelowMinimumWithdrawal { minimum: Decimal },

    #[error("a pending withdrawal already exists for this account")]
    PendingWithdrawalConflict,

    #[error("request has already been processed")]
    AlreadyProcessed,

    #[error("caller does not own this record")]
    NotOwner,

    #[error("{0}")]
    Validation(String),

    #[error("database error")]
    Db(#[from] sqlx::Error),
}

impl CoreError {
    /// True when the given sqlx error is a Postgres unique violation
    /// (SQLSTATE 23505).
    pub fn is_unique_violation(e: &sqlx::Error) -> bool {
        if let sqlx::Error::Database(db_err) = e {
            return db_err.code().as_deref() == Some("23505");
        }
        false
    }

    pub fn into_api(self, meta: RequestMeta) -> ApiErrorWithMeta {
        let (error, code) = match self {
            CoreError::LinkNotFound => (ApiError::NotFound(self.to_string()), E_LINK_NOT_FOUND),
            CoreError::LinkInactive => (ApiError::UnprocessableEntity(self.to_string()), E_LINK_INACTIVE),
            CoreError::LinkExpired => (ApiError::UnprocessableEntity(self.to_string()), E_LINK_EXPIRED),
            CoreError::SlugTaken => (ApiError::Conflict(self.to_string()), E_SLUG_TAKEN),
            CoreError::LinkLimitExceeded => (ApiError::UnprocessableEntity(self.to_string()), E_LINK_LIMIT),
            CoreError::HasConversions => (ApiError::Conflict(self.to_string()), E_HAS_CONVERSIONS),
            CoreError::AccountNotFound
            | CoreError::BankAccountNotFound
            | CoreError::CommissionNotFound
            | CoreError::WithdrawalNotFound => (ApiError::NotFound(self.to_string()), E_NOT_FOUND),
            CoreError::InsufficientBalance => {
                (ApiError::UnprocessableEntity(self.to_string()), E_INSUFFICIENT_BALANCE)
            }
            CoreError::BelowMinimumWithdrawal { .. } => {
                (ApiError::UnprocessableEntity(self.to_string()), E_BELOW_MINIMUM)
            }
            CoreError::PendingWithdrawalConflict => {
                (ApiError::Conflict(self.to_string()), E_WITHDRAWAL_PENDING_CONFLICT)
            }
            CoreError::AlreadyProcessed => (ApiError::Conflict(self.to_string()), E_ALREADY_PROCESSED),
            CoreError::NotOwner => (ApiError::Forbidden(self.to_string()), E_NOT_OWNER),
            CoreError::Validation(msg) => (ApiError::BadRequest(msg), E_VALIDATION),
            CoreError::Db(e) => (ApiError::Internal(e.into()), E_DB_FAILURE),
        };
        error.with_meta(meta).with_code(code)
    }
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Forbidden(String),
    NotFound(String),
    Conflict(String),
    UnprocessableEntity(String),
    Internal(anyhow::Error),
}

#[derive(Debug)]
pub struct ApiErrorWithMeta {
    error: ApiError,
    meta: RequestMeta,
    code: Option<String>,
}

impl ApiError {
    pub fn with_meta(self, meta: RequestMeta) -> ApiErrorWithMeta {
        ApiErrorWithMeta {
            error: self,
            meta,
            code: None,
        }
    }
}

impl ApiErrorWithMeta {
    pub fn with_code(mut self, code: &str) -> Self {
        self.code = Some(code.to_string());
        self
    }
}

impl IntoResponse for ApiErrorWithMeta {
    fn into_response(self) -> Response {
        let (status, error_message) = match self.error {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::UnprocessableEntity(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
            ApiError::Internal(e) => {
                error!("internal error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
        };

        let mut body = json!({
            "request_id": self.meta.request_id,
            "error": error_message,
        });
        if let Some(code) = self.code {
            body["code"] = json!(code);
        }

        (status, Json(body)).into_response()
    }
}
