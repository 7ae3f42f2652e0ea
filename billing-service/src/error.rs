//! Domain errors for billing-service.
//!
//! Every failure a billing operation can surface is a `BillingError` variant with a
//! stable machine code. Storage-level failures keep their `AppError` so the HTTP layer
//! can still tell a unique-key conflict from a lost connection.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use service_core::error::AppError;
use thiserror::Error;

/// Broad error classes used to pick a transport status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    InvalidState,
    ExternalDependency,
    Unauthorized,
    Internal,
}

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("User not found")]
    UserNotFound,

    #[error("User has no payment processor customer reference")]
    NoCustomerReference,

    #[error("User has no default payment method")]
    NoPaymentMethod,

    #[error("Unknown plan: {0}")]
    UnknownPlan(String),

    #[error("Enterprise plan requires a custom price")]
    EnterpriseRequiresCustomPrice,

    #[error("Subscription not found")]
    SubscriptionNotFound,

    #[error("No active subscription found")]
    NoActiveSubscription,

    #[error("User already has an active subscription")]
    SubscriptionAlreadyActive,

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Field cannot be changed after creation: {0}")]
    ImmutableField(&'static str),

    #[error("Hours balance not found")]
    BalanceNotFound,

    #[error("No active hours balance found")]
    NoActiveBalance,

    #[error("Usage of {requested} hours exceeds the {remaining} hours remaining")]
    UsageLimitExceeded {
        requested: rust_decimal::Decimal,
        remaining: rust_decimal::Decimal,
    },

    #[error("Invoice not found")]
    InvoiceNotFound,

    #[error("Invoice is already paid")]
    AlreadyPaid,

    #[error("Not authorized to access this resource")]
    Unauthorized,

    #[error("Payment method not found")]
    PaymentMethodNotFound,

    #[error("Notification not found")]
    NotificationNotFound,

    #[error("Cannot delete the only payment method while a subscription is active")]
    LastPaymentMethod,

    #[error("Payment requires customer authentication")]
    PaymentRequiresAuthentication,

    #[error("Payment failed with status: {0}")]
    PaymentFailed(String),

    #[error("Payment processor error: {0}")]
    Gateway(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error(transparent)]
    Storage(#[from] AppError),
}

impl BillingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BillingError::UserNotFound
            | BillingError::SubscriptionNotFound
            | BillingError::BalanceNotFound
            | BillingError::InvoiceNotFound
            | BillingError::PaymentMethodNotFound
            | BillingError::NotificationNotFound => ErrorKind::NotFound,
            BillingError::NoCustomerReference
            | BillingError::NoPaymentMethod
            | BillingError::UnknownPlan(_)
            | BillingError::EnterpriseRequiresCustomPrice
            | BillingError::NoActiveSubscription
            | BillingError::SubscriptionAlreadyActive
            | BillingError::InvalidTransition(_)
            | BillingError::ImmutableField(_)
            | BillingError::NoActiveBalance
            | BillingError::UsageLimitExceeded { .. }
            | BillingError::AlreadyPaid
            | BillingError::LastPaymentMethod
            | BillingError::Validation(_) => ErrorKind::InvalidState,
            BillingError::PaymentRequiresAuthentication
            | BillingError::PaymentFailed(_)
            | BillingError::Gateway(_) => ErrorKind::ExternalDependency,
            BillingError::Unauthorized => ErrorKind::Unauthorized,
            BillingError::Storage(_) => ErrorKind::Internal,
        }
    }

    /// Stable code rendered to API clients.
    pub fn code(&self) -> &'static str {
        match self {
            BillingError::UserNotFound => "user_not_found",
            BillingError::NoCustomerReference => "no_customer_reference",
            BillingError::NoPaymentMethod => "no_payment_method",
            BillingError::UnknownPlan(_) => "unknown_plan",
            BillingError::EnterpriseRequiresCustomPrice => "enterprise_requires_custom_price",
            BillingError::SubscriptionNotFound => "subscription_not_found",
            BillingError::NoActiveSubscription => "no_active_subscription",
            BillingError::SubscriptionAlreadyActive => "subscription_already_active",
            BillingError::InvalidTransition(_) => "invalid_transition",
            BillingError::ImmutableField(_) => "immutable_field",
            BillingError::BalanceNotFound => "balance_not_found",
            BillingError::NoActiveBalance => "no_active_balance",
            BillingError::UsageLimitExceeded { .. } => "usage_limit_exceeded",
            BillingError::InvoiceNotFound => "invoice_not_found",
            BillingError::AlreadyPaid => "already_paid",
            BillingError::Unauthorized => "unauthorized",
            BillingError::PaymentMethodNotFound => "payment_method_not_found",
            BillingError::NotificationNotFound => "notification_not_found",
            BillingError::LastPaymentMethod => "last_payment_method",
            BillingError::PaymentRequiresAuthentication => "payment_requires_authentication",
            BillingError::PaymentFailed(_) => "payment_failed",
            BillingError::Gateway(_) => "gateway_error",
            BillingError::Validation(_) => "validation_error",
            BillingError::Storage(AppError::Conflict(_)) => "conflict",
            BillingError::Storage(AppError::NotFound(_)) => "missing_reference",
            BillingError::Storage(_) => "storage_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            BillingError::Storage(inner) => inner.status_code(),
            _ => match self.kind() {
                ErrorKind::NotFound => StatusCode::NOT_FOUND,
                ErrorKind::InvalidState => StatusCode::BAD_REQUEST,
                ErrorKind::ExternalDependency => StatusCode::PAYMENT_REQUIRED,
                ErrorKind::Unauthorized => StatusCode::FORBIDDEN,
                ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for BillingError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct ErrorResponse {
            error: String,
            code: &'static str,
        }

        let status = self.status_code();
        let code = self.code();
        let error = match &self {
            BillingError::Storage(AppError::Conflict(err) | AppError::NotFound(err)) => {
                err.to_string()
            }
            BillingError::Storage(e) => {
                tracing::error!(error = %e, "Storage failure");
                "Internal server error".to_string()
            }
            BillingError::Gateway(msg) => {
                tracing::warn!(error = %msg, "Payment processor failure");
                self.to_string()
            }
            _ => self.to_string(),
        };

        (status, Json(ErrorResponse { error, code })).into_response()
    }
}

impl From<validator::ValidationErrors> for BillingError {
    fn from(err: validator::ValidationErrors) -> Self {
        BillingError::Validation(err.to_string())
    }
}
