//! Payment processor boundary.
//!
//! The billing core only ever looks at a charge's status and reference id; everything
//! processor-specific stays behind `PaymentGateway`.

mod mock;
mod stripe;

pub use mock::MockPaymentGateway;
pub use stripe::StripeGateway;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Payment processor not configured")]
    NotConfigured,

    #[error("Payment processor request failed: {0}")]
    Request(String),

    #[error("Payment processor returned {status}: {message}")]
    Api { status: u16, message: String },
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        GatewayError::Request(err.to_string())
    }
}

/// Status of an off-session charge as reported by the processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChargeStatus {
    Succeeded,
    Processing,
    RequiresAction,
    RequiresPaymentMethod,
    Other(String),
}

impl ChargeStatus {
    pub fn parse(s: &str) -> Self {
        match s {
            "succeeded" => ChargeStatus::Succeeded,
            "processing" => ChargeStatus::Processing,
            "requires_action" => ChargeStatus::RequiresAction,
            "requires_payment_method" => ChargeStatus::RequiresPaymentMethod,
            other => ChargeStatus::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ChargeStatus::Succeeded => "succeeded",
            ChargeStatus::Processing => "processing",
            ChargeStatus::RequiresAction => "requires_action",
            ChargeStatus::RequiresPaymentMethod => "requires_payment_method",
            ChargeStatus::Other(s) => s,
        }
    }

    /// Succeeded or still settling; either way the money is considered taken.
    pub fn is_accepted(&self) -> bool {
        matches!(self, ChargeStatus::Succeeded | ChargeStatus::Processing)
    }

    pub fn requires_customer(&self) -> bool {
        matches!(
            self,
            ChargeStatus::RequiresAction | ChargeStatus::RequiresPaymentMethod
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeRequest {
    pub customer_id: String,
    pub payment_method_id: String,
    pub amount_minor_units: i64,
    pub currency: String,
    pub description: Option<String>,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeOutcome {
    pub status: ChargeStatus,
    pub charge_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CardDetails {
    pub brand: Option<String>,
    pub last_four: Option<String>,
    pub exp_month: Option<i32>,
    pub exp_year: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupIntent {
    pub id: String,
    /// Processor customer the intent was created for.
    pub customer_id: Option<String>,
    pub client_secret: Option<String>,
    pub status: String,
    pub payment_method_id: Option<String>,
    pub card: Option<CardDetails>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Refund {
    pub refund_id: String,
    pub status: String,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Returns the processor's customer id.
    async fn create_customer(&self, email: &str, name: Option<&str>) -> Result<String, GatewayError>;

    async fn create_setup_intent(&self, customer_id: &str) -> Result<SetupIntent, GatewayError>;

    async fn retrieve_setup_intent(&self, setup_intent_id: &str)
        -> Result<SetupIntent, GatewayError>;

    /// Charge a saved payment method without the customer present.
    ///
    /// Declines are reported through `ChargeOutcome::status`, not as errors.
    async fn charge_off_session(&self, request: &ChargeRequest)
        -> Result<ChargeOutcome, GatewayError>;

    async fn refund_charge(
        &self,
        charge_id: &str,
        idempotency_key: Option<&str>,
    ) -> Result<Refund, GatewayError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn processing_counts_as_accepted() {
        assert!(ChargeStatus::parse("processing").is_accepted());
        assert!(ChargeStatus::parse("requires_action").requires_customer());
        let canceled = ChargeStatus::parse("canceled");
        assert!(!canceled.is_accepted() && !canceled.requires_customer());
        assert_eq!(canceled.as_str(), "canceled");
    }
}
