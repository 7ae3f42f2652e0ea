//! Invoice model.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// What an invoice bills for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    SubscriptionRenewal,
    AdditionalHours,
    OneTimePurchase,
    Refund,
    CreditAdjustment,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::SubscriptionRenewal => "subscription_renewal",
            TransactionType::AdditionalHours => "additional_hours",
            TransactionType::OneTimePurchase => "one_time_purchase",
            TransactionType::Refund => "refund",
            TransactionType::CreditAdjustment => "credit_adjustment",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "additional_hours" => TransactionType::AdditionalHours,
            "one_time_purchase" => TransactionType::OneTimePurchase,
            "refund" => TransactionType::Refund,
            "credit_adjustment" => TransactionType::CreditAdjustment,
            _ => TransactionType::SubscriptionRenewal,
        }
    }
}

/// Payment status of an invoice. `Paid` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Unpaid,
    Paid,
    Failed,
    Cancelled,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Unpaid => "unpaid",
            PaymentStatus::Paid => "paid",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "paid" => PaymentStatus::Paid,
            "failed" => PaymentStatus::Failed,
            "cancelled" => PaymentStatus::Cancelled,
            _ => PaymentStatus::Unpaid,
        }
    }

    /// Parse the API spelling (`UNPAID`, `paid`, ...).
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "unpaid" => Some(PaymentStatus::Unpaid),
            "paid" => Some(PaymentStatus::Paid),
            "failed" => Some(PaymentStatus::Failed),
            "cancelled" => Some(PaymentStatus::Cancelled),
            _ => None,
        }
    }
}

/// Billing document. Amounts are in minor currency units; `total = subtotal + tax`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Invoice {
    pub invoice_id: Uuid,
    pub invoice_number: String,
    pub user_id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub transaction_type: String,
    pub description: Option<String>,
    pub subtotal: i64,
    pub tax: i64,
    pub total: i64,
    pub hours_purchased: Option<i32>,
    pub currency: String,
    pub status: String,
    pub invoice_date: DateTime<Utc>,
    pub due_date: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
    pub payment_method_id: Option<Uuid>,
    pub external_payment_reference_id: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Invoice {
    pub fn status(&self) -> PaymentStatus {
        PaymentStatus::from_string(&self.status)
    }

    pub fn transaction_type(&self) -> TransactionType {
        TransactionType::from_string(&self.transaction_type)
    }
}

/// The only mutation an invoice accepts after creation.
///
/// Number, amounts, currency and owner are fixed once written.
#[derive(Debug, Clone)]
pub struct InvoiceStatusChange {
    pub status: PaymentStatus,
    pub paid_at: Option<DateTime<Utc>>,
    pub payment_method_id: Option<Uuid>,
    pub external_payment_reference_id: Option<String>,
    pub description: Option<String>,
}

impl InvoiceStatusChange {
    pub fn to(status: PaymentStatus) -> Self {
        Self {
            status,
            paid_at: None,
            payment_method_id: None,
            external_payment_reference_id: None,
            description: None,
        }
    }
}

/// Optional details supplied when an invoice is settled.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PaymentDetails {
    pub external_payment_reference_id: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    /// Method actually charged, when it differs from the one on the invoice.
    pub payment_method_id: Option<Uuid>,
}

/// Filter for payment history.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PaymentHistoryFilter {
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

/// Per-user billing totals in major currency units.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingSummary {
    pub total_paid: Decimal,
    pub total_pending: Decimal,
    pub total_failed: i64,
    pub recent_invoices: Vec<Invoice>,
}

/// Printable invoice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceDocument {
    pub invoice_number: String,
    pub date: DateTime<Utc>,
    pub due_date: DateTime<Utc>,
    pub amount: Decimal,
    pub currency: String,
    pub status: PaymentStatus,
    pub client: InvoiceParty,
    pub items: Vec<InvoiceLine>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceParty {
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceLine {
    pub description: String,
    pub amount: Decimal,
}

/// Convert minor currency units (cents) into major units.
pub fn to_major_units(minor: i64) -> Decimal {
    Decimal::new(minor, 2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn major_units_divide_by_one_hundred() {
        assert_eq!(to_major_units(125_000).to_string(), "1250.00");
        assert_eq!(to_major_units(0), Decimal::ZERO);
    }

    #[test]
    fn payment_status_parse_accepts_api_spelling() {
        assert_eq!(PaymentStatus::parse("PAID"), Some(PaymentStatus::Paid));
        assert_eq!(PaymentStatus::parse("refunded"), None);
    }
}
