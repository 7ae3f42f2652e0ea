//! Billing view of a portal user.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// The slice of a user account the billing core needs.
///
/// Accounts are owned by the identity system; this row only mirrors contact
/// details and the payment processor's customer reference.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Customer {
    pub user_id: Uuid,
    pub email: String,
    pub full_name: Option<String>,
    pub external_customer_id: Option<String>,
    pub created_utc: DateTime<Utc>,
}
