//! Time log read model used for usage reporting.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Minutes worked for a client on a project.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TimeLog {
    pub time_log_id: Uuid,
    pub client_id: Uuid,
    pub project_id: Uuid,
    pub project_title: String,
    pub task_name: Option<String>,
    pub duration_minutes: i32,
    pub start_time: DateTime<Utc>,
    pub created_utc: DateTime<Utc>,
}

/// Input for recording worked time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTimeLog {
    pub client_id: Uuid,
    pub project_id: Uuid,
    pub project_title: String,
    pub task_name: Option<String>,
    pub duration_minutes: i32,
    pub start_time: DateTime<Utc>,
}

/// Time logged against one project within a date range.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ProjectUsage {
    pub project_id: Uuid,
    pub project_title: String,
    pub total_minutes: i64,
    pub total_hours: Decimal,
}

/// Hours with one decimal place, as shown on usage reports.
pub fn minutes_to_hours(minutes: i64) -> Decimal {
    (Decimal::from(minutes) / Decimal::from(60)).round_dp(1)
}
