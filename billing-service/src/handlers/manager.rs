//! Account-manager routes for driving billing on behalf of clients.

use crate::error::BillingError;
use crate::handlers::auth::ManagerContext;
use crate::models::{
    Customer, HoursBalance, HoursBalanceView, Invoice, NewTimeLog, Subscription, TimeLog,
};
use crate::services::ActivationResult;
use crate::startup::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/clients/:user_id", put(sync_customer))
        .route(
            "/clients/:user_id/subscription/activate",
            post(activate_subscription),
        )
        .route("/clients/:user_id/hours/reset", post(reset_hours))
        .route("/subscriptions/:id/pause", post(pause_subscription))
        .route("/subscriptions/:id/resume", post(resume_subscription))
        .route("/subscriptions/:id/renew", post(renew_subscription))
        .route("/invoices/:id/pay", post(pay_invoice))
        .route("/invoices/:id/fail", post(fail_invoice))
        .route("/time-logs", post(record_time_entry))
}

#[derive(Debug, Deserialize, Validate)]
pub struct SyncCustomerRequest {
    #[validate(email(message = "Invalid email address"), length(max = 255))]
    pub email: String,
    #[validate(length(min = 1, max = 200))]
    pub full_name: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ActivateRequest {
    #[validate(length(min = 1, max = 32))]
    pub plan: String,
    #[validate(range(min = 1))]
    pub custom_price_amount: Option<i64>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct FailInvoiceRequest {
    #[validate(length(max = 500))]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct TimeEntryRequest {
    pub client_id: Uuid,
    pub project_id: Uuid,
    #[validate(length(min = 1, max = 200))]
    pub project_title: String,
    #[validate(length(max = 200))]
    pub task_name: Option<String>,
    #[validate(range(min = 1, max = 1440))]
    pub duration_minutes: i32,
    pub start_time: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct ResetResponse {
    pub balance: Option<HoursBalance>,
}

#[derive(Debug, Serialize)]
pub struct TimeEntryResponse {
    pub time_log: TimeLog,
    pub balance: Option<HoursBalanceView>,
}

async fn sync_customer(
    State(state): State<AppState>,
    ManagerContext(auth): ManagerContext,
    Path(user_id): Path<Uuid>,
    Json(req): Json<SyncCustomerRequest>,
) -> Result<Json<Customer>, BillingError> {
    req.validate()?;
    tracing::info!(manager_id = %auth.user_id, user_id = %user_id, "Customer sync requested");
    Ok(Json(
        state
            .services
            .payment_methods
            .sync_customer(user_id, &req.email, req.full_name.as_deref())
            .await?,
    ))
}

async fn activate_subscription(
    State(state): State<AppState>,
    ManagerContext(auth): ManagerContext,
    Path(user_id): Path<Uuid>,
    Json(req): Json<ActivateRequest>,
) -> Result<(StatusCode, Json<ActivationResult>), BillingError> {
    req.validate()?;
    tracing::info!(manager_id = %auth.user_id, user_id = %user_id, plan = %req.plan, "Activation requested");
    let result = state
        .services
        .orchestrator
        .activate_subscription(user_id, &req.plan, req.custom_price_amount)
        .await?;
    Ok((StatusCode::CREATED, Json(result)))
}

async fn reset_hours(
    State(state): State<AppState>,
    ManagerContext(_auth): ManagerContext,
    Path(user_id): Path<Uuid>,
) -> Result<Json<ResetResponse>, BillingError> {
    let balance = state.services.hours.reset_monthly_balance(user_id).await?;
    Ok(Json(ResetResponse { balance }))
}

async fn pause_subscription(
    State(state): State<AppState>,
    ManagerContext(_auth): ManagerContext,
    Path(subscription_id): Path<Uuid>,
) -> Result<Json<Subscription>, BillingError> {
    Ok(Json(
        state
            .services
            .subscriptions
            .pause_subscription(subscription_id)
            .await?,
    ))
}

async fn resume_subscription(
    State(state): State<AppState>,
    ManagerContext(_auth): ManagerContext,
    Path(subscription_id): Path<Uuid>,
) -> Result<Json<Subscription>, BillingError> {
    Ok(Json(
        state
            .services
            .subscriptions
            .resume_subscription(subscription_id)
            .await?,
    ))
}

async fn renew_subscription(
    State(state): State<AppState>,
    ManagerContext(_auth): ManagerContext,
    Path(subscription_id): Path<Uuid>,
) -> Result<Json<Invoice>, BillingError> {
    Ok(Json(
        state
            .services
            .orchestrator
            .renew_subscription(subscription_id)
            .await?,
    ))
}

async fn pay_invoice(
    State(state): State<AppState>,
    ManagerContext(_auth): ManagerContext,
    Path(invoice_id): Path<Uuid>,
) -> Result<Json<Invoice>, BillingError> {
    Ok(Json(
        state.services.orchestrator.pay_invoice(invoice_id).await?,
    ))
}

async fn fail_invoice(
    State(state): State<AppState>,
    ManagerContext(_auth): ManagerContext,
    Path(invoice_id): Path<Uuid>,
    Json(req): Json<FailInvoiceRequest>,
) -> Result<Json<Invoice>, BillingError> {
    req.validate()?;
    Ok(Json(
        state
            .services
            .invoices
            .mark_as_failed(invoice_id, req.reason)
            .await?,
    ))
}

async fn record_time_entry(
    State(state): State<AppState>,
    ManagerContext(_auth): ManagerContext,
    Json(req): Json<TimeEntryRequest>,
) -> Result<(StatusCode, Json<TimeEntryResponse>), BillingError> {
    req.validate()?;
    let (time_log, balance) = state
        .services
        .hours
        .record_time_entry(NewTimeLog {
            client_id: req.client_id,
            project_id: req.project_id,
            project_title: req.project_title,
            task_name: req.task_name,
            duration_minutes: req.duration_minutes,
            start_time: req.start_time,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(TimeEntryResponse { time_log, balance })))
}
