//! Client-facing billing routes. Every route acts on the caller's own records.

use crate::error::BillingError;
use crate::handlers::auth::ClientContext;
use crate::models::{
    BillingSummary, HoursBalanceView, Invoice, InvoiceDocument, Notification, PaymentHistoryFilter,
    PaymentMethod, PaymentStatus, ProjectUsage, Subscription,
};
use crate::services::periods::calendar_month;
use crate::services::SetupIntentResponse;
use crate::startup::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/billing/summary", get(billing_summary))
        .route("/invoices", get(list_invoices))
        .route("/invoices/:id", get(get_invoice))
        .route("/invoices/:id/document", get(render_invoice))
        .route("/invoices/:id/cancel", post(cancel_invoice))
        .route("/payments/history", get(payment_history))
        .route("/subscription", get(active_subscription))
        .route("/subscription/upgrade", post(upgrade_subscription))
        .route("/subscription/cancel", post(cancel_subscription))
        .route("/hours/balance", get(current_balance))
        .route("/hours/history", get(balance_history))
        .route("/hours/usage", get(usage_by_project))
        .route("/hours/purchase", post(purchase_hours))
        .route("/payment-methods", get(list_payment_methods))
        .route("/payment-methods/setup-intent", post(create_setup_intent))
        .route("/payment-methods/confirm", post(confirm_payment_method))
        .route("/payment-methods/:id/default", post(set_default_payment_method))
        .route("/payment-methods/:id", delete(delete_payment_method))
        .route("/notifications", get(list_notifications))
        .route("/notifications/unread-count", get(unread_count))
        .route("/notifications/read-all", post(mark_all_read))
        .route("/notifications/:id/read", post(mark_read))
}

// ============================================================================
// Request/Response DTOs
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct InvoiceListQuery {
    pub status: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct PaymentHistoryQuery {
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    #[validate(range(min = 1, max = 200))]
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct HistoryQuery {
    #[validate(range(min = 1, max = 60))]
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct UsageQuery {
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpgradeRequest {
    #[validate(length(min = 1, max = 32))]
    pub plan: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct PurchaseHoursRequest {
    #[validate(range(min = 1, max = 1000))]
    pub hours: i32,
    pub payment_method_id: Option<Uuid>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ConfirmPaymentMethodRequest {
    #[validate(length(min = 1, max = 255))]
    pub setup_intent_id: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct NotificationQuery {
    #[validate(range(min = 1, max = 100))]
    pub limit: Option<i64>,
    #[serde(default)]
    pub unread_only: bool,
}

#[derive(Debug, Serialize)]
pub struct SubscriptionResponse {
    pub subscription: Option<Subscription>,
}

#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    pub balance: Option<HoursBalanceView>,
}

#[derive(Debug, Serialize)]
pub struct UnreadCountResponse {
    pub unread: i64,
}

#[derive(Debug, Serialize)]
pub struct MarkedReadResponse {
    pub updated: u64,
}

// ============================================================================
// Invoices and payments
// ============================================================================

async fn billing_summary(
    State(state): State<AppState>,
    ClientContext(auth): ClientContext,
) -> Result<Json<BillingSummary>, BillingError> {
    Ok(Json(
        state.services.invoices.get_billing_summary(auth.user_id).await?,
    ))
}

async fn list_invoices(
    State(state): State<AppState>,
    ClientContext(auth): ClientContext,
    Query(query): Query<InvoiceListQuery>,
) -> Result<Json<Vec<Invoice>>, BillingError> {
    let status = match query.status.as_deref() {
        Some(s) => Some(PaymentStatus::parse(s).ok_or_else(|| {
            BillingError::Validation(format!("Unknown invoice status '{}'", s))
        })?),
        None => None,
    };
    Ok(Json(
        state
            .services
            .invoices
            .get_client_invoices(auth.user_id, status)
            .await?,
    ))
}

async fn get_invoice(
    State(state): State<AppState>,
    ClientContext(auth): ClientContext,
    Path(invoice_id): Path<Uuid>,
) -> Result<Json<Invoice>, BillingError> {
    Ok(Json(
        state
            .services
            .invoices
            .get_invoice_by_id(invoice_id, Some(auth.user_id))
            .await?,
    ))
}

async fn render_invoice(
    State(state): State<AppState>,
    ClientContext(auth): ClientContext,
    Path(invoice_id): Path<Uuid>,
) -> Result<Json<InvoiceDocument>, BillingError> {
    Ok(Json(
        state
            .services
            .invoices
            .render_invoice(invoice_id, Some(auth.user_id))
            .await?,
    ))
}

async fn cancel_invoice(
    State(state): State<AppState>,
    ClientContext(auth): ClientContext,
    Path(invoice_id): Path<Uuid>,
) -> Result<Json<Invoice>, BillingError> {
    Ok(Json(
        state
            .services
            .invoices
            .cancel_invoice(invoice_id, Some(auth.user_id))
            .await?,
    ))
}

async fn payment_history(
    State(state): State<AppState>,
    ClientContext(auth): ClientContext,
    Query(query): Query<PaymentHistoryQuery>,
) -> Result<Json<Vec<Invoice>>, BillingError> {
    query.validate()?;
    let filter = PaymentHistoryFilter {
        start_date: query.start_date,
        end_date: query.end_date,
        limit: query.limit,
    };
    Ok(Json(
        state
            .services
            .invoices
            .get_payment_history(auth.user_id, filter)
            .await?,
    ))
}

async fn purchase_hours(
    State(state): State<AppState>,
    ClientContext(auth): ClientContext,
    Json(req): Json<PurchaseHoursRequest>,
) -> Result<(StatusCode, Json<Invoice>), BillingError> {
    req.validate()?;
    let invoice = state
        .services
        .orchestrator
        .purchase_extra_hours(auth.user_id, req.hours, req.payment_method_id)
        .await?;
    Ok((StatusCode::CREATED, Json(invoice)))
}

// ============================================================================
// Subscription
// ============================================================================

async fn active_subscription(
    State(state): State<AppState>,
    ClientContext(auth): ClientContext,
) -> Result<Json<SubscriptionResponse>, BillingError> {
    let subscription = state
        .services
        .subscriptions
        .get_active_subscription(auth.user_id)
        .await?;
    Ok(Json(SubscriptionResponse { subscription }))
}

async fn upgrade_subscription(
    State(state): State<AppState>,
    ClientContext(auth): ClientContext,
    Json(req): Json<UpgradeRequest>,
) -> Result<Json<Subscription>, BillingError> {
    req.validate()?;
    Ok(Json(
        state
            .services
            .subscriptions
            .change_plan(auth.user_id, &req.plan)
            .await?,
    ))
}

async fn cancel_subscription(
    State(state): State<AppState>,
    ClientContext(auth): ClientContext,
) -> Result<Json<Subscription>, BillingError> {
    Ok(Json(
        state
            .services
            .subscriptions
            .cancel_subscription(auth.user_id)
            .await?,
    ))
}

// ============================================================================
// Hours
// ============================================================================

async fn current_balance(
    State(state): State<AppState>,
    ClientContext(auth): ClientContext,
) -> Result<Json<BalanceResponse>, BillingError> {
    let balance = state.services.hours.get_current_balance(auth.user_id).await?;
    Ok(Json(BalanceResponse { balance }))
}

async fn balance_history(
    State(state): State<AppState>,
    ClientContext(auth): ClientContext,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<HoursBalanceView>>, BillingError> {
    query.validate()?;
    Ok(Json(
        state
            .services
            .hours
            .get_balance_history(auth.user_id, query.limit)
            .await?,
    ))
}

/// Defaults to the current calendar month.
async fn usage_by_project(
    State(state): State<AppState>,
    ClientContext(auth): ClientContext,
    Query(query): Query<UsageQuery>,
) -> Result<Json<Vec<ProjectUsage>>, BillingError> {
    let (month_start, month_end) = calendar_month(state.clock.now());
    Ok(Json(
        state
            .services
            .hours
            .get_usage_by_project(
                auth.user_id,
                query.start_date.unwrap_or(month_start),
                query.end_date.unwrap_or(month_end),
            )
            .await?,
    ))
}

// ============================================================================
// Payment methods
// ============================================================================

async fn list_payment_methods(
    State(state): State<AppState>,
    ClientContext(auth): ClientContext,
) -> Result<Json<Vec<PaymentMethod>>, BillingError> {
    Ok(Json(
        state
            .services
            .payment_methods
            .list_payment_methods(auth.user_id)
            .await?,
    ))
}

async fn create_setup_intent(
    State(state): State<AppState>,
    ClientContext(auth): ClientContext,
) -> Result<Json<SetupIntentResponse>, BillingError> {
    Ok(Json(
        state
            .services
            .payment_methods
            .create_setup_intent(auth.user_id)
            .await?,
    ))
}

async fn confirm_payment_method(
    State(state): State<AppState>,
    ClientContext(auth): ClientContext,
    Json(req): Json<ConfirmPaymentMethodRequest>,
) -> Result<(StatusCode, Json<PaymentMethod>), BillingError> {
    req.validate()?;
    let method = state
        .services
        .payment_methods
        .confirm_payment_method(auth.user_id, &req.setup_intent_id)
        .await?;
    Ok((StatusCode::CREATED, Json(method)))
}

async fn set_default_payment_method(
    State(state): State<AppState>,
    ClientContext(auth): ClientContext,
    Path(payment_method_id): Path<Uuid>,
) -> Result<Json<PaymentMethod>, BillingError> {
    Ok(Json(
        state
            .services
            .payment_methods
            .set_default_payment_method(auth.user_id, payment_method_id)
            .await?,
    ))
}

async fn delete_payment_method(
    State(state): State<AppState>,
    ClientContext(auth): ClientContext,
    Path(payment_method_id): Path<Uuid>,
) -> Result<StatusCode, BillingError> {
    state
        .services
        .payment_methods
        .delete_payment_method(auth.user_id, payment_method_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Notifications
// ============================================================================

async fn list_notifications(
    State(state): State<AppState>,
    ClientContext(auth): ClientContext,
    Query(query): Query<NotificationQuery>,
) -> Result<Json<Vec<Notification>>, BillingError> {
    query.validate()?;
    Ok(Json(
        state
            .services
            .notifications
            .list_notifications(auth.user_id, query.limit.unwrap_or(20), query.unread_only)
            .await?,
    ))
}

async fn unread_count(
    State(state): State<AppState>,
    ClientContext(auth): ClientContext,
) -> Result<Json<UnreadCountResponse>, BillingError> {
    let unread = state.services.notifications.unread_count(auth.user_id).await?;
    Ok(Json(UnreadCountResponse { unread }))
}

async fn mark_read(
    State(state): State<AppState>,
    ClientContext(auth): ClientContext,
    Path(notification_id): Path<Uuid>,
) -> Result<StatusCode, BillingError> {
    state
        .services
        .notifications
        .mark_as_read(auth.user_id, notification_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn mark_all_read(
    State(state): State<AppState>,
    ClientContext(auth): ClientContext,
) -> Result<Json<MarkedReadResponse>, BillingError> {
    let updated = state
        .services
        .notifications
        .mark_all_as_read(auth.user_id)
        .await?;
    Ok(Json(MarkedReadResponse { updated }))
}
