//! Database service for billing-service.

use crate::models::{
    Customer, HoursBalance, Invoice, InvoiceStatusChange, NewNotification, Notification,
    PaymentHistoryFilter, PaymentMethod, PaymentStatus, ProjectUsage, Subscription,
    SubscriptionStatus, TimeLog,
};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::store::{ActivationRecords, BillingStore, TimeLogWrite, UsageWrite};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

fn map_db_error(action: &str, e: sqlx::Error) -> AppError {
    match e {
        sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
            AppError::Conflict(anyhow::anyhow!(
                "Failed to {}: {}",
                action,
                db_err.constraint().unwrap_or("unique constraint violated")
            ))
        }
        sqlx::Error::Database(ref db_err) if db_err.is_foreign_key_violation() => {
            AppError::NotFound(anyhow::anyhow!(
                "Failed to {}: {}",
                action,
                db_err.constraint().unwrap_or("referenced row does not exist")
            ))
        }
        _ => AppError::DatabaseError(anyhow::anyhow!("Failed to {}: {}", action, e)),
    }
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "billing-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl BillingStore for Database {
    /// Check database health.
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;

        timer.observe_duration();
        Ok(())
    }

    // =========================================================================
    // Customer Operations
    // =========================================================================

    #[instrument(skip(self), fields(user_id = %user_id))]
    async fn get_customer(&self, user_id: Uuid) -> Result<Option<Customer>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_customer"])
            .start_timer();

        let customer = sqlx::query_as::<_, Customer>(
            r#"
            SELECT user_id, email, full_name, external_customer_id, created_utc
            FROM customers
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_db_error("get customer", e))?;

        timer.observe_duration();
        Ok(customer)
    }

    #[instrument(skip(self, customer), fields(user_id = %customer.user_id))]
    async fn upsert_customer(&self, customer: &Customer) -> Result<Customer, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["upsert_customer"])
            .start_timer();

        let saved = sqlx::query_as::<_, Customer>(
            r#"
            INSERT INTO customers (user_id, email, full_name, external_customer_id, created_utc)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (user_id) DO UPDATE
            SET email = EXCLUDED.email,
                full_name = EXCLUDED.full_name,
                external_customer_id = COALESCE(EXCLUDED.external_customer_id, customers.external_customer_id)
            RETURNING user_id, email, full_name, external_customer_id, created_utc
            "#,
        )
        .bind(customer.user_id)
        .bind(&customer.email)
        .bind(&customer.full_name)
        .bind(&customer.external_customer_id)
        .bind(customer.created_utc)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_db_error("upsert customer", e))?;

        timer.observe_duration();
        Ok(saved)
    }

    #[instrument(skip(self), fields(user_id = %user_id))]
    async fn set_external_customer_id(
        &self,
        user_id: Uuid,
        external_customer_id: &str,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["set_external_customer_id"])
            .start_timer();

        let result = sqlx::query("UPDATE customers SET external_customer_id = $2 WHERE user_id = $1")
            .bind(user_id)
            .bind(external_customer_id)
            .execute(&self.pool)
            .await
            .map_err(|e| map_db_error("set external customer id", e))?;

        timer.observe_duration();

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(anyhow::anyhow!("Customer not found")));
        }
        Ok(())
    }

    // =========================================================================
    // Subscription Operations
    // =========================================================================

    #[instrument(skip(self, subscription), fields(user_id = %subscription.user_id))]
    async fn insert_subscription(
        &self,
        subscription: &Subscription,
    ) -> Result<Subscription, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_subscription"])
            .start_timer();

        let saved = insert_subscription_query(subscription)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_db_error("create subscription", e))?;

        timer.observe_duration();
        info!(subscription_id = %saved.subscription_id, plan = %saved.plan, "Subscription created");

        Ok(saved)
    }

    #[instrument(skip(self), fields(subscription_id = %subscription_id))]
    async fn get_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Option<Subscription>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_subscription"])
            .start_timer();

        let subscription = sqlx::query_as::<_, Subscription>(
            r#"
            SELECT subscription_id, user_id, plan, status, billing_interval, price_amount, currency, monthly_hours, start_date, current_period_start, current_period_end, next_billing_date, cancelled_at, created_utc, updated_utc
            FROM subscriptions
            WHERE subscription_id = $1
            "#,
        )
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_db_error("get subscription", e))?;

        timer.observe_duration();
        Ok(subscription)
    }

    #[instrument(skip(self), fields(user_id = %user_id))]
    async fn find_active_subscription(
        &self,
        user_id: Uuid,
    ) -> Result<Option<Subscription>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_active_subscription"])
            .start_timer();

        let subscription = sqlx::query_as::<_, Subscription>(
            r#"
            SELECT subscription_id, user_id, plan, status, billing_interval, price_amount, currency, monthly_hours, start_date, current_period_start, current_period_end, next_billing_date, cancelled_at, created_utc, updated_utc
            FROM subscriptions
            WHERE user_id = $1 AND status = 'active'
            ORDER BY created_utc DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_db_error("find active subscription", e))?;

        timer.observe_duration();
        Ok(subscription)
    }

    #[instrument(skip(self), fields(user_id = %user_id))]
    async fn list_subscriptions(
        &self,
        user_id: Uuid,
        status: Option<SubscriptionStatus>,
    ) -> Result<Vec<Subscription>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_subscriptions"])
            .start_timer();

        let subscriptions = sqlx::query_as::<_, Subscription>(
            r#"
            SELECT subscription_id, user_id, plan, status, billing_interval, price_amount, currency, monthly_hours, start_date, current_period_start, current_period_end, next_billing_date, cancelled_at, created_utc, updated_utc
            FROM subscriptions
            WHERE user_id = $1 AND ($2::VARCHAR IS NULL OR status = $2)
            ORDER BY created_utc DESC
            "#,
        )
        .bind(user_id)
        .bind(status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_db_error("list subscriptions", e))?;

        timer.observe_duration();
        Ok(subscriptions)
    }

    #[instrument(skip(self, subscription), fields(subscription_id = %subscription.subscription_id))]
    async fn update_subscription(
        &self,
        subscription: &Subscription,
    ) -> Result<Subscription, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_subscription"])
            .start_timer();

        let saved = sqlx::query_as::<_, Subscription>(
            r#"
            UPDATE subscriptions
            SET plan = $2, status = $3, price_amount = $4, monthly_hours = $5,
                current_period_start = $6, current_period_end = $7, next_billing_date = $8,
                cancelled_at = $9, updated_utc = $10
            WHERE subscription_id = $1
            RETURNING subscription_id, user_id, plan, status, billing_interval, price_amount, currency, monthly_hours, start_date, current_period_start, current_period_end, next_billing_date, cancelled_at, created_utc, updated_utc
            "#,
        )
        .bind(subscription.subscription_id)
        .bind(&subscription.plan)
        .bind(&subscription.status)
        .bind(subscription.price_amount)
        .bind(subscription.monthly_hours)
        .bind(subscription.current_period_start)
        .bind(subscription.current_period_end)
        .bind(subscription.next_billing_date)
        .bind(subscription.cancelled_at)
        .bind(subscription.updated_utc)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_db_error("update subscription", e))?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Subscription not found")))?;

        timer.observe_duration();
        info!(status = %saved.status, "Subscription updated");

        Ok(saved)
    }

    // =========================================================================
    // Hours Balance Operations
    // =========================================================================

    #[instrument(skip(self, balance), fields(user_id = %balance.user_id))]
    async fn insert_balance(&self, balance: &HoursBalance) -> Result<HoursBalance, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_balance"])
            .start_timer();

        let saved = insert_balance_query(balance)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_db_error("create hours balance", e))?;

        timer.observe_duration();
        Ok(saved)
    }

    #[instrument(skip(self), fields(balance_id = %balance_id))]
    async fn get_balance(&self, balance_id: Uuid) -> Result<Option<HoursBalance>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_balance"])
            .start_timer();

        let balance = sqlx::query_as::<_, HoursBalance>(
            r#"
            SELECT balance_id, user_id, subscription_id, period_start, period_end, allocated_hours, bonus_hours, extra_purchased_hours, rollover_hours, minutes_used, created_utc, updated_utc
            FROM hours_balances
            WHERE balance_id = $1
            "#,
        )
        .bind(balance_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_db_error("get hours balance", e))?;

        timer.observe_duration();
        Ok(balance)
    }

    #[instrument(skip(self), fields(user_id = %user_id))]
    async fn find_balance_covering(
        &self,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<HoursBalance>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_balance_covering"])
            .start_timer();

        let balance = sqlx::query_as::<_, HoursBalance>(
            r#"
            SELECT balance_id, user_id, subscription_id, period_start, period_end, allocated_hours, bonus_hours, extra_purchased_hours, rollover_hours, minutes_used, created_utc, updated_utc
            FROM hours_balances
            WHERE user_id = $1 AND period_start <= $2 AND period_end >= $2
            ORDER BY period_start DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .bind(at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_db_error("find current hours balance", e))?;

        timer.observe_duration();
        Ok(balance)
    }

    #[instrument(skip(self), fields(user_id = %user_id))]
    async fn find_open_balance(
        &self,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<HoursBalance>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_open_balance"])
            .start_timer();

        let balance = sqlx::query_as::<_, HoursBalance>(
            r#"
            SELECT balance_id, user_id, subscription_id, period_start, period_end, allocated_hours, bonus_hours, extra_purchased_hours, rollover_hours, minutes_used, created_utc, updated_utc
            FROM hours_balances
            WHERE user_id = $1 AND period_end >= $2
            ORDER BY period_start ASC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .bind(at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_db_error("find open hours balance", e))?;

        timer.observe_duration();
        Ok(balance)
    }

    #[instrument(skip(self), fields(user_id = %user_id))]
    async fn find_balance_for_period(
        &self,
        user_id: Uuid,
        period_start: DateTime<Utc>,
    ) -> Result<Option<HoursBalance>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_balance_for_period"])
            .start_timer();

        let balance = sqlx::query_as::<_, HoursBalance>(
            r#"
            SELECT balance_id, user_id, subscription_id, period_start, period_end, allocated_hours, bonus_hours, extra_purchased_hours, rollover_hours, minutes_used, created_utc, updated_utc
            FROM hours_balances
            WHERE user_id = $1 AND period_start = $2
            "#,
        )
        .bind(user_id)
        .bind(period_start)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_db_error("find hours balance for period", e))?;

        timer.observe_duration();
        Ok(balance)
    }

    #[instrument(skip(self), fields(user_id = %user_id))]
    async fn list_balances(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> Result<Vec<HoursBalance>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_balances"])
            .start_timer();

        let balances = sqlx::query_as::<_, HoursBalance>(
            r#"
            SELECT balance_id, user_id, subscription_id, period_start, period_end, allocated_hours, bonus_hours, extra_purchased_hours, rollover_hours, minutes_used, created_utc, updated_utc
            FROM hours_balances
            WHERE user_id = $1
            ORDER BY period_start DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_db_error("list hours balances", e))?;

        timer.observe_duration();
        Ok(balances)
    }

    #[instrument(skip(self), fields(balance_id = %balance_id))]
    async fn add_minutes_used(
        &self,
        balance_id: Uuid,
        minutes: i64,
        within_allowance: bool,
    ) -> Result<UsageWrite, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["add_minutes_used"])
            .start_timer();

        let mut conn = self.pool.acquire().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to acquire connection: {}", e))
        })?;
        let write = add_minutes_used_on(&mut *conn, balance_id, minutes, within_allowance).await?;

        timer.observe_duration();
        Ok(write)
    }

    #[instrument(skip(self), fields(balance_id = %balance_id))]
    async fn add_extra_hours(
        &self,
        balance_id: Uuid,
        hours: i32,
    ) -> Result<Option<HoursBalance>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["add_extra_hours"])
            .start_timer();

        let balance = sqlx::query_as::<_, HoursBalance>(
            r#"
            UPDATE hours_balances
            SET extra_purchased_hours = extra_purchased_hours + $2, updated_utc = NOW()
            WHERE balance_id = $1
            RETURNING balance_id, user_id, subscription_id, period_start, period_end, allocated_hours, bonus_hours, extra_purchased_hours, rollover_hours, minutes_used, created_utc, updated_utc
            "#,
        )
        .bind(balance_id)
        .bind(hours)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_db_error("add purchased hours", e))?;

        timer.observe_duration();
        Ok(balance)
    }

    // =========================================================================
    // Invoice Operations
    // =========================================================================

    #[instrument(skip(self, invoice), fields(invoice_number = %invoice.invoice_number))]
    async fn insert_invoice(&self, invoice: &Invoice) -> Result<Invoice, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_invoice"])
            .start_timer();

        let saved = insert_invoice_query(invoice)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_db_error("create invoice", e))?;

        timer.observe_duration();
        info!(invoice_id = %saved.invoice_id, total = saved.total, "Invoice created");

        Ok(saved)
    }

    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    async fn get_invoice(&self, invoice_id: Uuid) -> Result<Option<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_invoice"])
            .start_timer();

        let invoice = sqlx::query_as::<_, Invoice>(
            r#"
            SELECT invoice_id, invoice_number, user_id, subscription_id, transaction_type, description, subtotal, tax, total, hours_purchased, currency, status, invoice_date, due_date, paid_at, payment_method_id, external_payment_reference_id, created_utc, updated_utc
            FROM invoices
            WHERE invoice_id = $1
            "#,
        )
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_db_error("get invoice", e))?;

        timer.observe_duration();
        Ok(invoice)
    }

    #[instrument(skip(self, change), fields(invoice_id = %invoice_id, status = %change.status.as_str()))]
    async fn update_invoice_status(
        &self,
        invoice_id: Uuid,
        change: &InvoiceStatusChange,
    ) -> Result<Option<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_invoice_status"])
            .start_timer();

        let invoice = sqlx::query_as::<_, Invoice>(
            r#"
            UPDATE invoices
            SET status = $2,
                paid_at = COALESCE($3, paid_at),
                payment_method_id = COALESCE($4, payment_method_id),
                external_payment_reference_id = COALESCE($5, external_payment_reference_id),
                description = COALESCE($6, description),
                updated_utc = NOW()
            WHERE invoice_id = $1
            RETURNING invoice_id, invoice_number, user_id, subscription_id, transaction_type, description, subtotal, tax, total, hours_purchased, currency, status, invoice_date, due_date, paid_at, payment_method_id, external_payment_reference_id, created_utc, updated_utc
            "#,
        )
        .bind(invoice_id)
        .bind(change.status.as_str())
        .bind(change.paid_at)
        .bind(change.payment_method_id)
        .bind(&change.external_payment_reference_id)
        .bind(&change.description)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_db_error("update invoice status", e))?;

        timer.observe_duration();
        Ok(invoice)
    }

    #[instrument(skip(self), fields(user_id = %user_id))]
    async fn list_invoices(
        &self,
        user_id: Uuid,
        status: Option<PaymentStatus>,
    ) -> Result<Vec<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_invoices"])
            .start_timer();

        let invoices = sqlx::query_as::<_, Invoice>(
            r#"
            SELECT invoice_id, invoice_number, user_id, subscription_id, transaction_type, description, subtotal, tax, total, hours_purchased, currency, status, invoice_date, due_date, paid_at, payment_method_id, external_payment_reference_id, created_utc, updated_utc
            FROM invoices
            WHERE user_id = $1 AND ($2::VARCHAR IS NULL OR status = $2)
            ORDER BY invoice_date DESC, created_utc DESC
            "#,
        )
        .bind(user_id)
        .bind(status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_db_error("list invoices", e))?;

        timer.observe_duration();
        Ok(invoices)
    }

    #[instrument(skip(self, filter), fields(user_id = %user_id))]
    async fn list_paid_invoices(
        &self,
        user_id: Uuid,
        filter: &PaymentHistoryFilter,
    ) -> Result<Vec<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_paid_invoices"])
            .start_timer();

        let invoices = sqlx::query_as::<_, Invoice>(
            r#"
            SELECT invoice_id, invoice_number, user_id, subscription_id, transaction_type, description, subtotal, tax, total, hours_purchased, currency, status, invoice_date, due_date, paid_at, payment_method_id, external_payment_reference_id, created_utc, updated_utc
            FROM invoices
            WHERE user_id = $1 AND status = 'paid'
              AND ($2::TIMESTAMPTZ IS NULL OR paid_at >= $2)
              AND ($3::TIMESTAMPTZ IS NULL OR paid_at <= $3)
            ORDER BY paid_at DESC
            LIMIT $4
            "#,
        )
        .bind(user_id)
        .bind(filter.start_date)
        .bind(filter.end_date)
        .bind(filter.limit.unwrap_or(50))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_db_error("list payment history", e))?;

        timer.observe_duration();
        Ok(invoices)
    }

    #[instrument(skip(self))]
    async fn count_invoices(&self) -> Result<i64, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["count_invoices"])
            .start_timer();

        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM invoices")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_db_error("count invoices", e))?;

        timer.observe_duration();
        Ok(count)
    }

    // =========================================================================
    // Activation
    // =========================================================================

    #[instrument(skip(self, records), fields(user_id = %records.subscription.user_id))]
    async fn record_activation(
        &self,
        records: &ActivationRecords,
    ) -> Result<ActivationRecords, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["record_activation"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let subscription = insert_subscription_query(&records.subscription)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_db_error("create subscription", e))?;

        let invoice = insert_invoice_query(&records.invoice)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_db_error("create invoice", e))?;

        let balance = match &records.balance {
            Some(balance) => Some(
                insert_balance_query(balance)
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(|e| map_db_error("create hours balance", e))?,
            ),
            None => None,
        };

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();
        info!(
            subscription_id = %subscription.subscription_id,
            invoice_id = %invoice.invoice_id,
            balance_created = balance.is_some(),
            "Activation records written"
        );

        Ok(ActivationRecords {
            subscription,
            invoice,
            balance,
        })
    }

    // =========================================================================
    // Payment Method Operations
    // =========================================================================

    #[instrument(skip(self, method), fields(user_id = %method.user_id))]
    async fn insert_payment_method(
        &self,
        method: &PaymentMethod,
    ) -> Result<PaymentMethod, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_payment_method"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        if method.is_default {
            sqlx::query("UPDATE payment_methods SET is_default = FALSE WHERE user_id = $1 AND is_default")
                .bind(method.user_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_db_error("clear default payment method", e))?;
        }

        let saved = sqlx::query_as::<_, PaymentMethod>(
            r#"
            INSERT INTO payment_methods (payment_method_id, user_id, method_type, is_default, card_brand, card_last_four, card_exp_month, card_exp_year, external_payment_method_id, billing_email, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING payment_method_id, user_id, method_type, is_default, card_brand, card_last_four, card_exp_month, card_exp_year, external_payment_method_id, billing_email, created_utc
            "#,
        )
        .bind(method.payment_method_id)
        .bind(method.user_id)
        .bind(&method.method_type)
        .bind(method.is_default)
        .bind(&method.card_brand)
        .bind(&method.card_last_four)
        .bind(method.card_exp_month)
        .bind(method.card_exp_year)
        .bind(&method.external_payment_method_id)
        .bind(&method.billing_email)
        .bind(method.created_utc)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_db_error("create payment method", e))?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();
        Ok(saved)
    }

    #[instrument(skip(self), fields(payment_method_id = %payment_method_id))]
    async fn get_payment_method(
        &self,
        payment_method_id: Uuid,
    ) -> Result<Option<PaymentMethod>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_payment_method"])
            .start_timer();

        let method = sqlx::query_as::<_, PaymentMethod>(
            r#"
            SELECT payment_method_id, user_id, method_type, is_default, card_brand, card_last_four, card_exp_month, card_exp_year, external_payment_method_id, billing_email, created_utc
            FROM payment_methods
            WHERE payment_method_id = $1
            "#,
        )
        .bind(payment_method_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_db_error("get payment method", e))?;

        timer.observe_duration();
        Ok(method)
    }

    #[instrument(skip(self), fields(user_id = %user_id))]
    async fn find_payment_method_by_external_id(
        &self,
        user_id: Uuid,
        external_payment_method_id: &str,
    ) -> Result<Option<PaymentMethod>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_payment_method_by_external_id"])
            .start_timer();

        let method = sqlx::query_as::<_, PaymentMethod>(
            r#"
            SELECT payment_method_id, user_id, method_type, is_default, card_brand, card_last_four, card_exp_month, card_exp_year, external_payment_method_id, billing_email, created_utc
            FROM payment_methods
            WHERE user_id = $1 AND external_payment_method_id = $2
            "#,
        )
        .bind(user_id)
        .bind(external_payment_method_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_db_error("find payment method", e))?;

        timer.observe_duration();
        Ok(method)
    }

    #[instrument(skip(self), fields(user_id = %user_id))]
    async fn list_payment_methods(&self, user_id: Uuid) -> Result<Vec<PaymentMethod>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_payment_methods"])
            .start_timer();

        let methods = sqlx::query_as::<_, PaymentMethod>(
            r#"
            SELECT payment_method_id, user_id, method_type, is_default, card_brand, card_last_four, card_exp_month, card_exp_year, external_payment_method_id, billing_email, created_utc
            FROM payment_methods
            WHERE user_id = $1
            ORDER BY is_default DESC, created_utc DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_db_error("list payment methods", e))?;

        timer.observe_duration();
        Ok(methods)
    }

    #[instrument(skip(self), fields(user_id = %user_id))]
    async fn default_payment_method(
        &self,
        user_id: Uuid,
    ) -> Result<Option<PaymentMethod>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["default_payment_method"])
            .start_timer();

        let method = sqlx::query_as::<_, PaymentMethod>(
            r#"
            SELECT payment_method_id, user_id, method_type, is_default, card_brand, card_last_four, card_exp_month, card_exp_year, external_payment_method_id, billing_email, created_utc
            FROM payment_methods
            WHERE user_id = $1 AND is_default
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_db_error("get default payment method", e))?;

        timer.observe_duration();
        Ok(method)
    }

    #[instrument(skip(self), fields(user_id = %user_id, payment_method_id = %payment_method_id))]
    async fn set_default_payment_method(
        &self,
        user_id: Uuid,
        payment_method_id: Uuid,
    ) -> Result<Option<PaymentMethod>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["set_default_payment_method"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        sqlx::query("UPDATE payment_methods SET is_default = FALSE WHERE user_id = $1 AND is_default")
            .bind(user_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_db_error("clear default payment method", e))?;

        let method = sqlx::query_as::<_, PaymentMethod>(
            r#"
            UPDATE payment_methods
            SET is_default = TRUE
            WHERE payment_method_id = $1 AND user_id = $2
            RETURNING payment_method_id, user_id, method_type, is_default, card_brand, card_last_four, card_exp_month, card_exp_year, external_payment_method_id, billing_email, created_utc
            "#,
        )
        .bind(payment_method_id)
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_db_error("set default payment method", e))?;

        if method.is_none() {
            tx.rollback().await.ok();
            timer.observe_duration();
            return Ok(None);
        }

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();
        Ok(method)
    }

    #[instrument(skip(self), fields(payment_method_id = %payment_method_id))]
    async fn delete_payment_method(&self, payment_method_id: Uuid) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["delete_payment_method"])
            .start_timer();

        let result = sqlx::query("DELETE FROM payment_methods WHERE payment_method_id = $1")
            .bind(payment_method_id)
            .execute(&self.pool)
            .await
            .map_err(|e| map_db_error("delete payment method", e))?;

        timer.observe_duration();
        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Notification Operations
    // =========================================================================

    #[instrument(skip(self, notification), fields(user_id = %notification.user_id))]
    async fn insert_notification(
        &self,
        notification: &Notification,
    ) -> Result<Notification, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_notification"])
            .start_timer();

        let saved = sqlx::query_as::<_, Notification>(
            r#"
            INSERT INTO notifications (notification_id, user_id, notification_type, title, message, action_url, action_label, is_read, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING notification_id, user_id, notification_type, title, message, action_url, action_label, is_read, created_utc
            "#,
        )
        .bind(notification.notification_id)
        .bind(notification.user_id)
        .bind(&notification.notification_type)
        .bind(&notification.title)
        .bind(&notification.message)
        .bind(&notification.action_url)
        .bind(&notification.action_label)
        .bind(notification.is_read)
        .bind(notification.created_utc)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_db_error("create notification", e))?;

        timer.observe_duration();
        Ok(saved)
    }

    #[instrument(skip(self, notification), fields(user_id = %notification.user_id))]
    async fn find_recent_notification(
        &self,
        notification: &NewNotification,
        since: DateTime<Utc>,
    ) -> Result<Option<Notification>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_recent_notification"])
            .start_timer();

        let existing = sqlx::query_as::<_, Notification>(
            r#"
            SELECT notification_id, user_id, notification_type, title, message, action_url, action_label, is_read, created_utc
            FROM notifications
            WHERE user_id = $1 AND notification_type = $2 AND title = $3 AND message = $4
              AND created_utc >= $5
            ORDER BY created_utc DESC
            LIMIT 1
            "#,
        )
        .bind(notification.user_id)
        .bind(notification.notification_type.as_str())
        .bind(&notification.title)
        .bind(&notification.message)
        .bind(since)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_db_error("find recent notification", e))?;

        timer.observe_duration();
        Ok(existing)
    }

    #[instrument(skip(self), fields(user_id = %user_id))]
    async fn list_notifications(
        &self,
        user_id: Uuid,
        limit: i64,
        unread_only: bool,
    ) -> Result<Vec<Notification>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_notifications"])
            .start_timer();

        let notifications = sqlx::query_as::<_, Notification>(
            r#"
            SELECT notification_id, user_id, notification_type, title, message, action_url, action_label, is_read, created_utc
            FROM notifications
            WHERE user_id = $1 AND (NOT $2 OR NOT is_read)
            ORDER BY created_utc DESC
            LIMIT $3
            "#,
        )
        .bind(user_id)
        .bind(unread_only)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_db_error("list notifications", e))?;

        timer.observe_duration();
        Ok(notifications)
    }

    #[instrument(skip(self), fields(user_id = %user_id))]
    async fn count_unread_notifications(&self, user_id: Uuid) -> Result<i64, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["count_unread_notifications"])
            .start_timer();

        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM notifications WHERE user_id = $1 AND NOT is_read",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_db_error("count unread notifications", e))?;

        timer.observe_duration();
        Ok(count)
    }

    #[instrument(skip(self), fields(user_id = %user_id, notification_id = %notification_id))]
    async fn mark_notification_read(
        &self,
        user_id: Uuid,
        notification_id: Uuid,
    ) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["mark_notification_read"])
            .start_timer();

        let result = sqlx::query(
            "UPDATE notifications SET is_read = TRUE WHERE notification_id = $1 AND user_id = $2",
        )
        .bind(notification_id)
        .bind(user_id)
        .execute(&self.pool)
        .await
        .map_err(|e| map_db_error("mark notification read", e))?;

        timer.observe_duration();
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), fields(user_id = %user_id))]
    async fn mark_all_notifications_read(&self, user_id: Uuid) -> Result<u64, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["mark_all_notifications_read"])
            .start_timer();

        let result = sqlx::query(
            "UPDATE notifications SET is_read = TRUE WHERE user_id = $1 AND NOT is_read",
        )
        .bind(user_id)
        .execute(&self.pool)
        .await
        .map_err(|e| map_db_error("mark notifications read", e))?;

        timer.observe_duration();
        Ok(result.rows_affected())
    }

    // =========================================================================
    // Time Log Operations
    // =========================================================================

    #[instrument(skip(self, time_log), fields(client_id = %time_log.client_id))]
    async fn record_time_log(
        &self,
        time_log: &TimeLog,
        balance_id: Option<Uuid>,
        within_allowance: bool,
    ) -> Result<TimeLogWrite, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["record_time_log"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let balance = match balance_id {
            Some(balance_id) => {
                match add_minutes_used_on(
                    &mut *tx,
                    balance_id,
                    i64::from(time_log.duration_minutes),
                    within_allowance,
                )
                .await?
                {
                    UsageWrite::Applied(balance) => Some(balance),
                    UsageWrite::BalanceMissing => None,
                    UsageWrite::OverAllowance => {
                        tx.rollback().await.map_err(|e| {
                            AppError::DatabaseError(anyhow::anyhow!(
                                "Failed to roll back transaction: {}",
                                e
                            ))
                        })?;
                        timer.observe_duration();
                        return Ok(TimeLogWrite::OverAllowance);
                    }
                }
            }
            None => None,
        };

        let saved = insert_time_log_query(time_log)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_db_error("create time log", e))?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();
        Ok(TimeLogWrite::Recorded {
            time_log: saved,
            balance,
        })
    }

    #[instrument(skip(self), fields(user_id = %user_id))]
    async fn usage_by_project(
        &self,
        user_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ProjectUsage>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["usage_by_project"])
            .start_timer();

        let usage = sqlx::query_as::<_, ProjectUsage>(
            r#"
            SELECT project_id,
                   project_title,
                   SUM(duration_minutes)::BIGINT AS total_minutes,
                   ROUND(SUM(duration_minutes)::NUMERIC / 60, 1) AS total_hours
            FROM time_logs
            WHERE client_id = $1 AND start_time >= $2 AND start_time <= $3
            GROUP BY project_id, project_title
            ORDER BY total_minutes DESC
            "#,
        )
        .bind(user_id)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_db_error("aggregate usage by project", e))?;

        timer.observe_duration();
        Ok(usage)
    }
}

type PgQueryAs<'q, T> = sqlx::query::QueryAs<'q, sqlx::Postgres, T, sqlx::postgres::PgArguments>;

fn insert_subscription_query(subscription: &Subscription) -> PgQueryAs<'_, Subscription> {
    sqlx::query_as::<_, Subscription>(
        r#"
        INSERT INTO subscriptions (subscription_id, user_id, plan, status, billing_interval, price_amount, currency, monthly_hours, start_date, current_period_start, current_period_end, next_billing_date, cancelled_at, created_utc, updated_utc)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
        RETURNING subscription_id, user_id, plan, status, billing_interval, price_amount, currency, monthly_hours, start_date, current_period_start, current_period_end, next_billing_date, cancelled_at, created_utc, updated_utc
        "#,
    )
    .bind(subscription.subscription_id)
    .bind(subscription.user_id)
    .bind(&subscription.plan)
    .bind(&subscription.status)
    .bind(&subscription.billing_interval)
    .bind(subscription.price_amount)
    .bind(&subscription.currency)
    .bind(subscription.monthly_hours)
    .bind(subscription.start_date)
    .bind(subscription.current_period_start)
    .bind(subscription.current_period_end)
    .bind(subscription.next_billing_date)
    .bind(subscription.cancelled_at)
    .bind(subscription.created_utc)
    .bind(subscription.updated_utc)
}

fn insert_invoice_query(invoice: &Invoice) -> PgQueryAs<'_, Invoice> {
    sqlx::query_as::<_, Invoice>(
        r#"
        INSERT INTO invoices (invoice_id, invoice_number, user_id, subscription_id, transaction_type, description, subtotal, tax, total, hours_purchased, currency, status, invoice_date, due_date, paid_at, payment_method_id, external_payment_reference_id, created_utc, updated_utc)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
        RETURNING invoice_id, invoice_number, user_id, subscription_id, transaction_type, description, subtotal, tax, total, hours_purchased, currency, status, invoice_date, due_date, paid_at, payment_method_id, external_payment_reference_id, created_utc, updated_utc
        "#,
    )
    .bind(invoice.invoice_id)
    .bind(&invoice.invoice_number)
    .bind(invoice.user_id)
    .bind(invoice.subscription_id)
    .bind(&invoice.transaction_type)
    .bind(&invoice.description)
    .bind(invoice.subtotal)
    .bind(invoice.tax)
    .bind(invoice.total)
    .bind(invoice.hours_purchased)
    .bind(&invoice.currency)
    .bind(&invoice.status)
    .bind(invoice.invoice_date)
    .bind(invoice.due_date)
    .bind(invoice.paid_at)
    .bind(invoice.payment_method_id)
    .bind(&invoice.external_payment_reference_id)
    .bind(invoice.created_utc)
    .bind(invoice.updated_utc)
}

fn insert_balance_query(balance: &HoursBalance) -> PgQueryAs<'_, HoursBalance> {
    sqlx::query_as::<_, HoursBalance>(
        r#"
        INSERT INTO hours_balances (balance_id, user_id, subscription_id, period_start, period_end, allocated_hours, bonus_hours, extra_purchased_hours, rollover_hours, minutes_used, created_utc, updated_utc)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        RETURNING balance_id, user_id, subscription_id, period_start, period_end, allocated_hours, bonus_hours, extra_purchased_hours, rollover_hours, minutes_used, created_utc, updated_utc
        "#,
    )
    .bind(balance.balance_id)
    .bind(balance.user_id)
    .bind(balance.subscription_id)
    .bind(balance.period_start)
    .bind(balance.period_end)
    .bind(balance.allocated_hours)
    .bind(balance.bonus_hours)
    .bind(balance.extra_purchased_hours)
    .bind(balance.rollover_hours)
    .bind(balance.minutes_used)
    .bind(balance.created_utc)
    .bind(balance.updated_utc)
}

fn insert_time_log_query(time_log: &TimeLog) -> PgQueryAs<'_, TimeLog> {
    sqlx::query_as::<_, TimeLog>(
        r#"
        INSERT INTO time_logs (time_log_id, client_id, project_id, project_title, task_name, duration_minutes, start_time, created_utc)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        RETURNING time_log_id, client_id, project_id, project_title, task_name, duration_minutes, start_time, created_utc
        "#,
    )
    .bind(time_log.time_log_id)
    .bind(time_log.client_id)
    .bind(time_log.project_id)
    .bind(&time_log.project_title)
    .bind(&time_log.task_name)
    .bind(time_log.duration_minutes)
    .bind(time_log.start_time)
    .bind(time_log.created_utc)
}

/// Conditional increment shared by the pooled and transactional paths. The allowance check
/// is part of the `UPDATE` so concurrent writers cannot both pass it.
async fn add_minutes_used_on(
    conn: &mut sqlx::PgConnection,
    balance_id: Uuid,
    minutes: i64,
    within_allowance: bool,
) -> Result<UsageWrite, AppError> {
    let updated = sqlx::query_as::<_, HoursBalance>(
        r#"
        UPDATE hours_balances
        SET minutes_used = minutes_used + $2, updated_utc = NOW()
        WHERE balance_id = $1
          AND (NOT $3
               OR (allocated_hours + bonus_hours + extra_purchased_hours + rollover_hours) * 60 - minutes_used >= $2)
        RETURNING balance_id, user_id, subscription_id, period_start, period_end, allocated_hours, bonus_hours, extra_purchased_hours, rollover_hours, minutes_used, created_utc, updated_utc
        "#,
    )
    .bind(balance_id)
    .bind(minutes)
    .bind(within_allowance)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| map_db_error("update minutes used", e))?;

    if let Some(balance) = updated {
        return Ok(UsageWrite::Applied(balance));
    }

    let exists: bool =
        sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM hours_balances WHERE balance_id = $1)")
            .bind(balance_id)
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| map_db_error("check hours balance", e))?;

    Ok(if exists {
        UsageWrite::OverAllowance
    } else {
        UsageWrite::BalanceMissing
    })
}
