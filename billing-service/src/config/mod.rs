use crate::models::PlanCatalog;
use crate::services::policy::{RolloverPolicy, UsagePolicy};
use rust_decimal::Decimal;
use secrecy::Secret;
use service_core::config::{self as core_config, get_env, is_production, parse_env};
use service_core::error::AppError;
use std::env;

#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    /// `None` runs the service on the in-memory store.
    pub database: Option<DatabaseConfig>,
    pub stripe: StripeConfig,
    pub pricing: PricingConfig,
    pub notifications: NotificationSettings,
    pub policies: PolicyConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: Secret<String>,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub api_base_url: String,
    pub secret_key: Secret<String>,
}

#[derive(Debug, Clone)]
pub struct PricingConfig {
    pub currency: String,
    pub extra_hour_price_minor_units: i64,
    pub catalog: PlanCatalog,
}

#[derive(Debug, Clone)]
pub struct NotificationSettings {
    pub dedup_window_seconds: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct PolicyConfig {
    pub usage: UsagePolicy,
    pub rollover: RolloverPolicy,
}

impl BillingConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;
        let is_prod = is_production();

        let database = match env::var("BILLING_DATABASE_URL") {
            Ok(url) => Some(DatabaseConfig {
                url: Secret::new(url),
                max_connections: parse_env("BILLING_DB_MAX_CONNECTIONS", 10),
                min_connections: parse_env("BILLING_DB_MIN_CONNECTIONS", 1),
            }),
            Err(_) if is_prod => {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "BILLING_DATABASE_URL is required in production but not set"
                )))
            }
            Err(_) => None,
        };

        let threshold: Decimal = parse_env("LOW_BALANCE_WARNING_PERCENT", Decimal::from(80));
        let usage_name = env::var("USAGE_POLICY").unwrap_or_else(|_| "soft".to_string());
        let usage = UsagePolicy::parse(&usage_name, threshold).ok_or_else(|| {
            AppError::ConfigError(anyhow::anyhow!("Unknown USAGE_POLICY '{}'", usage_name))
        })?;

        let rollover_cap = env::var("ROLLOVER_CAP_HOURS")
            .ok()
            .and_then(|v| v.parse::<Decimal>().ok());
        let rollover_name = env::var("ROLLOVER_POLICY").unwrap_or_else(|_| "forfeit".to_string());
        let rollover = RolloverPolicy::parse(&rollover_name, rollover_cap).ok_or_else(|| {
            AppError::ConfigError(anyhow::anyhow!(
                "Unknown ROLLOVER_POLICY '{}'",
                rollover_name
            ))
        })?;

        Ok(BillingConfig {
            common,
            service_name: env::var("SERVICE_NAME").unwrap_or_else(|_| "billing-service".to_string()),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok(),
            database,
            stripe: StripeConfig {
                api_base_url: env::var("STRIPE_API_BASE")
                    .unwrap_or_else(|_| "https://api.stripe.com/v1".to_string()),
                secret_key: Secret::new(get_env("STRIPE_SECRET_KEY", Some(""), is_prod)?),
            },
            pricing: PricingConfig {
                currency: env::var("BILLING_CURRENCY").unwrap_or_else(|_| "usd".to_string()),
                extra_hour_price_minor_units: parse_env("EXTRA_HOUR_PRICE_MINOR_UNITS", 7500),
                catalog: PlanCatalog::default(),
            },
            notifications: NotificationSettings {
                dedup_window_seconds: parse_env("NOTIFICATION_DEDUP_SECONDS", 300),
            },
            policies: PolicyConfig { usage, rollover },
        })
    }
}
