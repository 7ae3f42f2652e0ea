//! Services module for billing-service.

pub mod activation;
pub mod clock;
pub mod database;
pub mod gateway;
pub mod hours;
pub mod invoices;
pub mod memory;
pub mod metrics;
pub mod notifications;
pub mod payment_methods;
pub mod periods;
pub mod policy;
pub mod store;
pub mod subscriptions;

pub use activation::{ActivationResult, ActivationStage, BillingOrchestrator};
pub use clock::{Clock, FixedClock, SystemClock};
pub use database::Database;
pub use gateway::{MockPaymentGateway, PaymentGateway, StripeGateway};
pub use hours::HoursLedger;
pub use invoices::InvoiceGenerator;
pub use memory::MemoryStore;
pub use metrics::{get_metrics, init_metrics};
pub use notifications::{NotificationEmitter, NotificationService};
pub use payment_methods::{PaymentMethodService, SetupIntentResponse};
pub use policy::{RolloverPolicy, UsagePolicy};
pub use store::{BillingStore, TimeLogWrite, UsageWrite};
pub use subscriptions::SubscriptionManager;

use crate::config::BillingConfig;
use crate::models::PlanCatalog;
use std::sync::Arc;

/// Pricing, policy and notification settings shared by the services.
#[derive(Debug, Clone)]
pub struct BillingSettings {
    pub catalog: PlanCatalog,
    pub currency: String,
    pub extra_hour_price_minor_units: i64,
    pub notification_dedup_seconds: i64,
    pub usage_policy: UsagePolicy,
    pub rollover_policy: RolloverPolicy,
}

impl Default for BillingSettings {
    fn default() -> Self {
        Self {
            catalog: PlanCatalog::default(),
            currency: "usd".to_string(),
            extra_hour_price_minor_units: 7500,
            notification_dedup_seconds: 300,
            usage_policy: UsagePolicy::default(),
            rollover_policy: RolloverPolicy::default(),
        }
    }
}

impl From<&BillingConfig> for BillingSettings {
    fn from(config: &BillingConfig) -> Self {
        Self {
            catalog: config.pricing.catalog.clone(),
            currency: config.pricing.currency.clone(),
            extra_hour_price_minor_units: config.pricing.extra_hour_price_minor_units,
            notification_dedup_seconds: config.notifications.dedup_window_seconds,
            usage_policy: config.policies.usage,
            rollover_policy: config.policies.rollover,
        }
    }
}

/// Every billing service wired over one store, payment gateway and clock.
#[derive(Clone)]
pub struct BillingServices {
    pub store: Arc<dyn BillingStore>,
    pub notifications: Arc<NotificationService>,
    pub subscriptions: Arc<SubscriptionManager>,
    pub hours: Arc<HoursLedger>,
    pub invoices: Arc<InvoiceGenerator>,
    pub orchestrator: Arc<BillingOrchestrator>,
    pub payment_methods: Arc<PaymentMethodService>,
}

impl BillingServices {
    pub fn new(
        store: Arc<dyn BillingStore>,
        gateway: Arc<dyn PaymentGateway>,
        clock: Arc<dyn Clock>,
        settings: BillingSettings,
    ) -> Self {
        let catalog = Arc::new(settings.catalog);

        let notifications = Arc::new(NotificationService::new(
            store.clone(),
            clock.clone(),
            chrono::Duration::seconds(settings.notification_dedup_seconds),
        ));
        let notifier: Arc<dyn NotificationEmitter> = notifications.clone();

        let subscriptions = Arc::new(SubscriptionManager::new(
            store.clone(),
            catalog.clone(),
            clock.clone(),
            notifier.clone(),
            settings.currency.clone(),
        ));
        let hours = Arc::new(HoursLedger::new(
            store.clone(),
            clock.clone(),
            notifier.clone(),
            settings.usage_policy,
            settings.rollover_policy,
        ));
        let invoices = Arc::new(InvoiceGenerator::new(
            store.clone(),
            clock.clone(),
            notifier,
            subscriptions.clone(),
            hours.clone(),
            settings.currency.clone(),
        ));
        let orchestrator = Arc::new(BillingOrchestrator::new(
            store.clone(),
            gateway.clone(),
            catalog,
            clock.clone(),
            subscriptions.clone(),
            invoices.clone(),
            settings.currency,
            settings.extra_hour_price_minor_units,
        ));
        let payment_methods = Arc::new(PaymentMethodService::new(store.clone(), gateway, clock));

        Self {
            store,
            notifications,
            subscriptions,
            hours,
            invoices,
            orchestrator,
            payment_methods,
        }
    }
}
