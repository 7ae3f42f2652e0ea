//! Domain models for billing-service.

mod customer;
mod hours_balance;
mod invoice;
mod notification;
mod payment_method;
mod plan;
mod subscription;
mod time_log;

pub use customer::Customer;
pub use hours_balance::{HoursBalance, HoursBalanceView};
pub(crate) use hours_balance::percentage_of;
pub use invoice::{
    to_major_units, BillingSummary, Invoice, InvoiceDocument, InvoiceLine, InvoiceParty,
    InvoiceStatusChange, PaymentDetails, PaymentHistoryFilter, PaymentStatus, TransactionType,
};
pub use notification::{NewNotification, Notification, NotificationType};
pub use payment_method::{PaymentMethod, PaymentMethodType};
pub use plan::{BillingInterval, PlanCatalog, PlanDefinition, SubscriptionPlan};
pub use subscription::{CreateSubscription, Subscription, SubscriptionPatch, SubscriptionStatus};
pub use time_log::{minutes_to_hours, NewTimeLog, ProjectUsage, TimeLog};
